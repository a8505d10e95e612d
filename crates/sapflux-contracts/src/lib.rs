pub mod decomposition;
pub mod events;
pub mod prompts;
pub mod runs;
