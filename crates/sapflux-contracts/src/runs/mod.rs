pub mod layout;
pub mod metadata;
pub mod store;
pub mod summary;
