//! Decomposition protocol: batched request rendering, response segmentation,
//! restricted literal parsing and the local fallback.

mod fallback;
mod outcome;
mod parse;
mod record;
mod render;
mod request;
mod segment;

pub use fallback::{
    synthesize_fallback, FallbackPolicy, FallbackScaling, CONJUNCTION, DEFAULT_STEP_BUDGET,
};
pub use outcome::{resolve_parsed, Decomposition, DecompositionOrigin};
pub use parse::{
    extract_mapping_block, parse_batched_response, parse_segment, within_step_budget, ParseFailure,
};
pub use record::{check_schedule, DecompositionRecord, RecordError, STAGES_KEY, SWITCH_STEPS_KEY};
pub use render::{render_mapping_literal, render_response_block};
pub use request::{
    normalize_prompt_text, read_request_prompts, sentinel, BatchPayload, BatchRequest,
    PromptTemplates, OUTPUT_MARKER,
};
pub use segment::{find_sentinels, segment_response, Segmentation, SentinelMatch};
