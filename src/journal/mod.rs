//! Journal: per-stack pipeline event log and config hashing.

pub mod events;
pub mod hasher;

pub use events::{append_event, PipelineEvent};
pub use hasher::hash_value;
