// src/services/mod.rs

pub mod dedup;         // LRU of shared context fragments
pub mod reward;        // outcome reducers + multistep suffix rewards
pub mod loop_info;     // sticky loop configuration
pub mod joined_event;  // interaction records, labels, apprentice rules
pub mod decoder;       // record decoder contract (+ JSON reference impl)
pub mod metrics;
pub mod joiner;        // single-step joiner
pub mod episode;       // step ordering from previous_id links
pub mod multistep;     // episode joiner
pub mod parser;        // reader loop: frames -> joiner

// Public API
pub use decoder::{JsonRecordDecoder, RecordDecoder};
pub use dedup::LruDedupCache;
pub use joiner::{ExampleJoiner, Joiner};
pub use metrics::JoinerMetrics;
pub use multistep::MultistepJoiner;
pub use parser::BinaryParser;
