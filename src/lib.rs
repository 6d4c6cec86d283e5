// src/lib.rs
//! Joins interaction, outcome and dedup events from decision-service logs
//! into learnable records.

pub mod config;
pub mod error;
pub mod protocol;
pub mod services;
pub mod utils;

pub use config::JoinerConfig;
pub use error::{DecodeError, DedupError, FrameError, JoinError};
pub use services::{BinaryParser, ExampleJoiner, Joiner, JsonRecordDecoder, MultistepJoiner};
