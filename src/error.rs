// src/error.rs
//! Typed failures for framing, payload decoding and joining.

use thiserror::Error;

use crate::protocol::event::PayloadType;

pub type FrameResult<T> = Result<T, FrameError>;
pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error after {offset} bytes: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("file magic mismatch: got {got:?}")]
    MagicMismatch { got: [u8; 4] },
    #[error("file version {got} does not match the parser version {expected}")]
    UnsupportedVersion { got: u8, expected: u8 },
    #[error("unknown segment type {kind:#x} after {offset} bytes")]
    UnknownSegment { kind: u32, offset: u64 },
    #[error("truncated {what} after {offset} bytes")]
    Truncated { what: &'static str, offset: u64 },
    #[error("segment of {size} bytes exceeds limit of {max} bytes")]
    SegmentTooLarge { size: usize, max: usize },
}

impl FrameError {
    /// Fatal errors poison the whole stream; everything else may be treated as
    /// end-of-stream by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FrameError::MagicMismatch { .. }
                | FrameError::UnsupportedVersion { .. }
                | FrameError::UnknownSegment { .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("truncated {what}: need {need} bytes, {have} left")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("unknown {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: u8 },
    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
    #[error("decompression failed: {reason}")]
    Decompress { reason: String },
}

/// Why a dedup payload could not be applied to the cache.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DedupError {
    #[error("payload is malformed: {source}")]
    Payload {
        #[source]
        source: DecodeError,
    },
    #[error("fragment {id} is malformed: {source}")]
    Fragment {
        id: u64,
        #[source]
        source: DecodeError,
    },
}

impl DedupError {
    pub fn decode_error(&self) -> &DecodeError {
        match self {
            DedupError::Payload { source } | DedupError::Fragment { source, .. } => source,
        }
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("malformed event: {0}")]
    Malformed(#[from] DecodeError),
    #[error("dedup payload of event [{event_id}] rejected: {source}")]
    Dedup {
        event_id: String,
        #[source]
        source: DedupError,
    },
    #[error("payload type {payload_type} is not supported by this joiner")]
    Unsupported { payload_type: PayloadType },
}
