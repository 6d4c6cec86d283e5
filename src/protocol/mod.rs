// src/protocol/mod.rs

pub mod codec;   // little-endian primitives
pub mod event;   // metadata, envelopes, payload records
pub mod frame;   // VWFB segment framing

pub use codec::{WireCodec, WireReader, WireWriter};
pub use event::{Envelope, Event, JoinedPayload, Metadata, PayloadType};
pub use frame::{FrameReader, FrameWriter, Segment, SegmentKind};
