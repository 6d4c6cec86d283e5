// src/protocol/frame.rs
//! Joined-log framing: `VWFB` magic, a version word, then typed segments.
//!
//! Every sized segment is `type:u32 size:u32 payload pad`, where the pad is
//! `size % 8` bytes of the payload that was just read.

use std::io::{ErrorKind, Read, Write};

use bytes::Bytes;

use crate::error::{FrameError, FrameResult};

pub const MAGIC: [u8; 4] = *b"VWFB";
pub const VERSION: u8 = 1;

pub const MSG_TYPE_HEADER: u32 = 0x5555_5555;
pub const MSG_TYPE_CHECKPOINT: u32 = 0x1111_1111;
pub const MSG_TYPE_REGULAR: u32 = 0xFFFF_FFFF;
pub const MSG_TYPE_REWARD_FUNCTION_INFO: u32 = 0x7777_7777;
pub const MSG_TYPE_EOF: u32 = 0xAAAA_AAAA;

pub const DEFAULT_MAX_SEGMENT_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Header,
    Checkpoint,
    Regular,
    RewardFunctionInfo,
}

impl SegmentKind {
    pub fn code(self) -> u32 {
        match self {
            SegmentKind::Header => MSG_TYPE_HEADER,
            SegmentKind::Checkpoint => MSG_TYPE_CHECKPOINT,
            SegmentKind::Regular => MSG_TYPE_REGULAR,
            SegmentKind::RewardFunctionInfo => MSG_TYPE_REWARD_FUNCTION_INFO,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            MSG_TYPE_HEADER => Some(SegmentKind::Header),
            MSG_TYPE_CHECKPOINT => Some(SegmentKind::Checkpoint),
            MSG_TYPE_REGULAR => Some(SegmentKind::Regular),
            MSG_TYPE_REWARD_FUNCTION_INFO => Some(SegmentKind::RewardFunctionInfo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Header(Bytes),
    Checkpoint(Bytes),
    Regular(Bytes),
    RewardFunctionInfo(Bytes),
    Eof,
}

impl Segment {
    fn new(kind: SegmentKind, payload: Bytes) -> Self {
        match kind {
            SegmentKind::Header => Segment::Header(payload),
            SegmentKind::Checkpoint => Segment::Checkpoint(payload),
            SegmentKind::Regular => Segment::Regular(payload),
            SegmentKind::RewardFunctionInfo => Segment::RewardFunctionInfo(payload),
        }
    }
}

enum Fill {
    Full,
    Empty,
    Partial,
}

pub struct FrameReader<R> {
    reader: R,
    max_segment_bytes: usize,
    preamble_read: bool,
    pending_pad: usize,
    finished: bool,
    bytes_read: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_segment_bytes: usize) -> Self {
        Self {
            reader,
            max_segment_bytes,
            preamble_read: false,
            pending_pad: 0,
            finished: false,
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Checks magic and version. Called lazily by `next_segment`.
    pub fn read_preamble(&mut self) -> FrameResult<()> {
        if self.preamble_read {
            return Ok(());
        }
        let mut magic = [0u8; 4];
        self.read_exact_or(&mut magic, "magic")?;
        if magic != MAGIC {
            return Err(FrameError::MagicMismatch { got: magic });
        }
        // The version is a 4-byte word, not a single byte: only its first
        // byte carries the version, the other three are reserved and skipped.
        let mut version = [0u8; 4];
        self.read_exact_or(&mut version, "version")?;
        if version[0] != VERSION {
            return Err(FrameError::UnsupportedVersion {
                got: version[0],
                expected: VERSION,
            });
        }
        self.preamble_read = true;
        Ok(())
    }

    pub fn next_segment(&mut self) -> FrameResult<Segment> {
        if self.finished {
            return Ok(Segment::Eof);
        }
        self.read_preamble()?;

        if self.pending_pad > 0 {
            let mut pad = [0u8; 8];
            let len = self.pending_pad;
            self.read_exact_or(&mut pad[..len], "padding")?;
            self.pending_pad = 0;
        }

        let mut word = [0u8; 4];
        match self.fill(&mut word)? {
            Fill::Full => {}
            // running out of bytes exactly at a segment boundary ends the stream
            Fill::Empty => {
                self.finished = true;
                return Ok(Segment::Eof);
            }
            Fill::Partial => {
                return Err(FrameError::Truncated {
                    what: "segment type",
                    offset: self.bytes_read,
                });
            }
        }
        let code = u32::from_le_bytes(word);
        if code == MSG_TYPE_EOF {
            self.finished = true;
            return Ok(Segment::Eof);
        }
        let Some(kind) = SegmentKind::from_code(code) else {
            return Err(FrameError::UnknownSegment {
                kind: code,
                offset: self.bytes_read,
            });
        };

        self.read_exact_or(&mut word, "segment size")?;
        let size = u32::from_le_bytes(word) as usize;
        if size > self.max_segment_bytes {
            return Err(FrameError::SegmentTooLarge {
                size,
                max: self.max_segment_bytes,
            });
        }
        let mut payload = vec![0u8; size];
        self.read_exact_or(&mut payload, "segment payload")?;
        self.pending_pad = size % 8;
        Ok(Segment::new(kind, Bytes::from(payload)))
    }

    fn read_exact_or(&mut self, buf: &mut [u8], what: &'static str) -> FrameResult<()> {
        match self.fill(buf)? {
            Fill::Full => Ok(()),
            Fill::Empty | Fill::Partial => Err(FrameError::Truncated {
                what,
                offset: self.bytes_read,
            }),
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> FrameResult<Fill> {
        let mut read = 0usize;
        while read < buf.len() {
            match self.reader.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(FrameError::Io {
                        offset: self.bytes_read,
                        source,
                    });
                }
            }
        }
        self.bytes_read += read as u64;
        Ok(if read == buf.len() {
            Fill::Full
        } else if read == 0 {
            Fill::Empty
        } else {
            Fill::Partial
        })
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_preamble(&mut self) -> FrameResult<()> {
        self.put(&MAGIC)?;
        self.put(&[VERSION, 0, 0, 0])
    }

    pub fn write_segment(&mut self, kind: SegmentKind, payload: &[u8]) -> FrameResult<()> {
        let size = u32::try_from(payload.len()).map_err(|_| FrameError::SegmentTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        self.put(&kind.code().to_le_bytes())?;
        self.put(&size.to_le_bytes())?;
        self.put(payload)?;
        let pad = [0u8; 8];
        self.put(&pad[..payload.len() % 8])
    }

    pub fn write_eof(&mut self) -> FrameResult<()> {
        self.put(&MSG_TYPE_EOF.to_le_bytes())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn put(&mut self, bytes: &[u8]) -> FrameResult<()> {
        self.writer
            .write_all(bytes)
            .map_err(|source| FrameError::Io { offset: 0, source })
    }
}
