// src/services/parser.rs
//! Pull-based reader loop that feeds frame segments to a joiner.

use std::io::Read;

use tracing::{debug, info, warn};

use crate::error::{FrameResult, JoinError};
use crate::protocol::codec::WireCodec;
use crate::protocol::event::{CheckpointInfo, JoinedPayload, RewardFunctionInfo};
use crate::protocol::frame::{FrameReader, Segment};
use crate::services::joined_event::ExampleLine;
use crate::services::joiner::Joiner;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserStats {
    pub batches_read: u64,
    pub batches_skipped: u64,
    pub events_read: u64,
    pub events_rejected: u64,
    pub checkpoints: u64,
}

pub struct BinaryParser<R> {
    frames: FrameReader<R>,
    header_read: bool,
    reward_function_info_applied: bool,
    stats: ParserStats,
}

impl<R: Read> BinaryParser<R> {
    pub fn new(reader: R, max_segment_bytes: usize) -> Self {
        Self {
            frames: FrameReader::new(reader, max_segment_bytes),
            header_read: false,
            reward_function_info_applied: false,
            stats: ParserStats::default(),
        }
    }

    pub fn stats(&self) -> &ParserStats {
        &self.stats
    }

    pub fn bytes_read(&self) -> u64 {
        self.frames.bytes_read()
    }

    /// Fills `out` with the next joined example. `Ok(false)` means the stream
    /// ended. Errors whose `is_fatal()` is false may be treated as end of stream.
    pub fn parse_examples<J: Joiner>(
        &mut self,
        joiner: &mut J,
        out: &mut Vec<ExampleLine<J::Record>>,
    ) -> FrameResult<bool> {
        loop {
            while joiner.processing_batch() {
                if joiner.process_joined(out) {
                    return Ok(true);
                }
                if joiner.current_event_is_skip_learn() {
                    debug!("joined event is skip-learn, moving on");
                }
            }

            match self.frames.next_segment()? {
                Segment::Header(_) => {
                    if self.header_read {
                        debug!(bytes_read = self.bytes_read(), "additional header segment");
                    }
                    self.header_read = true;
                }
                Segment::Checkpoint(payload) => {
                    self.stats.checkpoints += 1;
                    if payload.is_empty() {
                        continue;
                    }
                    match CheckpointInfo::decode_bytes(payload) {
                        Ok(info) => {
                            debug!(?info, "applying checkpoint info");
                            joiner.apply_checkpoint(&info);
                        }
                        Err(e) => warn!(error = %e, "checkpoint info is malformed, ignoring"),
                    }
                }
                Segment::RewardFunctionInfo(payload) => {
                    if self.reward_function_info_applied {
                        warn!("reward function info already applied for this stream, ignoring");
                        continue;
                    }
                    match RewardFunctionInfo::decode_bytes(payload) {
                        Ok(info) => {
                            joiner.set_reward_function(info.reward_function, false);
                            joiner.set_default_reward(info.default_reward, false);
                            self.reward_function_info_applied = true;
                        }
                        Err(e) => warn!(error = %e, "reward function info is malformed, ignoring"),
                    }
                }
                Segment::Regular(payload) => self.process_regular(joiner, payload),
                Segment::Eof => {
                    info!(
                        bytes_read = self.bytes_read(),
                        batches = self.stats.batches_read,
                        "reached end of stream"
                    );
                    return Ok(false);
                }
            }
        }
    }

    fn process_regular<J: Joiner>(&mut self, joiner: &mut J, payload: bytes::Bytes) {
        if !joiner.joiner_ready() {
            warn!(
                missing = ?joiner.loop_info().missing_fields(),
                "joiner is not configured yet, skipping regular message"
            );
            self.stats.batches_skipped += 1;
            return;
        }
        let batch = match JoinedPayload::decode_bytes(payload) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, bytes_read = self.bytes_read(), "regular payload is malformed, skipping");
                self.stats.batches_skipped += 1;
                return;
            }
        };

        self.stats.batches_read += 1;
        joiner.on_new_batch();
        for envelope in &batch.envelopes {
            self.stats.events_read += 1;
            match joiner.process_event(envelope) {
                Ok(()) => {}
                Err(e @ JoinError::Dedup { .. }) => {
                    // the joiner dropped the whole batch; resume at the next segment
                    warn!(error = %e, "batch abandoned");
                    self.stats.events_rejected += 1;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "event rejected");
                    self.stats.events_rejected += 1;
                }
            }
        }
        joiner.on_batch_read();
    }
}
