// src/services/decoder.rs
//! Turns interaction context bytes into consumer records.
//!
//! Shared fragments from dedup payloads are owned by the decoder; the dedup
//! cache only holds the decoder's handles and gives them back on eviction.

use serde_json::{Map, Value};

use crate::error::{DecodeError, DecodeResult, DedupError};
use crate::protocol::event::{DedupInfo, Event};
use crate::services::dedup::LruDedupCache;
use crate::services::joined_event::{LabeledLine, LineKind};

pub trait RecordDecoder {
    type Record: Clone;
    type Fragment;

    /// Decodes one value of a dedup payload.
    fn decode_fragment(&mut self, bytes: &[u8]) -> DecodeResult<Self::Fragment>;

    /// Decodes a context, resolving shared fragments through `cache`.
    fn decode_context(
        &self,
        context: &[u8],
        cache: &LruDedupCache<Self::Fragment>,
    ) -> DecodeResult<Vec<LabeledLine<Self::Record>>>;

    fn release(&mut self, fragment: Self::Fragment);
}

/// Applies a dedup payload: unseen ids are decoded and cached, known ids are
/// bumped, then everything behind the payload's first id is evicted.
/// Compressed payloads may inflate to at most `limit` bytes.
/// Returns the number of evicted fragments.
pub fn apply_dedup_payload<D: RecordDecoder>(
    decoder: &mut D,
    cache: &mut LruDedupCache<D::Fragment>,
    event: &Event,
    limit: usize,
) -> Result<usize, DedupError> {
    let dedup: DedupInfo = event
        .decode_payload_within(limit)
        .map_err(|source| DedupError::Payload { source })?;
    for (id, value) in dedup.ids.iter().zip(&dedup.values) {
        if cache.exists(*id) {
            cache.update(*id);
            continue;
        }
        let fragment = decoder
            .decode_fragment(value)
            .map_err(|source| DedupError::Fragment { id: *id, source })?;
        if let Some(old) = cache.add(*id, fragment) {
            decoder.release(old);
        }
    }
    let Some(&first) = dedup.ids.first() else {
        return Ok(0);
    };
    Ok(cache.clear_after(first, |f| decoder.release(f)))
}

const MULTI_KEY: &str = "_multi";
const SLOTS_KEY: &str = "_slots";
const ACTION_ID_KEY: &str = "__aid";

/// Handle into the decoder's fragment arena. Not `Clone` so a fragment has a
/// single owner at any time.
#[derive(Debug, PartialEq, Eq)]
pub struct FragmentHandle(usize);

/// Reference decoder for JSON contexts.
#[derive(Debug, Default)]
pub struct JsonRecordDecoder {
    arena: Vec<Option<Value>>,
    free: Vec<usize>,
}

impl JsonRecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_fragments(&self) -> usize {
        self.arena.len() - self.free.len()
    }

    fn fragment(&self, handle: &FragmentHandle) -> Option<&Value> {
        self.arena.get(handle.0).and_then(Option::as_ref)
    }

    fn resolve_action(
        &self,
        action: &Value,
        cache: &LruDedupCache<FragmentHandle>,
    ) -> DecodeResult<Value> {
        let Some(id) = action
            .as_object()
            .filter(|o| o.len() == 1)
            .and_then(|o| o.get(ACTION_ID_KEY))
        else {
            return Ok(action.clone());
        };
        let id = id.as_u64().ok_or_else(|| DecodeError::Invalid {
            what: "__aid",
            reason: format!("expected an unsigned id, got {id}"),
        })?;
        cache
            .get(id)
            .and_then(|h| self.fragment(h))
            .cloned()
            .ok_or_else(|| DecodeError::Invalid {
                what: "__aid",
                reason: format!("dedup id {id} is not cached"),
            })
    }
}

fn parse(bytes: &[u8], what: &'static str) -> DecodeResult<Value> {
    serde_json::from_slice(bytes).map_err(|e| DecodeError::Invalid {
        what,
        reason: e.to_string(),
    })
}

fn take_array(obj: &mut Map<String, Value>, key: &'static str) -> DecodeResult<Vec<Value>> {
    match obj.remove(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(DecodeError::Invalid {
            what: key,
            reason: format!("expected an array, got {other}"),
        }),
    }
}

impl RecordDecoder for JsonRecordDecoder {
    type Record = Value;
    type Fragment = FragmentHandle;

    fn decode_fragment(&mut self, bytes: &[u8]) -> DecodeResult<FragmentHandle> {
        let value = parse(bytes, "dedup fragment")?;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(value);
                slot
            }
            None => {
                self.arena.push(Some(value));
                self.arena.len() - 1
            }
        };
        Ok(FragmentHandle(slot))
    }

    fn decode_context(
        &self,
        context: &[u8],
        cache: &LruDedupCache<FragmentHandle>,
    ) -> DecodeResult<Vec<LabeledLine<Value>>> {
        let Value::Object(mut shared) = parse(context, "context")? else {
            return Err(DecodeError::Invalid {
                what: "context",
                reason: "expected a JSON object".to_string(),
            });
        };
        let actions = take_array(&mut shared, MULTI_KEY)?;
        let slots = take_array(&mut shared, SLOTS_KEY)?;

        let mut lines = Vec::with_capacity(1 + actions.len() + slots.len());
        lines.push(LabeledLine::new(LineKind::Shared, Value::Object(shared)));
        for action in &actions {
            lines.push(LabeledLine::new(
                LineKind::Action,
                self.resolve_action(action, cache)?,
            ));
        }
        for slot in slots {
            lines.push(LabeledLine::new(LineKind::Slot, slot));
        }
        Ok(lines)
    }

    fn release(&mut self, fragment: FragmentHandle) {
        if let Some(slot) = self.arena.get_mut(fragment.0) {
            if slot.take().is_some() {
                self.free.push(fragment.0);
            }
        }
    }
}
