// src/protocol/event.rs
//! Event envelopes, metadata and the per-type payload records.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, DecodeResult};
use crate::protocol::codec::{WireCodec, WireReader, WireWriter};
use crate::protocol::frame::DEFAULT_MAX_SEGMENT_BYTES;
use crate::services::reward::RewardFunctionKind;
use crate::utils::compression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    Cb,
    Ccb,
    Slates,
    Ca,
    Outcome,
    DedupInfo,
    MultiStep,
    Episode,
}

impl PayloadType {
    pub fn tag(self) -> u8 {
        match self {
            PayloadType::Cb => 0,
            PayloadType::Ccb => 1,
            PayloadType::Slates => 2,
            PayloadType::Ca => 3,
            PayloadType::Outcome => 4,
            PayloadType::DedupInfo => 5,
            PayloadType::MultiStep => 6,
            PayloadType::Episode => 7,
        }
    }

    pub fn from_tag(tag: u8) -> DecodeResult<Self> {
        Ok(match tag {
            0 => PayloadType::Cb,
            1 => PayloadType::Ccb,
            2 => PayloadType::Slates,
            3 => PayloadType::Ca,
            4 => PayloadType::Outcome,
            5 => PayloadType::DedupInfo,
            6 => PayloadType::MultiStep,
            7 => PayloadType::Episode,
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "payload_type",
                    tag,
                });
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PayloadType::Cb => "CB",
            PayloadType::Ccb => "CCB",
            PayloadType::Slates => "Slates",
            PayloadType::Ca => "CA",
            PayloadType::Outcome => "Outcome",
            PayloadType::DedupInfo => "DedupInfo",
            PayloadType::MultiStep => "MultiStep",
            PayloadType::Episode => "Episode",
        }
    }

    pub fn is_interaction(self) -> bool {
        matches!(
            self,
            PayloadType::Cb | PayloadType::Ccb | PayloadType::Slates | PayloadType::Ca
        )
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProblemType {
    Unknown,
    Cb,
    Ccb,
    Slates,
    Ca,
    Multistep,
}

impl ProblemType {
    pub fn tag(self) -> u8 {
        match self {
            ProblemType::Unknown => 0,
            ProblemType::Cb => 1,
            ProblemType::Ccb => 2,
            ProblemType::Slates => 3,
            ProblemType::Ca => 4,
            ProblemType::Multistep => 5,
        }
    }

    pub fn from_tag(tag: u8) -> DecodeResult<Self> {
        Ok(match tag {
            0 => ProblemType::Unknown,
            1 => ProblemType::Cb,
            2 => ProblemType::Ccb,
            3 => ProblemType::Slates,
            4 => ProblemType::Ca,
            5 => ProblemType::Multistep,
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "problem_type",
                    tag,
                });
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProblemType::Unknown => "UNKNOWN",
            ProblemType::Cb => "CB",
            ProblemType::Ccb => "CCB",
            ProblemType::Slates => "SLATES",
            ProblemType::Ca => "CA",
            ProblemType::Multistep => "MULTISTEP",
        }
    }

    /// Case-insensitive comparison against the type an interaction declares.
    pub fn accepts(self, payload_type: PayloadType) -> bool {
        self.as_str().eq_ignore_ascii_case(payload_type.as_str())
    }
}

impl fmt::Display for ProblemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    Online,
    Apprentice,
    LoggingOnly,
}

impl LearningMode {
    pub fn tag(self) -> u8 {
        match self {
            LearningMode::Online => 0,
            LearningMode::Apprentice => 1,
            LearningMode::LoggingOnly => 2,
        }
    }

    pub fn from_tag(tag: u8) -> DecodeResult<Self> {
        match tag {
            0 => Ok(LearningMode::Online),
            1 => Ok(LearningMode::Apprentice),
            2 => Ok(LearningMode::LoggingOnly),
            tag => Err(DecodeError::UnknownTag {
                what: "learning_mode",
                tag,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventEncoding {
    #[default]
    Identity,
    Compressed,
}

impl EventEncoding {
    fn from_tag(tag: u8) -> DecodeResult<Self> {
        match tag {
            0 => Ok(EventEncoding::Identity),
            1 => Ok(EventEncoding::Compressed),
            tag => Err(DecodeError::UnknownTag {
                what: "encoding",
                tag,
            }),
        }
    }

    fn tag(self) -> u8 {
        match self {
            EventEncoding::Identity => 0,
            EventEncoding::Compressed => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub id: String,
    pub payload_type: PayloadType,
    pub app_id: Option<String>,
    pub pass_probability: f32,
    pub encoding: EventEncoding,
    pub client_time: Option<DateTime<Utc>>,
}

impl Metadata {
    pub fn new(id: impl Into<String>, payload_type: PayloadType) -> Self {
        Self {
            id: id.into(),
            payload_type,
            app_id: None,
            pass_probability: 1.0,
            encoding: EventEncoding::Identity,
            client_time: None,
        }
    }

    pub fn probability_of_drop(&self) -> f32 {
        1.0 - self.pass_probability
    }
}

/// A decoded event: metadata plus its still-encoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub meta: Metadata,
    pub payload: Bytes,
}

impl Event {
    pub fn new(meta: Metadata, payload: Bytes) -> Self {
        Self { meta, payload }
    }

    /// Payload bytes with the event encoding undone, inflating at most
    /// [`DEFAULT_MAX_SEGMENT_BYTES`].
    pub fn payload_bytes(&self) -> DecodeResult<Bytes> {
        self.payload_bytes_within(DEFAULT_MAX_SEGMENT_BYTES)
    }

    /// Like [`Event::payload_bytes`] with an explicit inflate limit.
    pub fn payload_bytes_within(&self, limit: usize) -> DecodeResult<Bytes> {
        match self.meta.encoding {
            EventEncoding::Identity => Ok(self.payload.clone()),
            EventEncoding::Compressed => compression::decompress(&self.payload, limit),
        }
    }

    pub fn decode_payload<T: WireCodec>(&self) -> DecodeResult<T> {
        self.decode_payload_within(DEFAULT_MAX_SEGMENT_BYTES)
    }

    pub fn decode_payload_within<T: WireCodec>(&self, limit: usize) -> DecodeResult<T> {
        T::decode_bytes(self.payload_bytes_within(limit)?)
    }
}

impl WireCodec for Event {
    fn encode_to(&self, w: &mut WireWriter) {
        let m = &self.meta;
        w.string(&m.id).u8(m.payload_type.tag());
        w.optional(m.app_id.as_deref(), |w, s| {
            w.string(s);
        });
        w.f32(m.pass_probability).u8(m.encoding.tag());
        w.optional(m.client_time.as_ref(), |w, t| {
            w.timestamp(t);
        });
        w.blob(&self.payload);
    }

    fn decode_from(r: &mut WireReader) -> DecodeResult<Self> {
        let id = r.string("event_id")?;
        let payload_type = PayloadType::from_tag(r.u8("payload_type")?)?;
        let app_id = r.optional("app_id", |r| r.string("app_id"))?;
        let pass_probability = r.f32("pass_probability")?;
        let encoding = EventEncoding::from_tag(r.u8("encoding")?)?;
        let client_time = r.optional("client_time", |r| r.timestamp("client_time"))?;
        let payload = r.blob("payload")?;
        Ok(Self {
            meta: Metadata {
                id,
                payload_type,
                app_id,
                pass_probability,
                encoding,
                client_time,
            },
            payload,
        })
    }
}

/// One wire-level unit of a REGULAR segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(event: &Event, timestamp: DateTime<Utc>) -> Self {
        Self {
            event: event.encode(),
            timestamp,
        }
    }

    pub fn decode_event(&self) -> DecodeResult<Event> {
        Event::decode_bytes(self.event.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinedPayload {
    pub envelopes: Vec<Envelope>,
}

impl WireCodec for JoinedPayload {
    fn encode_to(&self, w: &mut WireWriter) {
        w.u32(u32::try_from(self.envelopes.len()).unwrap_or(u32::MAX));
        for env in &self.envelopes {
            w.timestamp(&env.timestamp).blob(&env.event);
        }
    }

    fn decode_from(r: &mut WireReader) -> DecodeResult<Self> {
        let count = r.u32("envelope_count")?;
        let mut envelopes = Vec::new();
        for _ in 0..count {
            let timestamp = r.timestamp("enqueued_time")?;
            let event = r.blob("event")?;
            envelopes.push(Envelope { event, timestamp });
        }
        Ok(Self { envelopes })
    }
}

// ---- payloads ----

#[derive(Debug, Clone, PartialEq)]
pub struct CbEvent {
    pub deferred: bool,
    pub context: Option<Bytes>,
    pub actions: Option<Vec<u32>>,
    pub probabilities: Option<Vec<f32>>,
    pub model_id: Option<String>,
    pub learning_mode: LearningMode,
}

impl WireCodec for CbEvent {
    fn encode_to(&self, w: &mut WireWriter) {
        w.bool(self.deferred);
        w.optional(self.context.as_deref(), |w, c| {
            w.blob(c);
        });
        w.optional(self.actions.as_deref(), |w, a| {
            w.vec_u32(a);
        });
        w.optional(self.probabilities.as_deref(), |w, p| {
            w.vec_f32(p);
        });
        w.optional(self.model_id.as_deref(), |w, m| {
            w.string(m);
        });
        w.u8(self.learning_mode.tag());
    }

    fn decode_from(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            deferred: r.bool("deferred")?,
            context: r.optional("context", |r| r.blob("context"))?,
            actions: r.optional("actions", |r| r.vec_u32("actions"))?,
            probabilities: r.optional("probabilities", |r| r.vec_f32("probabilities"))?,
            model_id: r.optional("model_id", |r| r.string("model_id"))?,
            learning_mode: LearningMode::from_tag(r.u8("learning_mode")?)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotEvent {
    pub slot_id: Option<String>,
    pub actions: Vec<u32>,
    pub probabilities: Vec<f32>,
}

/// CCB and Slates share one layout.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiSlotEvent {
    pub deferred: bool,
    pub context: Option<Bytes>,
    pub slots: Vec<SlotEvent>,
    pub baseline_actions: Vec<u32>,
    pub model_id: Option<String>,
    pub learning_mode: LearningMode,
}

impl WireCodec for MultiSlotEvent {
    fn encode_to(&self, w: &mut WireWriter) {
        w.bool(self.deferred);
        w.optional(self.context.as_deref(), |w, c| {
            w.blob(c);
        });
        w.u32(u32::try_from(self.slots.len()).unwrap_or(u32::MAX));
        for slot in &self.slots {
            w.optional(slot.slot_id.as_deref(), |w, s| {
                w.string(s);
            });
            w.vec_u32(&slot.actions).vec_f32(&slot.probabilities);
        }
        w.vec_u32(&self.baseline_actions);
        w.optional(self.model_id.as_deref(), |w, m| {
            w.string(m);
        });
        w.u8(self.learning_mode.tag());
    }

    fn decode_from(r: &mut WireReader) -> DecodeResult<Self> {
        let deferred = r.bool("deferred")?;
        let context = r.optional("context", |r| r.blob("context"))?;
        let n = r.u32("slot_count")?;
        let mut slots = Vec::new();
        for _ in 0..n {
            slots.push(SlotEvent {
                slot_id: r.optional("slot_id", |r| r.string("slot_id"))?,
                actions: r.vec_u32("slot_actions")?,
                probabilities: r.vec_f32("slot_probabilities")?,
            });
        }
        Ok(Self {
            deferred,
            context,
            slots,
            baseline_actions: r.vec_u32("baseline_actions")?,
            model_id: r.optional("model_id", |r| r.string("model_id"))?,
            learning_mode: LearningMode::from_tag(r.u8("learning_mode")?)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaEvent {
    pub deferred: bool,
    pub context: Option<Bytes>,
    pub action: f32,
    pub pdf_value: f32,
    pub model_id: Option<String>,
    pub learning_mode: LearningMode,
}

impl WireCodec for CaEvent {
    fn encode_to(&self, w: &mut WireWriter) {
        w.bool(self.deferred);
        w.optional(self.context.as_deref(), |w, c| {
            w.blob(c);
        });
        w.f32(self.action).f32(self.pdf_value);
        w.optional(self.model_id.as_deref(), |w, m| {
            w.string(m);
        });
        w.u8(self.learning_mode.tag());
    }

    fn decode_from(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            deferred: r.bool("deferred")?,
            context: r.optional("context", |r| r.blob("context"))?,
            action: r.f32("action")?,
            pdf_value: r.f32("pdf_value")?,
            model_id: r.optional("model_id", |r| r.string("model_id"))?,
            learning_mode: LearningMode::from_tag(r.u8("learning_mode")?)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeIndex {
    Numeric(i64),
    Literal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeValue {
    Numeric(f32),
    Literal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeEvent {
    pub index: Option<OutcomeIndex>,
    pub value: Option<OutcomeValue>,
    pub action_taken: bool,
}

impl OutcomeEvent {
    pub fn reward(value: f32) -> Self {
        Self {
            index: None,
            value: Some(OutcomeValue::Numeric(value)),
            action_taken: false,
        }
    }

    pub fn activation() -> Self {
        Self {
            index: None,
            value: None,
            action_taken: true,
        }
    }
}

impl WireCodec for OutcomeEvent {
    fn encode_to(&self, w: &mut WireWriter) {
        w.optional(self.index.as_ref(), |w, idx| match idx {
            OutcomeIndex::Numeric(n) => {
                w.u8(0).i64(*n);
            }
            OutcomeIndex::Literal(s) => {
                w.u8(1).string(s);
            }
        });
        w.optional(self.value.as_ref(), |w, v| match v {
            OutcomeValue::Numeric(n) => {
                w.u8(0).f32(*n);
            }
            OutcomeValue::Literal(s) => {
                w.u8(1).string(s);
            }
        });
        w.bool(self.action_taken);
    }

    fn decode_from(r: &mut WireReader) -> DecodeResult<Self> {
        let index = r.optional("index", |r| match r.u8("index")? {
            0 => Ok(OutcomeIndex::Numeric(r.i64("index")?)),
            1 => Ok(OutcomeIndex::Literal(r.string("index")?)),
            tag => Err(DecodeError::UnknownTag { what: "index", tag }),
        })?;
        let value = r.optional("value", |r| match r.u8("value")? {
            0 => Ok(OutcomeValue::Numeric(r.f32("value")?)),
            1 => Ok(OutcomeValue::Literal(r.string("value")?)),
            tag => Err(DecodeError::UnknownTag { what: "value", tag }),
        })?;
        Ok(Self {
            index,
            value,
            action_taken: r.bool("action_taken")?,
        })
    }
}

/// Shared context fragments referenced by id; `ids` and `values` are parallel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DedupInfo {
    pub ids: Vec<u64>,
    pub values: Vec<Bytes>,
}

impl WireCodec for DedupInfo {
    fn encode_to(&self, w: &mut WireWriter) {
        w.vec_u64(&self.ids);
        w.u32(u32::try_from(self.values.len()).unwrap_or(u32::MAX));
        for v in &self.values {
            w.blob(v);
        }
    }

    fn decode_from(r: &mut WireReader) -> DecodeResult<Self> {
        let ids = r.vec_u64("dedup_ids")?;
        let n = r.u32("dedup_values")? as usize;
        if n != ids.len() {
            return Err(DecodeError::Invalid {
                what: "dedup_values",
                reason: format!("{} ids but {} values", ids.len(), n),
            });
        }
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(r.blob("dedup_value")?);
        }
        Ok(Self { ids, values })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiStepEvent {
    pub event_id: String,
    pub previous_id: Option<String>,
    pub actions: Vec<u32>,
    pub probabilities: Vec<f32>,
    pub context: Bytes,
    pub model_id: Option<String>,
    pub deferred: bool,
}

impl WireCodec for MultiStepEvent {
    fn encode_to(&self, w: &mut WireWriter) {
        w.string(&self.event_id);
        w.optional(self.previous_id.as_deref(), |w, p| {
            w.string(p);
        });
        w.vec_u32(&self.actions)
            .vec_f32(&self.probabilities)
            .blob(&self.context);
        w.optional(self.model_id.as_deref(), |w, m| {
            w.string(m);
        });
        w.bool(self.deferred);
    }

    fn decode_from(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            event_id: r.string("step_event_id")?,
            previous_id: r.optional("previous_id", |r| r.string("previous_id"))?,
            actions: r.vec_u32("actions")?,
            probabilities: r.vec_f32("probabilities")?,
            context: r.blob("context")?,
            model_id: r.optional("model_id", |r| r.string("model_id"))?,
            deferred: r.bool("deferred")?,
        })
    }
}

/// Loop settings carried by a non-empty CHECKPOINT segment.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub reward_function: RewardFunctionKind,
    pub default_reward: f32,
    pub learning_mode: LearningMode,
    pub problem_type: ProblemType,
    pub use_client_time: bool,
}

impl WireCodec for CheckpointInfo {
    fn encode_to(&self, w: &mut WireWriter) {
        w.u8(self.reward_function.tag())
            .f32(self.default_reward)
            .u8(self.learning_mode.tag())
            .u8(self.problem_type.tag())
            .bool(self.use_client_time);
    }

    fn decode_from(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            reward_function: RewardFunctionKind::from_tag(r.u8("reward_function")?)?,
            default_reward: r.f32("default_reward")?,
            learning_mode: LearningMode::from_tag(r.u8("learning_mode")?)?,
            problem_type: ProblemType::from_tag(r.u8("problem_type")?)?,
            use_client_time: r.bool("use_client_time")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewardFunctionInfo {
    pub reward_function: RewardFunctionKind,
    pub default_reward: f32,
}

impl WireCodec for RewardFunctionInfo {
    fn encode_to(&self, w: &mut WireWriter) {
        w.u8(self.reward_function.tag()).f32(self.default_reward);
    }

    fn decode_from(r: &mut WireReader) -> DecodeResult<Self> {
        Ok(Self {
            reward_function: RewardFunctionKind::from_tag(r.u8("reward_function")?)?,
            default_reward: r.f32("default_reward")?,
        })
    }
}
