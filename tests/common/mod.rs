#![allow(dead_code)]

use bytes::Bytes;
use chrono::{DateTime, Utc};

use decision_joiner::protocol::codec::WireCodec;
use decision_joiner::protocol::event::{
    CbEvent, DedupInfo, Envelope, Event, JoinedPayload, LearningMode, Metadata, MultiStepEvent,
    OutcomeEvent, PayloadType, ProblemType,
};
use decision_joiner::protocol::frame::{FrameWriter, SegmentKind};
use decision_joiner::services::reward::RewardFunctionKind;
use decision_joiner::services::{ExampleJoiner, Joiner, JsonRecordDecoder};

pub fn ts(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).expect("valid millis")
}

pub fn cb(id: &str, actions: &[u32], probabilities: &[f32], deferred: bool, context: &str) -> Event {
    let payload = CbEvent {
        deferred,
        context: Some(Bytes::copy_from_slice(context.as_bytes())),
        actions: Some(actions.to_vec()),
        probabilities: Some(probabilities.to_vec()),
        model_id: Some("model-1".into()),
        learning_mode: LearningMode::Online,
    };
    Event::new(Metadata::new(id, PayloadType::Cb), payload.encode())
}

pub fn outcome(id: &str, o: OutcomeEvent) -> Event {
    Event::new(Metadata::new(id, PayloadType::Outcome), o.encode())
}

pub fn dedup(id: &str, ids: &[u64], values: &[&str]) -> Event {
    let payload = DedupInfo {
        ids: ids.to_vec(),
        values: values
            .iter()
            .map(|v| Bytes::copy_from_slice(v.as_bytes()))
            .collect(),
    };
    Event::new(Metadata::new(id, PayloadType::DedupInfo), payload.encode())
}

pub fn step(id: &str, previous: Option<&str>, actions: &[u32], probabilities: &[f32]) -> Event {
    let payload = MultiStepEvent {
        event_id: id.to_string(),
        previous_id: previous.map(str::to_string),
        actions: actions.to_vec(),
        probabilities: probabilities.to_vec(),
        context: Bytes::from_static(br#"{"Step":{"f":1},"_multi":[{"a":1},{"a":2}]}"#),
        model_id: None,
        deferred: false,
    };
    Event::new(Metadata::new(id, PayloadType::MultiStep), payload.encode())
}

pub fn env(event: &Event, ms: i64) -> Envelope {
    Envelope::new(event, ts(ms))
}

/// CB joiner with earliest reward and default reward -1.
pub fn cb_joiner() -> ExampleJoiner<JsonRecordDecoder> {
    let mut j = ExampleJoiner::new(JsonRecordDecoder::new());
    j.set_reward_function(RewardFunctionKind::Earliest, true);
    j.set_default_reward(-1.0, true);
    j.set_learning_mode(LearningMode::Online, true);
    j.set_problem_type(ProblemType::Cb, true);
    j
}

pub fn regular(envelopes: Vec<Envelope>) -> Bytes {
    JoinedPayload { envelopes }.encode()
}

pub fn stream(build: impl FnOnce(&mut FrameWriter<Vec<u8>>)) -> Vec<u8> {
    let mut w = FrameWriter::new(Vec::new());
    w.write_preamble().expect("preamble");
    w.write_segment(SegmentKind::Header, &[]).expect("header");
    build(&mut w);
    w.write_eof().expect("eof");
    w.into_inner()
}
