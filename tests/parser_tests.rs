mod common;

use std::io::Cursor;

use bytes::Bytes;

use common::{cb, cb_joiner, env, outcome, regular, stream};
use decision_joiner::FrameError;
use decision_joiner::protocol::codec::WireCodec;
use decision_joiner::protocol::event::{
    CheckpointInfo, Event, EventEncoding, LearningMode, Metadata, OutcomeEvent, PayloadType,
    ProblemType, RewardFunctionInfo,
};
use decision_joiner::protocol::frame::{DEFAULT_MAX_SEGMENT_BYTES, SegmentKind};
use decision_joiner::services::joined_event::{ExampleLine, Label};
use decision_joiner::services::reward::RewardFunctionKind;
use decision_joiner::services::{BinaryParser, ExampleJoiner, Joiner, JsonRecordDecoder};

const CTX: &str = r#"{"User":{"id":"u1"},"_multi":[{"A":"a1"},{"A":"a2"}]}"#;

fn parser(bytes: Vec<u8>) -> BinaryParser<Cursor<Vec<u8>>> {
    BinaryParser::new(Cursor::new(bytes), DEFAULT_MAX_SEGMENT_BYTES)
}

fn drain<J: Joiner>(p: &mut BinaryParser<Cursor<Vec<u8>>>, j: &mut J) -> Vec<Vec<ExampleLine<J::Record>>> {
    let mut all = Vec::new();
    loop {
        let mut out = Vec::new();
        match p.parse_examples(j, &mut out) {
            Ok(true) => all.push(out),
            Ok(false) => break,
            Err(e) => panic!("unexpected frame error: {e}"),
        }
    }
    all
}

fn first_cost(lines: &[ExampleLine<serde_json::Value>]) -> Option<f32> {
    lines
        .iter()
        .filter_map(ExampleLine::as_line)
        .find_map(|l| match &l.label {
            Some(Label::Cb { cost, .. }) => Some(*cost),
            _ => None,
        })
}

#[test]
fn header_regular_eof_produces_one_batch() {
    let bytes = stream(|w| {
        let payload = regular(vec![
            env(&cb("e1", &[1, 2], &[0.8, 0.2], false, CTX), 1),
            env(&outcome("e1", OutcomeEvent::reward(3.0)), 2),
            env(&cb("e2", &[2, 1], &[0.6, 0.4], false, CTX), 3),
        ]);
        w.write_segment(SegmentKind::Regular, &payload).expect("regular");
    });

    let mut j = cb_joiner();
    let mut p = parser(bytes);
    let examples = drain(&mut p, &mut j);
    assert_eq!(examples.len(), 2);
    assert_eq!(first_cost(&examples[0]), Some(-3.0));
    assert_eq!(first_cost(&examples[1]), Some(1.0));
    assert_eq!(p.stats().batches_read, 1);
    assert_eq!(p.stats().events_read, 3);
    assert_eq!(p.stats().events_rejected, 0);
}

#[test]
fn corrupted_magic_is_fatal_before_any_example() {
    let mut bytes = stream(|w| {
        let payload = regular(vec![env(&cb("e1", &[1], &[1.0], false, CTX), 1)]);
        w.write_segment(SegmentKind::Regular, &payload).expect("regular");
    });
    bytes[0] = b'X';

    let mut j = cb_joiner();
    let mut p = parser(bytes);
    let mut out = Vec::new();
    let err = p.parse_examples(&mut j, &mut out).expect_err("bad magic");
    assert!(matches!(err, FrameError::MagicMismatch { .. }));
    assert!(err.is_fatal());
    assert!(out.is_empty());
    assert_eq!(j.get_metrics().number_of_learned_events, 0);
}

#[test]
fn truncated_stream_is_recoverable() {
    let mut bytes = stream(|w| {
        let payload = regular(vec![env(&cb("e1", &[1], &[1.0], false, CTX), 1)]);
        w.write_segment(SegmentKind::Regular, &payload).expect("regular");
    });
    // EOF marker (4) plus more than any padding (<8) plus payload bytes
    bytes.truncate(bytes.len() - 16);

    let mut j = cb_joiner();
    let mut p = parser(bytes);
    let mut out = Vec::new();
    let err = p.parse_examples(&mut j, &mut out).expect_err("truncated");
    assert!(matches!(err, FrameError::Truncated { .. }));
    assert!(!err.is_fatal());
}

#[test]
fn regular_messages_wait_for_configuration() {
    let cp = CheckpointInfo {
        reward_function: RewardFunctionKind::Max,
        default_reward: 0.5,
        learning_mode: LearningMode::Online,
        problem_type: ProblemType::Cb,
        use_client_time: false,
    };
    let bytes = stream(|w| {
        let early = regular(vec![env(&cb("early", &[1], &[1.0], false, CTX), 1)]);
        w.write_segment(SegmentKind::Regular, &early).expect("regular");
        w.write_segment(SegmentKind::Checkpoint, &cp.encode()).expect("checkpoint");
        let late = regular(vec![
            env(&cb("late", &[1], &[1.0], false, CTX), 2),
            env(&outcome("late", OutcomeEvent::reward(2.0)), 3),
            env(&outcome("late", OutcomeEvent::reward(7.0)), 4),
        ]);
        w.write_segment(SegmentKind::Regular, &late).expect("regular");
    });

    let mut j = ExampleJoiner::new(JsonRecordDecoder::new());
    assert!(!j.joiner_ready());
    let mut p = parser(bytes);
    let examples = drain(&mut p, &mut j);

    assert!(j.joiner_ready());
    assert_eq!(examples.len(), 1);
    assert_eq!(first_cost(&examples[0]), Some(-7.0));
    assert_eq!(p.stats().batches_skipped, 1);
    assert_eq!(p.stats().checkpoints, 1);
    assert_eq!(j.get_metrics().last_event_id.as_deref(), Some("late"));
}

#[test]
fn checkpoint_does_not_override_sticky_settings() {
    let cp = CheckpointInfo {
        reward_function: RewardFunctionKind::Max,
        default_reward: 9.0,
        learning_mode: LearningMode::Online,
        problem_type: ProblemType::Cb,
        use_client_time: false,
    };
    let bytes = stream(|w| {
        w.write_segment(SegmentKind::Checkpoint, &cp.encode()).expect("checkpoint");
        w.write_segment(SegmentKind::Checkpoint, &[]).expect("empty checkpoint");
    });
    let mut j = cb_joiner();
    let mut p = parser(bytes);
    assert!(drain(&mut p, &mut j).is_empty());
    assert_eq!(j.loop_info().reward_function(), RewardFunctionKind::Earliest);
    assert_eq!(j.loop_info().default_reward(), -1.0);
    assert_eq!(p.stats().checkpoints, 2);
}

#[test]
fn reward_function_info_applies_once_per_stream() {
    let first = RewardFunctionInfo {
        reward_function: RewardFunctionKind::Sum,
        default_reward: 0.0,
    };
    let second = RewardFunctionInfo {
        reward_function: RewardFunctionKind::Min,
        default_reward: 5.0,
    };
    let bytes = stream(|w| {
        w.write_segment(SegmentKind::RewardFunctionInfo, &first.encode())
            .expect("rfi");
        w.write_segment(SegmentKind::RewardFunctionInfo, &second.encode())
            .expect("rfi");
        let payload = regular(vec![
            env(&cb("e1", &[1], &[1.0], false, CTX), 1),
            env(&outcome("e1", OutcomeEvent::reward(2.0)), 2),
            env(&outcome("e1", OutcomeEvent::reward(3.0)), 3),
        ]);
        w.write_segment(SegmentKind::Regular, &payload).expect("regular");
    });

    let mut j = ExampleJoiner::new(JsonRecordDecoder::new());
    j.set_learning_mode(LearningMode::Online, true);
    j.set_problem_type(ProblemType::Cb, true);
    let mut p = parser(bytes);
    let examples = drain(&mut p, &mut j);

    assert_eq!(j.loop_info().reward_function(), RewardFunctionKind::Sum);
    assert_eq!(examples.len(), 1);
    assert_eq!(first_cost(&examples[0]), Some(-5.0));
}

#[test]
fn broken_dedup_skips_rest_of_batch_and_resumes() {
    let mut meta = Metadata::new("d", PayloadType::DedupInfo);
    meta.encoding = EventEncoding::Compressed;
    let broken = Event::new(meta, Bytes::from_static(b"garbage"));

    let bytes = stream(|w| {
        let bad = regular(vec![
            env(&cb("lost", &[1], &[1.0], false, CTX), 1),
            env(&broken, 2),
            env(&cb("also_lost", &[1], &[1.0], false, CTX), 3),
        ]);
        w.write_segment(SegmentKind::Regular, &bad).expect("regular");
        let good = regular(vec![env(&cb("kept", &[1], &[1.0], false, CTX), 4)]);
        w.write_segment(SegmentKind::Regular, &good).expect("regular");
    });

    let mut j = cb_joiner();
    let mut p = parser(bytes);
    let examples = drain(&mut p, &mut j);
    assert_eq!(examples.len(), 1);
    assert_eq!(p.stats().batches_read, 2);
    assert_eq!(p.stats().events_read, 3);
    assert_eq!(p.stats().events_rejected, 1);
    let m = j.get_metrics();
    assert_eq!(m.number_of_learned_events, 1);
    assert_eq!(m.first_event_id.as_deref(), Some("kept"));
}
