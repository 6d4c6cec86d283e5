mod common;

use bytes::Bytes;
use serde_json::json;

use common::{cb, cb_joiner, dedup, env, outcome, ts};
use decision_joiner::protocol::codec::WireCodec;
use decision_joiner::protocol::event::{
    CaEvent, Event, EventEncoding, LearningMode, Metadata, MultiSlotEvent, OutcomeEvent,
    OutcomeIndex, PayloadType, ProblemType, SlotEvent,
};
use decision_joiner::services::joined_event::{ExampleLine, Label, LineKind};
use decision_joiner::services::reward::RewardFunctionKind;
use decision_joiner::services::{ExampleJoiner, Joiner, JsonRecordDecoder};
use decision_joiner::utils::compression;
use decision_joiner::{DecodeError, DedupError, JoinError};

const CTX: &str = r#"{"User":{"id":"u1"},"_multi":[{"A":"a1"},{"A":"a2"}]}"#;

fn labels(out: &[ExampleLine<serde_json::Value>]) -> Vec<Option<Label>> {
    out.iter()
        .filter_map(ExampleLine::as_line)
        .map(|l| l.label.clone())
        .collect()
}

#[test]
fn cb_interaction_joins_with_its_outcome() {
    let mut j = cb_joiner();
    j.on_new_batch();
    j.process_event(&env(&cb("e1", &[2, 1], &[0.7, 0.3], false, CTX), 10))
        .expect("interaction");
    j.process_event(&env(&outcome("e1", OutcomeEvent::reward(5.0)), 20))
        .expect("outcome");
    j.on_batch_read();

    assert!(j.processing_batch());
    let mut out = Vec::new();
    assert!(j.process_joined(&mut out));

    assert_eq!(out.len(), 4);
    assert_eq!(out.last(), Some(&ExampleLine::EndOfGroup));
    let kinds: Vec<_> = out
        .iter()
        .filter_map(ExampleLine::as_line)
        .map(|l| l.kind)
        .collect();
    assert_eq!(kinds, vec![LineKind::Shared, LineKind::Action, LineKind::Action]);
    assert_eq!(
        labels(&out),
        vec![
            None,
            None,
            Some(Label::Cb {
                action: 2,
                cost: -5.0,
                probability: 0.7
            })
        ]
    );

    assert!(!j.processing_batch());
    assert!(!j.batch_contains("e1"));
    let m = j.get_metrics();
    assert_eq!(m.number_of_learned_events, 1);
    assert_eq!(m.first_event_id.as_deref(), Some("e1"));
}

#[test]
fn interaction_without_outcome_gets_default_reward() {
    let mut j = cb_joiner();
    j.on_new_batch();
    j.process_event(&env(&cb("e1", &[1, 2], &[0.9, 0.1], false, CTX), 1))
        .expect("interaction");
    let mut out = Vec::new();
    assert!(j.process_joined(&mut out));
    assert_eq!(
        labels(&out)[1],
        Some(Label::Cb {
            action: 1,
            cost: 1.0,
            probability: 0.9
        })
    );
}

#[test]
fn deferred_interaction_needs_activation() {
    let mut j = cb_joiner();
    j.on_new_batch();
    j.process_event(&env(&cb("skip", &[1, 2], &[0.5, 0.5], true, CTX), 1))
        .expect("interaction");
    j.process_event(&env(&outcome("skip", OutcomeEvent::reward(1.0)), 2))
        .expect("outcome");
    j.process_event(&env(&cb("go", &[1, 2], &[0.5, 0.5], true, CTX), 3))
        .expect("interaction");
    j.process_event(&env(&outcome("go", OutcomeEvent::activation()), 4))
        .expect("activation");
    j.process_event(&env(&outcome("go", OutcomeEvent::reward(2.0)), 5))
        .expect("outcome");

    let mut out = Vec::new();
    assert!(!j.process_joined(&mut out));
    assert!(j.current_event_is_skip_learn());
    assert!(out.is_empty());
    assert!(!j.batch_contains("skip"));

    assert!(j.process_joined(&mut out));
    assert!(!j.current_event_is_skip_learn());
    assert_eq!(
        labels(&out)[1],
        Some(Label::Cb {
            action: 1,
            cost: -2.0,
            probability: 0.5
        })
    );

    let m = j.get_metrics();
    assert_eq!(m.number_of_skip_learn_events, 1);
    assert_eq!(m.number_of_learned_events, 1);
}

#[test]
fn outcome_without_interaction_yields_nothing() {
    let mut j = cb_joiner();
    j.on_new_batch();
    j.process_event(&env(&outcome("lonely", OutcomeEvent::reward(1.0)), 1))
        .expect("outcome");
    assert!(j.processing_batch());
    let mut out = Vec::new();
    assert!(!j.process_joined(&mut out));
    assert!(!j.current_event_is_skip_learn());
    assert!(!j.processing_batch());
    assert_eq!(j.get_metrics().number_of_dropped_events, 1);
}

#[test]
fn ids_drain_in_arrival_order() {
    let mut j = cb_joiner();
    j.on_new_batch();
    for (i, id) in ["b", "a", "c"].iter().enumerate() {
        j.process_event(&env(&cb(id, &[1], &[1.0], false, CTX), i as i64))
            .expect("interaction");
    }
    j.process_event(&env(&outcome("a", OutcomeEvent::reward(1.0)), 9))
        .expect("outcome");

    let mut drained = Vec::new();
    let mut out = Vec::new();
    while j.processing_batch() {
        assert!(j.process_joined(&mut out));
        drained.push(j.get_metrics().last_event_id.expect("learned"));
    }
    assert_eq!(drained, vec!["b", "a", "c"]);
}

#[test]
fn mismatched_problem_type_drops_the_interaction() {
    let mut j = cb_joiner();
    j.set_problem_type(ProblemType::Ccb, false);
    assert_eq!(j.loop_info().problem_type(), ProblemType::Cb);

    let mut j = ExampleJoiner::new(JsonRecordDecoder::new());
    j.set_reward_function(decision_joiner::services::reward::RewardFunctionKind::Sum, true);
    j.set_default_reward(0.0, true);
    j.set_learning_mode(LearningMode::Online, true);
    j.set_problem_type(ProblemType::Ccb, true);
    j.on_new_batch();
    j.process_event(&env(&cb("e1", &[1], &[1.0], false, CTX), 1))
        .expect("queued");
    let mut out = Vec::new();
    assert!(!j.process_joined(&mut out));
    assert!(!j.processing_batch());
    assert_eq!(j.get_metrics().number_of_dropped_events, 1);
}

#[test]
fn learning_mode_mismatch_drops_the_interaction() {
    let mut j = cb_joiner();
    let mut ev = cb("e1", &[1], &[1.0], false, CTX);
    let mut payload = decision_joiner::protocol::event::CbEvent::decode_bytes(ev.payload.clone())
        .expect("cb");
    payload.learning_mode = LearningMode::Apprentice;
    ev.payload = payload.encode();
    j.on_new_batch();
    j.process_event(&env(&ev, 1)).expect("queued");
    let mut out = Vec::new();
    assert!(!j.process_joined(&mut out));
}

#[test]
fn apprentice_uses_default_reward_off_baseline() {
    let mut j = ExampleJoiner::new(JsonRecordDecoder::new());
    j.set_reward_function(decision_joiner::services::reward::RewardFunctionKind::Earliest, true);
    j.set_default_reward(-3.0, true);
    j.set_learning_mode(LearningMode::Apprentice, true);
    j.set_problem_type(ProblemType::Cb, true);

    let apprentice = |id: &str, actions: &[u32]| {
        let mut ev = cb(id, actions, &[0.6, 0.4], false, CTX);
        let mut p = decision_joiner::protocol::event::CbEvent::decode_bytes(ev.payload.clone())
            .expect("cb");
        p.learning_mode = LearningMode::Apprentice;
        ev.payload = p.encode();
        ev
    };

    j.on_new_batch();
    j.process_event(&env(&apprentice("base", &[1, 2]), 1)).expect("queued");
    j.process_event(&env(&outcome("base", OutcomeEvent::reward(4.0)), 2)).expect("queued");
    j.process_event(&env(&apprentice("off", &[2, 1]), 3)).expect("queued");
    j.process_event(&env(&outcome("off", OutcomeEvent::reward(4.0)), 4)).expect("queued");

    let mut out = Vec::new();
    assert!(j.process_joined(&mut out));
    assert_eq!(
        labels(&out)[1],
        Some(Label::Cb { action: 1, cost: -4.0, probability: 0.6 })
    );
    assert!(j.process_joined(&mut out));
    assert_eq!(
        labels(&out)[2],
        Some(Label::Cb { action: 2, cost: 3.0, probability: 0.6 })
    );
}

#[test]
fn pass_probability_sets_line_weight() {
    let mut j = cb_joiner();
    let mut ev = cb("e1", &[1, 2], &[0.5, 0.5], false, CTX);
    ev.meta.pass_probability = 0.25;
    j.on_new_batch();
    j.process_event(&env(&ev, 1)).expect("queued");
    let mut out = Vec::new();
    assert!(j.process_joined(&mut out));
    for line in out.iter().filter_map(ExampleLine::as_line) {
        assert!((line.weight - 4.0).abs() < 1e-6);
    }
}

#[test]
fn dedup_fragments_resolve_into_action_lines() {
    let mut j = cb_joiner();
    j.on_new_batch();
    j.process_event(&env(&dedup("d", &[7, 8], &[r#"{"A":"seven"}"#, r#"{"A":"eight"}"#]), 1))
        .expect("dedup");
    assert!(!j.processing_batch());
    assert_eq!(j.decoder().live_fragments(), 2);

    let ctx = r#"{"User":{},"_multi":[{"__aid":8},{"__aid":7}]}"#;
    j.process_event(&env(&cb("e1", &[1, 2], &[0.5, 0.5], false, ctx), 2))
        .expect("interaction");
    let mut out = Vec::new();
    assert!(j.process_joined(&mut out));
    let records: Vec<_> = out
        .iter()
        .filter_map(ExampleLine::as_line)
        .map(|l| l.record.clone())
        .collect();
    assert_eq!(records[1], json!({"A": "eight"}));
    assert_eq!(records[2], json!({"A": "seven"}));
}

#[test]
fn newer_dedup_payload_evicts_stale_fragments() {
    let mut j = cb_joiner();
    j.on_new_batch();
    j.process_event(&env(&dedup("d1", &[1, 2, 3], &["1", "2", "3"]), 1))
        .expect("dedup");
    j.process_event(&env(&dedup("d2", &[1, 2, 3], &["1", "2", "3"]), 2))
        .expect("dedup");
    assert_eq!(j.dedup_cache().len(), 3);

    j.process_event(&env(&dedup("d3", &[3, 9], &["3", "9"]), 3))
        .expect("dedup");
    assert_eq!(j.dedup_cache().len(), 2);
    assert!(j.dedup_cache().exists(3));
    assert!(j.dedup_cache().exists(9));
    assert!(!j.dedup_cache().exists(1));
    assert_eq!(j.decoder().live_fragments(), 2);
}

#[test]
fn broken_dedup_payload_abandons_the_batch() {
    let mut j = cb_joiner();
    j.on_new_batch();
    j.process_event(&env(&cb("e1", &[1], &[1.0], false, CTX), 1))
        .expect("interaction");
    assert!(j.processing_batch());

    let mut meta = Metadata::new("d", PayloadType::DedupInfo);
    meta.encoding = EventEncoding::Compressed;
    let broken = Event::new(meta, Bytes::from_static(b"definitely not zlib"));
    let err = j.process_event(&env(&broken, 2)).expect_err("dedup must fail");
    assert!(matches!(
        &err,
        JoinError::Dedup {
            event_id,
            source: DedupError::Payload {
                source: DecodeError::Decompress { .. }
            },
        } if event_id == "d"
    ));
    assert!(!j.processing_batch());
    assert!(!j.batch_contains("e1"));
}

#[test]
fn episode_payloads_are_unsupported() {
    let mut j = cb_joiner();
    j.on_new_batch();
    let ev = Event::new(Metadata::new("ep", PayloadType::Episode), Bytes::new());
    let err = j.process_event(&env(&ev, 1)).expect_err("unsupported");
    assert!(matches!(
        err,
        JoinError::Unsupported {
            payload_type: PayloadType::Episode
        }
    ));
    assert!(!j.processing_batch());
}

#[test]
fn malformed_outcome_invalidates_interaction() {
    let mut j = cb_joiner();
    j.on_new_batch();
    j.process_event(&env(&cb("e1", &[1], &[1.0], false, CTX), 1))
        .expect("interaction");
    let bad = Event::new(
        Metadata::new("e1", PayloadType::Outcome),
        Bytes::from_static(&[9, 9, 9]),
    );
    j.process_event(&env(&bad, 2)).expect("grouped");
    let mut out = Vec::new();
    assert!(!j.process_joined(&mut out));
    assert!(!j.batch_contains("e1"));
    assert_eq!(j.get_metrics().number_of_dropped_events, 1);
}

#[test]
fn ccb_outcomes_are_routed_to_slots() {
    let mut j = ExampleJoiner::new(JsonRecordDecoder::new());
    j.set_reward_function(decision_joiner::services::reward::RewardFunctionKind::Sum, true);
    j.set_default_reward(0.0, true);
    j.set_learning_mode(LearningMode::Online, true);
    j.set_problem_type(ProblemType::Ccb, true);

    let payload = MultiSlotEvent {
        deferred: false,
        context: Some(Bytes::from_static(
            br#"{"G":{"x":1},"_multi":[{"a":1},{"a":2}],"_slots":[{"s":0},{"s":1}]}"#,
        )),
        slots: vec![
            SlotEvent {
                slot_id: Some("s0".into()),
                actions: vec![1, 2],
                probabilities: vec![0.6, 0.4],
            },
            SlotEvent {
                slot_id: Some("s1".into()),
                actions: vec![2],
                probabilities: vec![1.0],
            },
        ],
        baseline_actions: vec![1, 2],
        model_id: None,
        learning_mode: LearningMode::Online,
    };
    let interaction = Event::new(Metadata::new("c1", PayloadType::Ccb), payload.encode());
    let by_literal = OutcomeEvent {
        index: Some(OutcomeIndex::Literal("s1".into())),
        ..OutcomeEvent::reward(2.0)
    };
    let by_number = OutcomeEvent {
        index: Some(OutcomeIndex::Numeric(0)),
        ..OutcomeEvent::reward(1.0)
    };

    j.on_new_batch();
    j.process_event(&env(&interaction, 1)).expect("interaction");
    j.process_event(&env(&outcome("c1", by_literal), 2)).expect("outcome");
    j.process_event(&env(&outcome("c1", by_number), 3)).expect("outcome");

    let mut out = Vec::new();
    assert!(j.process_joined(&mut out));
    assert_eq!(out.len(), 6);
    assert_eq!(out.last(), Some(&ExampleLine::EndOfGroup));
    let slot_labels: Vec<_> = out
        .iter()
        .filter_map(ExampleLine::as_line)
        .filter(|l| l.kind == LineKind::Slot)
        .map(|l| l.label.clone())
        .collect();
    assert_eq!(
        slot_labels,
        vec![
            Some(Label::CcbSlot {
                cost: -1.0,
                probabilities: vec![(1, 0.6), (2, 0.4)]
            }),
            Some(Label::CcbSlot {
                cost: -2.0,
                probabilities: vec![(2, 1.0)]
            }),
        ]
    );
    let m = j.get_metrics();
    assert_eq!(m.label_equal_baseline_first_slot, 1);
    assert!((m.sum_original_reward - 3.0).abs() < 1e-9);
}

fn joiner_for(problem_type: ProblemType, learning_mode: LearningMode) -> ExampleJoiner<JsonRecordDecoder> {
    let mut j = ExampleJoiner::new(JsonRecordDecoder::new());
    j.set_reward_function(RewardFunctionKind::Earliest, true);
    j.set_default_reward(-0.5, true);
    j.set_learning_mode(learning_mode, true);
    j.set_problem_type(problem_type, true);
    j
}

fn slates(id: &str, learning_mode: LearningMode) -> Event {
    let payload = MultiSlotEvent {
        deferred: false,
        context: Some(Bytes::from_static(
            br#"{"G":{"x":1},"_multi":[{"a":0},{"a":1}],"_slots":[{"s":0},{"s":1}]}"#,
        )),
        slots: vec![
            SlotEvent {
                slot_id: None,
                actions: vec![1, 0],
                probabilities: vec![0.7, 0.3],
            },
            SlotEvent {
                slot_id: None,
                actions: vec![0],
                probabilities: vec![1.0],
            },
        ],
        baseline_actions: vec![0, 1],
        model_id: None,
        learning_mode,
    };
    let mut meta = Metadata::new(id, PayloadType::Slates);
    meta.pass_probability = 0.5;
    Event::new(meta, payload.encode())
}

#[test]
fn slates_join_labels_shared_and_slot_lines() {
    let mut j = joiner_for(ProblemType::Slates, LearningMode::Online);
    j.on_new_batch();
    j.process_event(&env(&slates("s1", LearningMode::Online), 1))
        .expect("interaction");
    j.process_event(&env(&outcome("s1", OutcomeEvent::reward(2.0)), 2))
        .expect("outcome");
    j.on_batch_read();

    let mut out = Vec::new();
    assert!(j.process_joined(&mut out));
    assert_eq!(out.len(), 6);
    assert_eq!(out.last(), Some(&ExampleLine::EndOfGroup));

    let lines: Vec<_> = out.iter().filter_map(ExampleLine::as_line).collect();
    let kinds: Vec<_> = lines.iter().map(|l| l.kind).collect();
    assert_eq!(
        kinds,
        vec![
            LineKind::Shared,
            LineKind::Action,
            LineKind::Action,
            LineKind::Slot,
            LineKind::Slot
        ]
    );
    assert_eq!(
        labels(&out),
        vec![
            Some(Label::SlatesShared { cost: -2.0 }),
            None,
            None,
            Some(Label::SlatesSlot {
                probabilities: vec![(1, 0.7), (0, 0.3)]
            }),
            Some(Label::SlatesSlot {
                probabilities: vec![(0, 1.0)]
            }),
        ]
    );
    for line in &lines {
        assert!((line.weight - 2.0).abs() < 1e-6);
    }
    assert!(!j.processing_batch());
    assert_eq!(j.get_metrics().number_of_learned_events, 1);
}

#[test]
fn slates_in_apprentice_mode_use_default_reward() {
    let mut j = joiner_for(ProblemType::Slates, LearningMode::Apprentice);
    j.on_new_batch();
    j.process_event(&env(&slates("s1", LearningMode::Apprentice), 1))
        .expect("interaction");
    j.process_event(&env(&outcome("s1", OutcomeEvent::reward(2.0)), 2))
        .expect("outcome");

    let mut out = Vec::new();
    assert!(j.process_joined(&mut out));
    assert_eq!(labels(&out)[0], Some(Label::SlatesShared { cost: 0.5 }));
    assert!((j.get_metrics().sum_original_reward - 2.0).abs() < 1e-9);
}

fn ca(id: &str, action: f32, pdf_value: f32) -> Event {
    let payload = CaEvent {
        deferred: false,
        context: Some(Bytes::from_static(br#"{"G":{"temp":21.5}}"#)),
        action,
        pdf_value,
        model_id: Some("model-ca".into()),
        learning_mode: LearningMode::Online,
    };
    Event::new(Metadata::new(id, PayloadType::Ca), payload.encode())
}

#[test]
fn ca_join_yields_a_single_continuous_line() {
    let mut j = joiner_for(ProblemType::Ca, LearningMode::Online);
    j.on_new_batch();
    j.process_event(&env(&ca("c1", 1.25, 0.4), 1)).expect("interaction");
    j.process_event(&env(&outcome("c1", OutcomeEvent::reward(3.0)), 2))
        .expect("outcome");
    j.process_event(&env(&ca("c2", 0.5, 0.1), 3)).expect("interaction");
    j.on_batch_read();

    let mut out = Vec::new();
    assert!(j.process_joined(&mut out));
    assert_eq!(out.len(), 1);
    assert!(!out.contains(&ExampleLine::EndOfGroup));
    assert_eq!(
        labels(&out),
        vec![Some(Label::Continuous {
            action: 1.25,
            cost: -3.0,
            pdf_value: 0.4
        })]
    );
    let line = out[0].as_line().expect("line");
    assert_eq!(line.kind, LineKind::Shared);
    assert_eq!(line.record, json!({"G": {"temp": 21.5}}));

    out.clear();
    assert!(j.process_joined(&mut out));
    assert_eq!(
        labels(&out),
        vec![Some(Label::Continuous {
            action: 0.5,
            cost: 0.5,
            pdf_value: 0.1
        })]
    );
    assert!(!j.processing_batch());
}

#[test]
fn ca_interaction_without_context_is_skipped() {
    let mut j = joiner_for(ProblemType::Ca, LearningMode::Online);
    let payload = CaEvent {
        deferred: false,
        context: None,
        action: 1.0,
        pdf_value: 0.5,
        model_id: None,
        learning_mode: LearningMode::Online,
    };
    let ev = Event::new(Metadata::new("c1", PayloadType::Ca), payload.encode());
    j.on_new_batch();
    j.process_event(&env(&ev, 1)).expect("queued");
    let mut out = Vec::new();
    assert!(!j.process_joined(&mut out));
    assert_eq!(j.get_metrics().number_of_dropped_events, 1);
}

/// Cost joined for `e1` when the outcome enqueued first carries the later
/// client time.
fn earliest_cost(use_client_time: bool) -> Option<f32> {
    let mut j = cb_joiner();
    j.set_use_client_time(use_client_time, true);

    let mut interaction = cb("e1", &[1, 2], &[0.5, 0.5], false, CTX);
    interaction.meta.client_time = Some(ts(5));
    let mut first_in = outcome("e1", OutcomeEvent::reward(1.0));
    first_in.meta.client_time = Some(ts(50));
    let mut second_in = outcome("e1", OutcomeEvent::reward(9.0));
    second_in.meta.client_time = Some(ts(40));

    j.on_new_batch();
    j.process_event(&env(&interaction, 10)).expect("interaction");
    j.process_event(&env(&first_in, 20)).expect("outcome");
    j.process_event(&env(&second_in, 30)).expect("outcome");
    j.on_batch_read();

    let mut out = Vec::new();
    assert!(j.process_joined(&mut out));
    labels(&out).into_iter().flatten().find_map(|l| match l {
        Label::Cb { cost, .. } => Some(cost),
        _ => None,
    })
}

#[test]
fn client_time_decides_which_outcome_is_earliest() {
    assert_eq!(earliest_cost(false), Some(-1.0));
    assert_eq!(earliest_cost(true), Some(-9.0));
}

#[test]
fn compressed_payload_beyond_the_limit_is_not_inflated() {
    let ctx = format!(
        r#"{{"User":{{"pad":"{}"}},"_multi":[{{"A":"a1"}}]}}"#,
        "x".repeat(4096)
    );
    let packed = |id: &str| {
        let mut ev = cb(id, &[1], &[1.0], false, &ctx);
        ev.meta.encoding = EventEncoding::Compressed;
        ev.payload = compression::compress(&ev.payload).expect("compress");
        ev
    };

    let mut small = cb_joiner().with_payload_limit(1024);
    small.on_new_batch();
    small.process_event(&env(&packed("e1"), 1)).expect("queued");
    let mut out = Vec::new();
    assert!(!small.process_joined(&mut out));
    assert_eq!(small.get_metrics().number_of_dropped_events, 1);

    let mut roomy = cb_joiner().with_payload_limit(64 * 1024);
    roomy.on_new_batch();
    roomy.process_event(&env(&packed("e1"), 1)).expect("queued");
    assert!(roomy.process_joined(&mut out));
    assert_eq!(out.len(), 3);
}
