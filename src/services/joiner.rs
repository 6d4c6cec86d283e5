// src/services/joiner.rs
//! Single-step joiner: groups envelopes by event id and drains one id at a time.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::error::JoinError;
use crate::protocol::codec::WireCodec;
use crate::protocol::event::{
    CaEvent, CbEvent, CheckpointInfo, Envelope, Event, LearningMode, MultiSlotEvent, OutcomeEvent,
    PayloadType, ProblemType,
};
use crate::protocol::frame::DEFAULT_MAX_SEGMENT_BYTES;
use crate::services::decoder::{RecordDecoder, apply_dedup_payload};
use crate::services::dedup::LruDedupCache;
use crate::services::joined_event::{
    CaInteraction, CbInteraction, CcbInteraction, ExampleLine, InteractionRecord, LabeledLine,
    MetadataInfo, MultiSlotInteraction, OutcomeRecord, ProblemData, SlatesInteraction,
};
use crate::services::loop_info::LoopInfo;
use crate::services::metrics::JoinerMetrics;
use crate::services::reward::{MultistepRewardKind, RewardFunctionKind};
use crate::utils::logbook::DsJsonLog;
use crate::utils::timestamp::get_enqueued_time;

/// Driven by the reader loop: `on_new_batch`, `process_event` for each
/// envelope, `on_batch_read`, then `process_joined` until `processing_batch`
/// turns false.
pub trait Joiner {
    type Record;

    fn loop_info(&self) -> &LoopInfo;
    fn loop_info_mut(&mut self) -> &mut LoopInfo;

    fn set_reward_function(&mut self, value: RewardFunctionKind, sticky: bool) -> bool {
        let ok = self.loop_info_mut().reward_function.set(value, sticky);
        if !ok {
            warn!(?value, "reward_function is locked, ignoring new value");
        }
        ok
    }

    fn set_default_reward(&mut self, value: f32, sticky: bool) -> bool {
        let ok = self.loop_info_mut().default_reward.set(value, sticky);
        if !ok {
            warn!(value, "default_reward is locked, ignoring new value");
        }
        ok
    }

    fn set_learning_mode(&mut self, value: LearningMode, sticky: bool) -> bool {
        let ok = self.loop_info_mut().learning_mode.set(value, sticky);
        if !ok {
            warn!(?value, "learning_mode is locked, ignoring new value");
        }
        ok
    }

    fn set_problem_type(&mut self, value: ProblemType, sticky: bool) -> bool {
        let ok = self.loop_info_mut().problem_type.set(value, sticky);
        if !ok {
            warn!(%value, "problem_type is locked, ignoring new value");
        }
        ok
    }

    fn set_use_client_time(&mut self, value: bool, sticky: bool) -> bool {
        let ok = self.loop_info_mut().use_client_time.set(value, sticky);
        if !ok {
            warn!(value, "use_client_time is locked, ignoring new value");
        }
        ok
    }

    fn set_multistep_reward(&mut self, value: MultistepRewardKind, sticky: bool) -> bool {
        let ok = self.loop_info_mut().multistep_reward.set(value, sticky);
        if !ok {
            warn!(?value, "multistep_reward is locked, ignoring new value");
        }
        ok
    }

    /// Checkpoint values never override operator settings.
    fn apply_checkpoint(&mut self, info: &CheckpointInfo) {
        self.set_reward_function(info.reward_function, false);
        self.set_default_reward(info.default_reward, false);
        self.set_learning_mode(info.learning_mode, false);
        self.set_problem_type(info.problem_type, false);
        self.set_use_client_time(info.use_client_time, false);
    }

    fn joiner_ready(&self) -> bool {
        self.loop_info().is_configured()
    }

    fn set_dsjson_log(&mut self, log: DsJsonLog);

    fn on_new_batch(&mut self);
    fn on_batch_read(&mut self) {}
    fn process_event(&mut self, envelope: &Envelope) -> Result<(), JoinError>;
    fn processing_batch(&self) -> bool;
    fn process_joined(&mut self, out: &mut Vec<ExampleLine<Self::Record>>) -> bool;
    fn current_event_is_skip_learn(&self) -> bool;
    fn get_metrics(&self) -> JoinerMetrics;
}

struct JoinedEntry<R> {
    record: InteractionRecord,
    lines: Vec<LabeledLine<R>>,
}

pub struct ExampleJoiner<D: RecordDecoder> {
    decoder: D,
    dedup_cache: LruDedupCache<D::Fragment>,
    loop_info: LoopInfo,
    batch_event_order: VecDeque<String>,
    batch_grouped_events: HashMap<String, Vec<Envelope>>,
    batch_grouped_examples: HashMap<String, JoinedEntry<D::Record>>,
    current_skip_learn: bool,
    metrics: JoinerMetrics,
    dsjson: Option<DsJsonLog>,
    max_payload_bytes: usize,
}

impl<D: RecordDecoder> ExampleJoiner<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            dedup_cache: LruDedupCache::new(),
            loop_info: LoopInfo::default(),
            batch_event_order: VecDeque::new(),
            batch_grouped_events: HashMap::new(),
            batch_grouped_examples: HashMap::new(),
            current_skip_learn: false,
            metrics: JoinerMetrics::default(),
            dsjson: None,
            max_payload_bytes: DEFAULT_MAX_SEGMENT_BYTES,
        }
    }

    /// Caps how far a compressed payload may inflate.
    pub fn with_payload_limit(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn dedup_cache(&self) -> &LruDedupCache<D::Fragment> {
        &self.dedup_cache
    }

    /// True while `id` is still present in any batch map.
    pub fn batch_contains(&self, id: &str) -> bool {
        self.batch_event_order.iter().any(|x| x == id)
            || self.batch_grouped_events.contains_key(id)
            || self.batch_grouped_examples.contains_key(id)
    }

    fn clear_batch(&mut self) {
        self.batch_event_order.clear();
        self.batch_grouped_events.clear();
        self.batch_grouped_examples.clear();
    }

    fn clear_event_id_batch_info(&mut self, id: &str) {
        self.batch_grouped_events.remove(id);
        if self.batch_event_order.front().map(String::as_str) == Some(id) {
            self.batch_event_order.pop_front();
        }
        self.batch_grouped_examples.remove(id);
    }

    fn invalidate_joined_event(&mut self, id: &str) {
        if let Some(entry) = self.batch_grouped_examples.get_mut(id) {
            entry.record.valid = false;
        }
    }

    fn process_interaction(&mut self, event: &Event, enqueued: DateTime<Utc>) {
        let meta = &event.meta;
        let id = meta.id.as_str();
        let problem_type = self.loop_info.problem_type();
        if !problem_type.accepts(meta.payload_type) {
            warn!(
                event_id = id,
                %problem_type,
                payload_type = %meta.payload_type,
                "trainer problem type and interaction type don't match, skipping interaction"
            );
            return;
        }
        if self.batch_grouped_examples.contains_key(id) {
            warn!(event_id = id, "duplicate interaction, keeping the first one");
            return;
        }
        let payload = match event.payload_bytes_within(self.max_payload_bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(event_id = id, error = %e, "interaction payload could not be decompressed");
                return;
            }
        };

        let built = match meta.payload_type {
            PayloadType::Cb => CbEvent::decode_bytes(payload).map(|cb| {
                let complete =
                    cb.context.is_some() && cb.actions.is_some() && cb.probabilities.is_some();
                complete.then(|| {
                    (
                        cb.context.clone().unwrap_or_default(),
                        cb.model_id.clone(),
                        cb.learning_mode,
                        ProblemData::Cb(CbInteraction::from_event(meta, &cb)),
                    )
                })
            }),
            PayloadType::Ccb | PayloadType::Slates => {
                MultiSlotEvent::decode_bytes(payload).map(|ev| {
                    let context = ev.context.clone()?;
                    let multi = MultiSlotInteraction::from_event(meta, &ev);
                    let data = if meta.payload_type == PayloadType::Ccb {
                        ProblemData::Ccb(CcbInteraction::new(multi))
                    } else {
                        ProblemData::Slates(SlatesInteraction {
                            multi,
                            reward: 0.0,
                            original_reward: 0.0,
                        })
                    };
                    Some((context, ev.model_id.clone(), ev.learning_mode, data))
                })
            }
            PayloadType::Ca => CaEvent::decode_bytes(payload).map(|ca| {
                let context = ca.context.clone()?;
                Some((
                    context,
                    ca.model_id.clone(),
                    ca.learning_mode,
                    ProblemData::Ca(CaInteraction::from_event(meta, &ca)),
                ))
            }),
            other => {
                warn!(event_id = id, payload_type = %other, "not an interaction payload");
                return;
            }
        };

        let (context, model_id, learning_mode, problem_data) = match built {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                warn!(
                    event_id = id,
                    payload_type = %meta.payload_type,
                    "interaction payload is missing required fields, skipping"
                );
                return;
            }
            Err(e) => {
                warn!(event_id = id, error = %e, "interaction payload is malformed, skipping");
                return;
            }
        };

        let configured = self.loop_info.learning_mode();
        if learning_mode != configured {
            warn!(
                event_id = id,
                declared = ?learning_mode,
                ?configured,
                "interaction learning mode does not match the configured one, skipping"
            );
            return;
        }

        let lines = match self.decoder.decode_context(&context, &self.dedup_cache) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(event_id = id, error = %e, "context decoding failed, skipping interaction");
                return;
            }
        };

        let timestamp = get_enqueued_time(
            id,
            enqueued,
            meta.client_time,
            self.loop_info.use_client_time(),
        );
        let record = InteractionRecord::new(
            timestamp,
            MetadataInfo::new(meta, learning_mode),
            context,
            model_id.unwrap_or_default(),
            problem_data,
        );
        self.batch_grouped_examples
            .insert(id.to_string(), JoinedEntry { record, lines });
    }

    fn process_outcome(&mut self, event: &Event, enqueued: DateTime<Utc>) {
        let id = event.meta.id.as_str();
        if !self.batch_grouped_examples.contains_key(id) {
            debug!(event_id = id, "outcome without interaction in this batch, dropping");
            return;
        }
        let outcome: OutcomeEvent = match event.decode_payload_within(self.max_payload_bytes) {
            Ok(o) => o,
            Err(e) => {
                warn!(event_id = id, error = %e, "malformed outcome, interaction will not be learned");
                self.invalidate_joined_event(id);
                return;
            }
        };
        let record = OutcomeRecord {
            event_id: id.to_string(),
            index: outcome.index,
            value: outcome.value,
            action_taken: outcome.action_taken,
            enqueued_time: get_enqueued_time(
                id,
                enqueued,
                event.meta.client_time,
                self.loop_info.use_client_time(),
            ),
        };
        if let Some(entry) = self.batch_grouped_examples.get_mut(id) {
            entry.record.outcomes.push(record);
        }
    }

    fn join_event_id(&mut self, id: &str, out: &mut Vec<ExampleLine<D::Record>>) -> bool {
        let envelopes = self.batch_grouped_events.remove(id).unwrap_or_default();
        let mut events = Vec::with_capacity(envelopes.len());
        for env in &envelopes {
            match env.decode_event() {
                Ok(ev) => events.push((ev, env.timestamp)),
                Err(e) => warn!(event_id = id, error = %e, "malformed event, skipping envelope"),
            }
        }

        for (ev, ts) in events.iter().filter(|(e, _)| e.meta.payload_type.is_interaction()) {
            self.process_interaction(ev, *ts);
        }
        for (ev, ts) in events
            .iter()
            .filter(|(e, _)| e.meta.payload_type == PayloadType::Outcome)
        {
            self.process_outcome(ev, *ts);
        }

        let reward_function = self.loop_info.reward_function();
        let default_reward = self.loop_info.default_reward();
        let Some(entry) = self.batch_grouped_examples.get_mut(id) else {
            warn!(event_id = id, "events were processed but no valid interaction found, skipping");
            self.metrics.record_dropped();
            return false;
        };
        if !entry.record.valid {
            warn!(event_id = id, "interaction was invalidated by a malformed observation, skipping");
            self.metrics.record_dropped();
            return false;
        }

        entry.record.calc_reward(default_reward, reward_function);
        let learnable = entry.record.is_learnable();
        self.current_skip_learn = !learnable;
        entry.record.calculate_metrics(&mut self.metrics);

        if let Some(log) = self.dsjson.as_mut() {
            if let Err(e) = log.append_joined(&entry.record) {
                error!(event_id = id, error = %e, "dsjson conversion failed");
            }
        }

        if !learnable {
            debug!(event_id = id, "deferred interaction was never activated, not learning");
            self.metrics.record_skip_learn();
            return false;
        }
        if !entry.record.fill_in_label(&mut entry.lines) {
            self.metrics.record_dropped();
            return false;
        }

        self.metrics.record_learned(
            id,
            entry.record.timestamp,
            entry.record.sum_original_reward(),
        );
        let multiline = entry.record.problem_data.is_multiline();
        out.extend(entry.lines.drain(..).map(ExampleLine::Line));
        if multiline {
            out.push(ExampleLine::EndOfGroup);
        }
        true
    }
}

impl<D: RecordDecoder> Joiner for ExampleJoiner<D> {
    type Record = D::Record;

    fn loop_info(&self) -> &LoopInfo {
        &self.loop_info
    }

    fn loop_info_mut(&mut self) -> &mut LoopInfo {
        &mut self.loop_info
    }

    fn set_dsjson_log(&mut self, log: DsJsonLog) {
        self.dsjson = Some(log);
    }

    fn on_new_batch(&mut self) {
        self.clear_batch();
    }

    fn process_event(&mut self, envelope: &Envelope) -> Result<(), JoinError> {
        let event = envelope.decode_event()?;
        match event.meta.payload_type {
            PayloadType::DedupInfo => {
                match apply_dedup_payload(
                    &mut self.decoder,
                    &mut self.dedup_cache,
                    &event,
                    self.max_payload_bytes,
                ) {
                    Ok(evicted) => {
                        debug!(evicted, cached = self.dedup_cache.len(), "dedup payload applied");
                        Ok(())
                    }
                    Err(source) => {
                        error!(
                            event_id = event.meta.id.as_str(),
                            error = %source,
                            "dedup payload unusable, abandoning batch"
                        );
                        self.clear_batch();
                        Err(JoinError::Dedup {
                            event_id: event.meta.id,
                            source,
                        })
                    }
                }
            }
            payload_type @ (PayloadType::Episode | PayloadType::MultiStep) => {
                Err(JoinError::Unsupported { payload_type })
            }
            _ => {
                let id = event.meta.id;
                let group = self.batch_grouped_events.entry(id.clone()).or_default();
                if group.is_empty() {
                    self.batch_event_order.push_back(id);
                }
                group.push(envelope.clone());
                Ok(())
            }
        }
    }

    fn processing_batch(&self) -> bool {
        !self.batch_event_order.is_empty()
    }

    fn process_joined(&mut self, out: &mut Vec<ExampleLine<D::Record>>) -> bool {
        out.clear();
        self.current_skip_learn = false;
        let Some(id) = self.batch_event_order.front().cloned() else {
            return false;
        };
        let joined = self.join_event_id(&id, out);
        self.clear_event_id_batch_info(&id);
        if !joined {
            out.clear();
        }
        joined
    }

    fn current_event_is_skip_learn(&self) -> bool {
        self.current_skip_learn
    }

    fn get_metrics(&self) -> JoinerMetrics {
        self.metrics.clone()
    }
}

impl<D: RecordDecoder> Drop for ExampleJoiner<D> {
    fn drop(&mut self) {
        let decoder = &mut self.decoder;
        self.dedup_cache.clear(|f| decoder.release(f));
        if let Some(log) = self.dsjson.as_mut() {
            if let Err(e) = log.flush() {
                error!(error = %e, "flushing dsjson output failed");
            }
        }
    }
}
