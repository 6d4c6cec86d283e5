// src/services/multistep.rs
//! Multi-step joiner: a batch is one episode whose steps are ordered by
//! `previous_id`, scored, then drained in that order.

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::error::JoinError;
use crate::protocol::event::{
    Envelope, LearningMode, Metadata, MultiStepEvent, OutcomeEvent, OutcomeIndex, PayloadType,
};
use crate::protocol::frame::DEFAULT_MAX_SEGMENT_BYTES;
use crate::services::decoder::{RecordDecoder, apply_dedup_payload};
use crate::services::dedup::LruDedupCache;
use crate::services::episode::TopoSorter;
use crate::services::joined_event::{
    CbInteraction, ExampleLine, InteractionRecord, MetadataInfo, OutcomeRecord, ProblemData,
};
use crate::services::joiner::Joiner;
use crate::services::loop_info::LoopInfo;
use crate::services::metrics::JoinerMetrics;
use crate::utils::logbook::DsJsonLog;
use crate::utils::timestamp::get_enqueued_time;

struct Step {
    timestamp: DateTime<Utc>,
    meta: Metadata,
    event: MultiStepEvent,
}

pub struct MultistepJoiner<D: RecordDecoder> {
    decoder: D,
    dedup_cache: LruDedupCache<D::Fragment>,
    loop_info: LoopInfo,
    interactions: HashMap<String, Vec<Step>>,
    outcomes: HashMap<String, Vec<OutcomeRecord>>,
    episodic_outcomes: Vec<OutcomeRecord>,
    order: VecDeque<String>,
    rewards: VecDeque<f32>,
    sorted: bool,
    current_skip_learn: bool,
    metrics: JoinerMetrics,
    dsjson: Option<DsJsonLog>,
    max_payload_bytes: usize,
}

impl<D: RecordDecoder> MultistepJoiner<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            dedup_cache: LruDedupCache::new(),
            loop_info: LoopInfo::default(),
            interactions: HashMap::new(),
            outcomes: HashMap::new(),
            episodic_outcomes: Vec::new(),
            order: VecDeque::new(),
            rewards: VecDeque::new(),
            sorted: false,
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

    /// Step ids in drain order, with the reward each will be labeled with.
    pub fn pending(&self) -> Vec<(String, f32)> {
        self.order
            .iter()
            .cloned()
            .zip(self.rewards.iter().copied())
            .collect()
    }

    fn clear_batch(&mut self) {
        self.interactions.clear();
        self.outcomes.clear();
        self.episodic_outcomes.clear();
        self.order.clear();
        self.rewards.clear();
        self.sorted = false;
    }

    fn populate_order(&mut self) {
        let mut sorter = TopoSorter::new();
        for (id, steps) in &self.interactions {
            let Some(first) = steps.first() else {
                continue;
            };
            let previous = first
                .event
                .previous_id
                .clone()
                .filter(|p| !p.is_empty());
            sorter.push(id.clone(), Reverse(first.timestamp), previous);
        }
        let sorted = sorter.sort();
        for id in &sorted.unreachable {
            warn!(
                step_id = id.as_str(),
                "step is unreachable from any root (cycle or descendant of one), dropping"
            );
        }
        self.order = sorted.order.into();
        self.sorted = true;
    }

    fn populate_episodic_rewards(&mut self) {
        let reward_function = self.loop_info.reward_function();
        let default_reward = self.loop_info.default_reward();
        let per_step: Vec<f32> = self
            .order
            .iter()
            .map(|id| {
                let mut outcomes = self.episodic_outcomes.clone();
                if let Some(own) = self.outcomes.get(id) {
                    outcomes.extend(own.iter().cloned());
                }
                reward_function.reduce(&outcomes, default_reward)
            })
            .collect();
        self.rewards = self.loop_info.multistep_reward().apply(&per_step).into();
    }

    fn join_step(
        &mut self,
        id: &str,
        reward: f32,
        out: &mut Vec<ExampleLine<D::Record>>,
    ) -> bool {
        let steps = self.interactions.remove(id).unwrap_or_default();
        let own_outcomes = self.outcomes.remove(id).unwrap_or_default();
        let [step] = steps.as_slice() else {
            warn!(step_id = id, count = steps.len(), "expected exactly one interaction for step, skipping");
            self.metrics.record_dropped();
            return false;
        };

        let cb = CbInteraction {
            event_id: step.event.event_id.clone(),
            actions: step.event.actions.clone(),
            probabilities: step.event.probabilities.clone(),
            probability_of_drop: step.meta.probability_of_drop(),
            skip_learn: step.event.deferred,
            reward,
            original_reward: reward,
        };
        let mut record = InteractionRecord::new(
            step.timestamp,
            MetadataInfo::new(&step.meta, LearningMode::Online),
            step.event.context.clone(),
            step.event
                .model_id
                .clone()
                .unwrap_or_else(|| "N/A".to_string()),
            ProblemData::Cb(cb),
        );
        record.outcomes.extend(own_outcomes);
        record.outcomes.extend(self.episodic_outcomes.iter().cloned());

        let learnable = record.is_learnable();
        if let Some(log) = self.dsjson.as_mut() {
            if let Err(e) = log.append_joined(&record) {
                error!(step_id = id, error = %e, "dsjson conversion failed");
            }
        }
        if !learnable {
            self.current_skip_learn = true;
            self.metrics.record_skip_learn();
            return false;
        }

        let mut lines = match self.decoder.decode_context(&record.context, &self.dedup_cache) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(step_id = id, error = %e, "context decoding failed, skipping step");
                self.metrics.record_dropped();
                return false;
            }
        };
        if !record.fill_in_label(&mut lines) {
            self.metrics.record_dropped();
            return false;
        }
        record.calculate_metrics(&mut self.metrics);
        self.metrics
            .record_learned(id, record.timestamp, record.sum_original_reward());
        out.extend(lines.into_iter().map(ExampleLine::Line));
        out.push(ExampleLine::EndOfGroup);
        true
    }
}

fn outcome_record(meta: &Metadata, enqueued: DateTime<Utc>, o: OutcomeEvent) -> OutcomeRecord {
    OutcomeRecord {
        event_id: meta.id.clone(),
        index: o.index,
        value: o.value,
        action_taken: o.action_taken,
        enqueued_time: enqueued,
    }
}

impl<D: RecordDecoder> Joiner for MultistepJoiner<D> {
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

    fn on_batch_read(&mut self) {
        self.populate_order();
        self.populate_episodic_rewards();
    }

    fn process_event(&mut self, envelope: &Envelope) -> Result<(), JoinError> {
        let event = envelope.decode_event()?;
        let enqueued = get_enqueued_time(
            &event.meta.id,
            envelope.timestamp,
            event.meta.client_time,
            self.loop_info.use_client_time(),
        );
        match event.meta.payload_type {
            PayloadType::MultiStep => {
                let step: MultiStepEvent =
                    match event.decode_payload_within(self.max_payload_bytes) {
                        Ok(step) => step,
                        Err(e) => {
                            warn!(
                                event_id = event.meta.id.as_str(),
                                error = %e,
                                "malformed step, dropping"
                            );
                            self.metrics.record_dropped();
                            return Err(e.into());
                        }
                    };
                self.interactions
                    .entry(step.event_id.clone())
                    .or_default()
                    .push(Step {
                        timestamp: enqueued,
                        meta: event.meta,
                        event: step,
                    });
                Ok(())
            }
            PayloadType::Outcome => {
                let outcome: OutcomeEvent =
                    match event.decode_payload_within(self.max_payload_bytes) {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(
                                event_id = event.meta.id.as_str(),
                                error = %e,
                                "malformed outcome, dropping"
                            );
                            self.metrics.record_dropped();
                            return Err(e.into());
                        }
                    };
                let step_id = match &outcome.index {
                    Some(OutcomeIndex::Literal(s)) => Some(s.clone()),
                    _ => None,
                };
                let record = outcome_record(&event.meta, enqueued, outcome);
                match step_id {
                    Some(step_id) => self.outcomes.entry(step_id).or_default().push(record),
                    None => self.episodic_outcomes.push(record),
                }
                Ok(())
            }
            PayloadType::DedupInfo => {
                match apply_dedup_payload(
                    &mut self.decoder,
                    &mut self.dedup_cache,
                    &event,
                    self.max_payload_bytes,
                ) {
                    Ok(evicted) => {
                        debug!(evicted, "dedup payload applied");
                        Ok(())
                    }
                    Err(source) => {
                        error!(error = %source, "dedup payload unusable, abandoning batch");
                        self.clear_batch();
                        Err(JoinError::Dedup {
                            event_id: event.meta.id,
                            source,
                        })
                    }
                }
            }
            PayloadType::Episode => {
                debug!(episode_id = event.meta.id.as_str(), "episode marker");
                Ok(())
            }
            payload_type => Err(JoinError::Unsupported { payload_type }),
        }
    }

    fn processing_batch(&self) -> bool {
        self.sorted && !self.order.is_empty()
    }

    fn process_joined(&mut self, out: &mut Vec<ExampleLine<D::Record>>) -> bool {
        out.clear();
        self.current_skip_learn = false;
        debug_assert!(self.sorted, "process_joined called before the batch was ordered");
        if !self.sorted {
            error!("process_joined called before the batch was ordered");
            return false;
        }
        let Some(id) = self.order.pop_front() else {
            return false;
        };
        let reward = self
            .rewards
            .pop_front()
            .unwrap_or_else(|| self.loop_info.default_reward());
        let joined = self.join_step(&id, reward, out);
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

impl<D: RecordDecoder> Drop for MultistepJoiner<D> {
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
