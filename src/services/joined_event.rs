// src/services/joined_event.rs
//! Joined interactions: the decision, its outcomes and the label it produces.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::protocol::event::{
    CaEvent, CbEvent, EventEncoding, LearningMode, Metadata, MultiSlotEvent, OutcomeIndex,
    OutcomeValue, PayloadType,
};
use crate::services::metrics::JoinerMetrics;
use crate::services::reward::RewardFunctionKind;

/// Recommended actions are 1-indexed for CB, so the baseline is action 1.
pub const CB_BASELINE_ACTION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataInfo {
    pub event_id: String,
    pub app_id: Option<String>,
    pub payload_type: PayloadType,
    pub pass_probability: f32,
    pub encoding: EventEncoding,
    pub client_time: Option<DateTime<Utc>>,
    pub learning_mode: LearningMode,
}

impl MetadataInfo {
    pub fn new(meta: &Metadata, learning_mode: LearningMode) -> Self {
        Self {
            event_id: meta.id.clone(),
            app_id: meta.app_id.clone(),
            payload_type: meta.payload_type,
            pass_probability: meta.pass_probability,
            encoding: meta.encoding,
            client_time: meta.client_time,
            learning_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub event_id: String,
    pub index: Option<OutcomeIndex>,
    pub value: Option<OutcomeValue>,
    pub action_taken: bool,
    pub enqueued_time: DateTime<Utc>,
}

// ---- output lines ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Shared,
    Action,
    Slot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    Cb {
        action: u32,
        cost: f32,
        probability: f32,
    },
    CcbSlot {
        cost: f32,
        probabilities: Vec<(u32, f32)>,
    },
    SlatesShared {
        cost: f32,
    },
    SlatesSlot {
        probabilities: Vec<(u32, f32)>,
    },
    Continuous {
        action: f32,
        cost: f32,
        pdf_value: f32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledLine<R> {
    pub kind: LineKind,
    pub record: R,
    pub label: Option<Label>,
    pub weight: f32,
}

impl<R> LabeledLine<R> {
    pub fn new(kind: LineKind, record: R) -> Self {
        Self {
            kind,
            record,
            label: None,
            weight: 1.0,
        }
    }
}

/// What a drain call hands to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ExampleLine<R> {
    Line(LabeledLine<R>),
    EndOfGroup,
}

impl<R> ExampleLine<R> {
    pub fn as_line(&self) -> Option<&LabeledLine<R>> {
        match self {
            ExampleLine::Line(l) => Some(l),
            ExampleLine::EndOfGroup => None,
        }
    }
}

fn label_weight(event_id: &str, probability_of_drop: f32) -> Option<f32> {
    if !(0.0..1.0).contains(&probability_of_drop) {
        tracing::warn!(event_id, probability_of_drop, "probability of drop should be within [0, 1)");
        return None;
    }
    Some(1.0 / (1.0 - probability_of_drop))
}

// ---- typed interactions ----

pub trait TypedInteraction {
    fn is_skip_learn(&self) -> bool;
    fn set_skip_learn(&mut self, skip: bool);
    fn calc_cost(
        &mut self,
        default_reward: f32,
        reward_function: RewardFunctionKind,
        meta: &MetadataInfo,
        outcomes: &[OutcomeRecord],
    );
    fn fill_in_label<R>(&self, lines: &mut [LabeledLine<R>]) -> bool;
    fn calculate_metrics(&self, _metrics: &mut JoinerMetrics) {}
    fn sum_original_reward(&self) -> f32;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CbInteraction {
    pub event_id: String,
    pub actions: Vec<u32>,
    pub probabilities: Vec<f32>,
    pub probability_of_drop: f32,
    pub skip_learn: bool,
    pub reward: f32,
    pub original_reward: f32,
}

impl CbInteraction {
    pub fn from_event(meta: &Metadata, cb: &CbEvent) -> Self {
        Self {
            event_id: meta.id.clone(),
            actions: cb.actions.clone().unwrap_or_default(),
            probabilities: cb.probabilities.clone().unwrap_or_default(),
            probability_of_drop: meta.probability_of_drop(),
            skip_learn: cb.deferred,
            reward: 0.0,
            original_reward: 0.0,
        }
    }
}

impl TypedInteraction for CbInteraction {
    fn is_skip_learn(&self) -> bool {
        self.skip_learn
    }

    fn set_skip_learn(&mut self, skip: bool) {
        self.skip_learn = skip;
    }

    fn calc_cost(
        &mut self,
        default_reward: f32,
        reward_function: RewardFunctionKind,
        meta: &MetadataInfo,
        outcomes: &[OutcomeRecord],
    ) {
        self.original_reward = reward_function.reduce(outcomes, default_reward);
        self.reward = if meta.learning_mode == LearningMode::Apprentice
            && self.actions.first() != Some(&CB_BASELINE_ACTION)
        {
            default_reward
        } else {
            self.original_reward
        };
    }

    fn fill_in_label<R>(&self, lines: &mut [LabeledLine<R>]) -> bool {
        let event_id = self.event_id.as_str();
        let Some(&action) = self.actions.first() else {
            tracing::warn!(event_id, "missing actions");
            return false;
        };
        let Some(&probability) = self.probabilities.first() else {
            tracing::warn!(event_id, "missing probabilities");
            return false;
        };
        if self.probabilities.iter().any(|p| p.is_nan()) {
            tracing::warn!(event_id, "distribution contains invalid probabilities");
        }
        let Some(weight) = label_weight(event_id, self.probability_of_drop) else {
            return false;
        };
        // line 0 is the shared context, so action k sits at line k
        let Some(line) = lines.get_mut(action as usize) else {
            tracing::warn!(event_id, action, "chosen action has no matching line");
            return false;
        };
        line.label = Some(Label::Cb {
            action,
            cost: -self.reward,
            probability,
        });
        for l in lines.iter_mut() {
            l.weight = weight;
        }
        true
    }

    fn calculate_metrics(&self, metrics: &mut JoinerMetrics) {
        match self.actions.first() {
            None => metrics.number_of_events_zero_actions += 1,
            Some(&CB_BASELINE_ACTION) => {
                metrics.sum_cost_original_baseline += f64::from(-self.original_reward);
            }
            Some(_) => {}
        }
    }

    fn sum_original_reward(&self) -> f32 {
        self.original_reward
    }
}

/// One slot's decision inside a CCB or Slates interaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotDecision {
    pub slot_id: Option<String>,
    pub actions: Vec<u32>,
    pub probabilities: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiSlotInteraction {
    pub event_id: String,
    pub slots: Vec<SlotDecision>,
    pub baseline_actions: Vec<u32>,
    pub skip_learn: bool,
    pub probability_of_drop: f32,
}

impl MultiSlotInteraction {
    pub fn from_event(meta: &Metadata, ev: &MultiSlotEvent) -> Self {
        Self {
            event_id: meta.id.clone(),
            slots: ev
                .slots
                .iter()
                .map(|s| SlotDecision {
                    slot_id: s.slot_id.clone(),
                    actions: s.actions.clone(),
                    probabilities: s.probabilities.clone(),
                })
                .collect(),
            baseline_actions: ev.baseline_actions.clone(),
            skip_learn: ev.deferred,
            probability_of_drop: meta.probability_of_drop(),
        }
    }

    fn slot_probabilities(&self, slot_index: usize) -> Option<Vec<(u32, f32)>> {
        let slot = self.slots.get(slot_index)?;
        if slot.actions.is_empty() || slot.probabilities.is_empty() {
            return None;
        }
        if slot.actions.len() != slot.probabilities.len() {
            tracing::warn!(
                event_id = self.event_id.as_str(),
                slot_index,
                actions = slot.actions.len(),
                probabilities = slot.probabilities.len(),
                "actions and probabilities differ in size"
            );
            return None;
        }
        Some(
            slot.actions
                .iter()
                .copied()
                .zip(slot.probabilities.iter().copied())
                .collect(),
        )
    }

    fn record_first_slot_metrics(&self, metrics: &mut JoinerMetrics, first_slot_cost: f32) {
        let cost = f64::from(first_slot_cost);
        metrics.sum_cost_original_first_slot += cost;
        let first_action = self.slots.first().and_then(|s| s.actions.first());
        if let (Some(action), Some(baseline)) = (first_action, self.baseline_actions.first()) {
            if action == baseline {
                metrics.label_equal_baseline_first_slot += 1;
                metrics.sum_cost_original_label_equal_baseline_first_slot += cost;
            } else {
                metrics.label_not_equal_baseline_first_slot += 1;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CcbInteraction {
    pub multi: MultiSlotInteraction,
    pub slot_id_to_index: HashMap<String, usize>,
    pub rewards: Vec<f32>,
    pub original_rewards: Vec<f32>,
}

impl CcbInteraction {
    pub fn new(multi: MultiSlotInteraction) -> Self {
        let slot_id_to_index = multi
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.slot_id.clone().map(|id| (id, i)))
            .collect();
        Self {
            multi,
            slot_id_to_index,
            rewards: Vec::new(),
            original_rewards: Vec::new(),
        }
    }

    fn slot_of(&self, outcome: &OutcomeRecord) -> Option<usize> {
        match outcome.index.as_ref()? {
            OutcomeIndex::Numeric(i) => usize::try_from(*i).ok(),
            OutcomeIndex::Literal(slot_id) => {
                let found = self.slot_id_to_index.get(slot_id).copied();
                if found.is_none() {
                    tracing::warn!(
                        event_id = self.multi.event_id.as_str(),
                        slot_id = slot_id.as_str(),
                        "CCB outcome has no matching interaction slot"
                    );
                }
                found
            }
        }
    }
}

impl TypedInteraction for CcbInteraction {
    fn is_skip_learn(&self) -> bool {
        self.multi.skip_learn
    }

    fn set_skip_learn(&mut self, skip: bool) {
        self.multi.skip_learn = skip;
    }

    fn calc_cost(
        &mut self,
        default_reward: f32,
        reward_function: RewardFunctionKind,
        meta: &MetadataInfo,
        outcomes: &[OutcomeRecord],
    ) {
        let n = self.multi.slots.len();
        let mut per_slot: HashMap<usize, Vec<OutcomeRecord>> = HashMap::new();
        for o in outcomes {
            if let Some(slot) = self.slot_of(o) {
                per_slot.entry(slot).or_default().push(o.clone());
            }
        }
        self.original_rewards = (0..n)
            .map(|i| {
                per_slot
                    .get(&i)
                    .map_or(default_reward, |os| reward_function.reduce(os, default_reward))
            })
            .collect();

        if meta.learning_mode != LearningMode::Apprentice {
            self.rewards = self.original_rewards.clone();
            return;
        }
        if n != self.multi.baseline_actions.len() {
            tracing::error!(
                event_id = meta.event_id.as_str(),
                slots = n,
                baseline_actions = self.multi.baseline_actions.len(),
                "slot count and baseline action count do not match"
            );
            self.rewards = vec![default_reward; n];
            return;
        }
        self.rewards = self
            .multi
            .slots
            .iter()
            .zip(&self.multi.baseline_actions)
            .zip(&self.original_rewards)
            .map(|((slot, baseline), observed)| {
                if slot.actions.first() == Some(baseline) {
                    *observed
                } else {
                    default_reward
                }
            })
            .collect();
    }

    fn fill_in_label<R>(&self, lines: &mut [LabeledLine<R>]) -> bool {
        let Some(weight) = label_weight(&self.multi.event_id, self.multi.probability_of_drop)
        else {
            return false;
        };
        let mut slot_index = 0;
        for line in lines.iter_mut() {
            line.weight = weight;
            if line.kind != LineKind::Slot {
                continue;
            }
            if let Some(probabilities) = self.multi.slot_probabilities(slot_index) {
                let reward = self.rewards.get(slot_index).copied().unwrap_or_default();
                line.label = Some(Label::CcbSlot {
                    cost: -reward,
                    probabilities,
                });
            }
            slot_index += 1;
        }
        true
    }

    fn calculate_metrics(&self, metrics: &mut JoinerMetrics) {
        let first = self.original_rewards.first().map_or(0.0, |r| -r);
        self.multi.record_first_slot_metrics(metrics, first);
    }

    fn sum_original_reward(&self) -> f32 {
        self.original_rewards.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlatesInteraction {
    pub multi: MultiSlotInteraction,
    pub reward: f32,
    pub original_reward: f32,
}

impl TypedInteraction for SlatesInteraction {
    fn is_skip_learn(&self) -> bool {
        self.multi.skip_learn
    }

    fn set_skip_learn(&mut self, skip: bool) {
        self.multi.skip_learn = skip;
    }

    fn calc_cost(
        &mut self,
        default_reward: f32,
        reward_function: RewardFunctionKind,
        meta: &MetadataInfo,
        outcomes: &[OutcomeRecord],
    ) {
        self.original_reward = reward_function.reduce(outcomes, default_reward);
        if meta.learning_mode == LearningMode::Apprentice {
            tracing::warn!(
                event_id = meta.event_id.as_str(),
                "apprentice mode is not defined for slates, using default reward"
            );
            self.reward = default_reward;
        } else {
            self.reward = self.original_reward;
        }
    }

    fn fill_in_label<R>(&self, lines: &mut [LabeledLine<R>]) -> bool {
        let Some(weight) = label_weight(&self.multi.event_id, self.multi.probability_of_drop)
        else {
            return false;
        };
        let mut slot_index = 0;
        for line in lines.iter_mut() {
            line.weight = weight;
            match line.kind {
                LineKind::Shared => {
                    line.label = Some(Label::SlatesShared {
                        cost: -self.reward,
                    });
                }
                LineKind::Slot => {
                    let probabilities = self
                        .multi
                        .slot_probabilities(slot_index)
                        .unwrap_or_default();
                    line.label = Some(Label::SlatesSlot { probabilities });
                    slot_index += 1;
                }
                LineKind::Action => {}
            }
        }
        true
    }

    fn calculate_metrics(&self, metrics: &mut JoinerMetrics) {
        self.multi
            .record_first_slot_metrics(metrics, -self.original_reward);
    }

    fn sum_original_reward(&self) -> f32 {
        self.original_reward
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaInteraction {
    pub event_id: String,
    pub action: f32,
    pub pdf_value: f32,
    pub probability_of_drop: f32,
    pub skip_learn: bool,
    pub reward: f32,
    pub original_reward: f32,
}

impl CaInteraction {
    pub fn from_event(meta: &Metadata, ca: &CaEvent) -> Self {
        Self {
            event_id: meta.id.clone(),
            action: ca.action,
            pdf_value: ca.pdf_value,
            probability_of_drop: meta.probability_of_drop(),
            skip_learn: ca.deferred,
            reward: 0.0,
            original_reward: 0.0,
        }
    }
}

impl TypedInteraction for CaInteraction {
    fn is_skip_learn(&self) -> bool {
        self.skip_learn
    }

    fn set_skip_learn(&mut self, skip: bool) {
        self.skip_learn = skip;
    }

    fn calc_cost(
        &mut self,
        default_reward: f32,
        reward_function: RewardFunctionKind,
        meta: &MetadataInfo,
        outcomes: &[OutcomeRecord],
    ) {
        self.original_reward = reward_function.reduce(outcomes, default_reward);
        if meta.learning_mode == LearningMode::Apprentice {
            tracing::warn!(
                event_id = meta.event_id.as_str(),
                "apprentice mode is not defined for continuous actions, using default reward"
            );
            self.reward = default_reward;
        } else {
            self.reward = self.original_reward;
        }
    }

    fn fill_in_label<R>(&self, lines: &mut [LabeledLine<R>]) -> bool {
        let event_id = self.event_id.as_str();
        if self.action.is_nan() {
            tracing::warn!(event_id, "missing action");
            return false;
        }
        if self.pdf_value.is_nan() {
            tracing::warn!(event_id, "missing pdf_value");
            return false;
        }
        let Some(weight) = label_weight(event_id, self.probability_of_drop) else {
            return false;
        };
        if lines.len() != 1 {
            tracing::warn!(event_id, lines = lines.len(), "continuous action needs exactly one line");
            return false;
        }
        let line = &mut lines[0];
        line.weight = weight;
        line.label = Some(Label::Continuous {
            action: self.action,
            cost: -self.reward,
            pdf_value: self.pdf_value,
        });
        true
    }

    fn calculate_metrics(&self, metrics: &mut JoinerMetrics) {
        if self.action.is_nan() {
            metrics.number_of_events_zero_actions += 1;
        }
    }

    fn sum_original_reward(&self) -> f32 {
        self.original_reward
    }
}

/// Closed set of interaction shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum ProblemData {
    Cb(CbInteraction),
    Ccb(CcbInteraction),
    Slates(SlatesInteraction),
    Ca(CaInteraction),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            ProblemData::Cb($inner) => $body,
            ProblemData::Ccb($inner) => $body,
            ProblemData::Slates($inner) => $body,
            ProblemData::Ca($inner) => $body,
        }
    };
}

impl TypedInteraction for ProblemData {
    fn is_skip_learn(&self) -> bool {
        delegate!(self, i => i.is_skip_learn())
    }

    fn set_skip_learn(&mut self, skip: bool) {
        delegate!(self, i => i.set_skip_learn(skip))
    }

    fn calc_cost(
        &mut self,
        default_reward: f32,
        reward_function: RewardFunctionKind,
        meta: &MetadataInfo,
        outcomes: &[OutcomeRecord],
    ) {
        delegate!(self, i => i.calc_cost(default_reward, reward_function, meta, outcomes))
    }

    fn fill_in_label<R>(&self, lines: &mut [LabeledLine<R>]) -> bool {
        delegate!(self, i => i.fill_in_label(lines))
    }

    fn calculate_metrics(&self, metrics: &mut JoinerMetrics) {
        delegate!(self, i => i.calculate_metrics(metrics))
    }

    fn sum_original_reward(&self) -> f32 {
        delegate!(self, i => i.sum_original_reward())
    }
}

impl ProblemData {
    /// Everything but continuous actions is a multi-line group.
    pub fn is_multiline(&self) -> bool {
        !matches!(self, ProblemData::Ca(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InteractionRecord {
    pub timestamp: DateTime<Utc>,
    pub metadata: MetadataInfo,
    pub context: Bytes,
    pub model_id: String,
    pub problem_data: ProblemData,
    pub outcomes: Vec<OutcomeRecord>,
    pub valid: bool,
}

impl InteractionRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        metadata: MetadataInfo,
        context: Bytes,
        model_id: String,
        problem_data: ProblemData,
    ) -> Self {
        Self {
            timestamp,
            metadata,
            context,
            model_id,
            problem_data,
            outcomes: Vec::new(),
            valid: true,
        }
    }

    /// A deferred interaction becomes learnable for good once any outcome
    /// reports that its action was taken.
    pub fn is_learnable(&mut self) -> bool {
        if !self.problem_data.is_skip_learn() {
            return true;
        }
        if self.outcomes.iter().any(|o| o.action_taken) {
            self.problem_data.set_skip_learn(false);
            return true;
        }
        false
    }

    pub fn calc_reward(&mut self, default_reward: f32, reward_function: RewardFunctionKind) {
        self.problem_data.calc_cost(
            default_reward,
            reward_function,
            &self.metadata,
            &self.outcomes,
        );
    }

    pub fn fill_in_label<R>(&self, lines: &mut [LabeledLine<R>]) -> bool {
        self.problem_data.fill_in_label(lines)
    }

    pub fn calculate_metrics(&self, metrics: &mut JoinerMetrics) {
        self.problem_data.calculate_metrics(metrics)
    }

    pub fn sum_original_reward(&self) -> f32 {
        self.problem_data.sum_original_reward()
    }
}
