// src/services/reward.rs
//! Reducers that turn a list of outcomes into one scalar reward, and the
//! suffix transforms used to back rewards up across an episode.

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, DecodeResult};
use crate::protocol::event::OutcomeValue;
use crate::services::joined_event::OutcomeRecord;

pub type RewardFn = fn(&[OutcomeRecord], f32) -> f32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardFunctionKind {
    Earliest,
    Average,
    Sum,
    Min,
    Max,
    Median,
}

impl RewardFunctionKind {
    pub fn tag(self) -> u8 {
        match self {
            RewardFunctionKind::Earliest => 0,
            RewardFunctionKind::Average => 1,
            RewardFunctionKind::Sum => 2,
            RewardFunctionKind::Min => 3,
            RewardFunctionKind::Max => 4,
            RewardFunctionKind::Median => 5,
        }
    }

    pub fn from_tag(tag: u8) -> DecodeResult<Self> {
        Ok(match tag {
            0 => RewardFunctionKind::Earliest,
            1 => RewardFunctionKind::Average,
            2 => RewardFunctionKind::Sum,
            3 => RewardFunctionKind::Min,
            4 => RewardFunctionKind::Max,
            5 => RewardFunctionKind::Median,
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "reward_function",
                    tag,
                });
            }
        })
    }

    pub fn function(self) -> RewardFn {
        match self {
            RewardFunctionKind::Earliest => earliest,
            RewardFunctionKind::Average => average,
            RewardFunctionKind::Sum => sum,
            RewardFunctionKind::Min => min,
            RewardFunctionKind::Max => max,
            RewardFunctionKind::Median => median,
        }
    }

    pub fn reduce(self, outcomes: &[OutcomeRecord], default_reward: f32) -> f32 {
        (self.function())(outcomes, default_reward)
    }
}

// Activation-only and literal-valued outcomes never carry a reward.
fn numeric(outcomes: &[OutcomeRecord]) -> impl Iterator<Item = (&OutcomeRecord, f32)> {
    outcomes.iter().filter_map(|o| match (&o.value, o.action_taken) {
        (Some(OutcomeValue::Numeric(v)), false) => Some((o, *v)),
        _ => None,
    })
}

pub fn earliest(outcomes: &[OutcomeRecord], default_reward: f32) -> f32 {
    let mut best: Option<(&OutcomeRecord, f32)> = None;
    for (o, v) in numeric(outcomes) {
        match best {
            Some((b, _)) if b.enqueued_time <= o.enqueued_time => {}
            _ => best = Some((o, v)),
        }
    }
    best.map_or(default_reward, |(_, v)| v)
}

pub fn average(outcomes: &[OutcomeRecord], default_reward: f32) -> f32 {
    let (total, n) = numeric(outcomes).fold((0f32, 0usize), |(s, n), (_, v)| (s + v, n + 1));
    if n == 0 {
        default_reward
    } else {
        total / n as f32
    }
}

pub fn sum(outcomes: &[OutcomeRecord], default_reward: f32) -> f32 {
    let mut it = numeric(outcomes).peekable();
    if it.peek().is_none() {
        return default_reward;
    }
    it.map(|(_, v)| v).sum()
}

pub fn min(outcomes: &[OutcomeRecord], default_reward: f32) -> f32 {
    numeric(outcomes)
        .map(|(_, v)| v)
        .reduce(f32::min)
        .unwrap_or(default_reward)
}

pub fn max(outcomes: &[OutcomeRecord], default_reward: f32) -> f32 {
    numeric(outcomes)
        .map(|(_, v)| v)
        .reduce(f32::max)
        .unwrap_or(default_reward)
}

pub fn median(outcomes: &[OutcomeRecord], default_reward: f32) -> f32 {
    let mut values: Vec<f32> = numeric(outcomes).map(|(_, v)| v).collect();
    if values.is_empty() {
        return default_reward;
    }
    values.sort_by(f32::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// How per-step rewards are propagated back through an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultistepRewardKind {
    Identity,
    SuffixSum,
    #[default]
    SuffixMean,
}

impl MultistepRewardKind {
    pub fn apply(self, rewards: &[f32]) -> Vec<f32> {
        match self {
            MultistepRewardKind::Identity => rewards.to_vec(),
            MultistepRewardKind::SuffixSum => suffix_sum(rewards),
            MultistepRewardKind::SuffixMean => suffix_mean(rewards),
        }
    }
}

pub fn suffix_sum(rewards: &[f32]) -> Vec<f32> {
    let mut out = vec![0f32; rewards.len()];
    let mut acc = 0f32;
    for (i, r) in rewards.iter().enumerate().rev() {
        acc += r;
        out[i] = acc;
    }
    out
}

pub fn suffix_mean(rewards: &[f32]) -> Vec<f32> {
    let n = rewards.len();
    suffix_sum(rewards)
        .into_iter()
        .enumerate()
        .map(|(i, s)| s / (n - i) as f32)
        .collect()
}
