// src/services/loop_info.rs
//! Loop-level settings with one-time locking.

use crate::protocol::event::{LearningMode, ProblemType};
use crate::services::reward::{MultistepRewardKind, RewardFunctionKind};

/// A setting that can be locked by a sticky write. Once locked, later writes
/// (sticky or not) never change it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sticky<T> {
    value: Option<T>,
    locked: bool,
}

impl<T> Default for Sticky<T> {
    fn default() -> Self {
        Self {
            value: None,
            locked: false,
        }
    }
}

impl<T: PartialEq> Sticky<T> {
    pub fn with_default(value: T) -> Self {
        Self {
            value: Some(value),
            locked: false,
        }
    }

    /// Returns false when the write was refused because a different value is
    /// already locked in.
    pub fn set(&mut self, value: T, sticky: bool) -> bool {
        if self.locked {
            return self.value.as_ref() == Some(&value);
        }
        self.value = Some(value);
        self.locked = sticky;
        true
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl<T: Copy + PartialEq> Sticky<T> {
    pub fn value(&self) -> Option<T> {
        self.value
    }
}

#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub reward_function: Sticky<RewardFunctionKind>,
    pub default_reward: Sticky<f32>,
    pub learning_mode: Sticky<LearningMode>,
    pub problem_type: Sticky<ProblemType>,
    pub use_client_time: Sticky<bool>,
    pub multistep_reward: Sticky<MultistepRewardKind>,
}

impl Default for LoopInfo {
    fn default() -> Self {
        Self {
            reward_function: Sticky::default(),
            default_reward: Sticky::default(),
            learning_mode: Sticky::default(),
            problem_type: Sticky::default(),
            use_client_time: Sticky::with_default(false),
            multistep_reward: Sticky::with_default(MultistepRewardKind::default()),
        }
    }
}

impl LoopInfo {
    pub fn is_configured(&self) -> bool {
        self.missing_fields().is_empty()
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.reward_function.is_set() {
            missing.push("reward_function");
        }
        if !self.default_reward.is_set() {
            missing.push("default_reward");
        }
        if !self.learning_mode.is_set() {
            missing.push("learning_mode");
        }
        if !self.problem_type.is_set() {
            missing.push("problem_type");
        }
        missing
    }

    pub fn reward_function(&self) -> RewardFunctionKind {
        self.reward_function
            .value()
            .unwrap_or(RewardFunctionKind::Earliest)
    }

    pub fn default_reward(&self) -> f32 {
        self.default_reward.value().unwrap_or(0.0)
    }

    pub fn learning_mode(&self) -> LearningMode {
        self.learning_mode.value().unwrap_or(LearningMode::Online)
    }

    pub fn problem_type(&self) -> ProblemType {
        self.problem_type.value().unwrap_or(ProblemType::Unknown)
    }

    pub fn use_client_time(&self) -> bool {
        self.use_client_time.value().unwrap_or(false)
    }

    pub fn multistep_reward(&self) -> MultistepRewardKind {
        self.multistep_reward.value().unwrap_or_default()
    }
}
