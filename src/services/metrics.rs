// src/services/metrics.rs
use std::{fs, path::Path};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters collected while draining batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JoinerMetrics {
    pub number_of_learned_events: u64,
    pub number_of_skip_learn_events: u64,
    pub number_of_dropped_events: u64,
    pub number_of_events_zero_actions: u64,
    pub sum_original_reward: f64,
    pub sum_cost_original_baseline: f64,
    pub sum_cost_original_first_slot: f64,
    pub label_equal_baseline_first_slot: u64,
    pub label_not_equal_baseline_first_slot: u64,
    pub sum_cost_original_label_equal_baseline_first_slot: f64,
    pub first_event_id: Option<String>,
    pub first_event_time: Option<DateTime<Utc>>,
    pub last_event_id: Option<String>,
    pub last_event_time: Option<DateTime<Utc>>,
}

impl JoinerMetrics {
    pub fn record_learned(&mut self, event_id: &str, ts: DateTime<Utc>, original_reward: f32) {
        self.number_of_learned_events += 1;
        self.sum_original_reward += f64::from(original_reward);
        if self.first_event_id.is_none() {
            self.first_event_id = Some(event_id.to_string());
            self.first_event_time = Some(ts);
        }
        self.last_event_id = Some(event_id.to_string());
        self.last_event_time = Some(ts);
    }

    pub fn record_skip_learn(&mut self) {
        self.number_of_skip_learn_events += 1;
    }

    pub fn record_dropped(&mut self) {
        self.number_of_dropped_events += 1;
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing metrics to {}", path.display()))?;
        Ok(())
    }
}
