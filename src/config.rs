// src/config.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing;

use crate::protocol::event::{LearningMode, ProblemType};
use crate::protocol::frame::DEFAULT_MAX_SEGMENT_BYTES;
use crate::services::joiner::Joiner;
use crate::services::reward::{MultistepRewardKind, RewardFunctionKind};

#[derive(Debug, Clone, Deserialize)]
pub struct JoinerConfig {
    #[serde(default, rename = "loop")]
    pub loop_overrides: LoopOverrides,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl JoinerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            Self::from_toml(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using JoinerConfig::default().",
                path.display()
            );
            JoinerConfig::default()
        };
        if let Some(root) = path.parent() {
            cfg.resolve_paths(root);
        }
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str::<JoinerConfig>(text).context("decoding joiner config")
    }

    fn resolve_paths(&mut self, root: &Path) {
        if let Some(p) = &self.output.dsjson_path {
            self.output.dsjson_path = Some(absolutize(root, p));
        }
        if let Some(p) = &self.output.metrics_path {
            self.output.metrics_path = Some(absolutize(root, p));
        }
    }
}

impl Default for JoinerConfig {
    fn default() -> Self {
        Self {
            loop_overrides: LoopOverrides::default(),
            parser: ParserConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Operator settings. Applied sticky, so values read from the stream
/// cannot replace them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoopOverrides {
    #[serde(default)]
    pub reward_function: Option<RewardFunctionKind>,
    #[serde(default)]
    pub default_reward: Option<f32>,
    #[serde(default)]
    pub learning_mode: Option<LearningMode>,
    #[serde(default)]
    pub problem_type: Option<ProblemType>,
    #[serde(default)]
    pub use_client_time: Option<bool>,
    #[serde(default)]
    pub multistep_reward: Option<MultistepRewardKind>,
}

impl LoopOverrides {
    pub fn apply<J: Joiner + ?Sized>(&self, joiner: &mut J) {
        if let Some(v) = self.reward_function {
            joiner.set_reward_function(v, true);
        }
        if let Some(v) = self.default_reward {
            joiner.set_default_reward(v, true);
        }
        if let Some(v) = self.learning_mode {
            joiner.set_learning_mode(v, true);
        }
        if let Some(v) = self.problem_type {
            joiner.set_problem_type(v, true);
        }
        if let Some(v) = self.use_client_time {
            joiner.set_use_client_time(v, true);
        }
        if let Some(v) = self.multistep_reward {
            joiner.set_multistep_reward(v, true);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    /// Caps segment size and how far a compressed payload may inflate.
    #[serde(default = "ParserConfig::default_max_segment_bytes")]
    pub max_segment_bytes: usize,
    #[serde(default)]
    pub multistep: bool,
}

impl ParserConfig {
    fn default_max_segment_bytes() -> usize {
        DEFAULT_MAX_SEGMENT_BYTES
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: Self::default_max_segment_bytes(),
            multistep: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub dsjson_path: Option<PathBuf>,
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}
