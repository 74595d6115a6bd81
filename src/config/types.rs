use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::defaults::*;
use crate::dataset::SamplingPolicy;
use crate::training::ModelConfig;

/// Errors that may occur while loading or saving pipeline settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to create the config directory.
    #[error("Unable to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to read a config file.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to write a config file.
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to parse TOML config.
    #[error("Invalid config at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Failed to serialize config to TOML.
    #[error("Failed to serialize config to TOML at {path}: {source}")]
    SerializeToml {
        path: PathBuf,
        source: toml::ser::Error,
    },
    /// No usable config directory found.
    #[error("No suitable config directory found")]
    NoConfigDir,
}

/// Defaults applied when the presentation layer asks for a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSettings {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_split_ratio")]
    pub split_ratio: f64,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            split_ratio: default_split_ratio(),
        }
    }
}

/// Worker behavior shared by every training job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// Extra attempts for a sample read that failed with a transient error.
    #[serde(default = "default_max_sample_retries")]
    pub max_sample_retries: u32,
    /// Backoff before retry `n` is `n * retry_backoff_ms`.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Emit an intra-epoch `train_loss` event every N optimizer steps.
    #[serde(default)]
    pub step_metrics_every: Option<u64>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            max_sample_retries: default_max_sample_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            step_metrics_every: None,
        }
    }
}

/// Everything stored in `config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub dataset: DatasetSettings,
    #[serde(default)]
    pub sampling: SamplingPolicy,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub model: ModelConfig,
}

impl PipelineSettings {
    /// Clamp values that would otherwise be rejected downstream.
    pub fn normalized(mut self) -> Self {
        if !self.dataset.split_ratio.is_finite() {
            self.dataset.split_ratio = default_split_ratio();
        }
        self.dataset.split_ratio = self
            .dataset
            .split_ratio
            .clamp(MIN_SPLIT_RATIO, MAX_SPLIT_RATIO);
        self.sampling.crop_size = self.sampling.crop_size.max(1);
        self.sampling.samples_per_region = self.sampling.samples_per_region.max(1);
        self.training.max_sample_retries = clamp_sample_retries(self.training.max_sample_retries);
        self.training.retry_backoff_ms = clamp_retry_backoff(self.training.retry_backoff_ms);
        self.training.step_metrics_every = self.training.step_metrics_every.filter(|n| *n > 0);
        self.model.epochs = self.model.epochs.max(1);
        self.model.batch_size = self.model.batch_size.max(1);
        if !self.model.learning_rate.is_finite() || self.model.learning_rate <= 0.0 {
            self.model.learning_rate = ModelConfig::default().learning_rate;
        }
        self
    }
}
