//! Pluggable model interface used by training jobs.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::linear_patch::LinearPatchFactory;
use crate::image_source::PixelBuffer;

/// Name of the built-in architecture.
pub const LINEAR_PATCH_ARCHITECTURE: &str = "linear_patch";

/// Failures raised by a model during construction or optimization.
///
/// None of these are retried; a job hitting one fails.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model ran out of memory: {0}")]
    ResourceExhausted(String),
    #[error("Compute device error: {0}")]
    Device(String),
    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
    #[error("Numerical failure: {0}")]
    Numeric(String),
}

impl ModelError {
    /// Resource and device errors indicate the host cannot run the job at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::Device(_))
    }
}

/// Architecture-independent training parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Architecture-specific knobs (for `linear_patch`: `grid`, `l2`).
    #[serde(default)]
    pub params: toml::Table,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: default_architecture(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            params: toml::Table::new(),
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.architecture.trim().is_empty() {
            return Err(ModelError::InvalidConfig("architecture is empty".into()));
        }
        if self.epochs == 0 {
            return Err(ModelError::InvalidConfig("epochs must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ModelError::InvalidConfig("batch_size must be >= 1".into()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ModelError::InvalidConfig("learning_rate must be > 0".into()));
        }
        Ok(())
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        match self.params.get(name)? {
            toml::Value::Float(value) => Some(*value),
            toml::Value::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn param_u32(&self, name: &str) -> Option<u32> {
        match self.params.get(name)? {
            toml::Value::Integer(value) => u32::try_from(*value).ok(),
            _ => None,
        }
    }
}

fn default_architecture() -> String {
    LINEAR_PATCH_ARCHITECTURE.to_string()
}

fn default_epochs() -> u32 {
    10
}

fn default_batch_size() -> u32 {
    16
}

fn default_learning_rate() -> f64 {
    0.05
}

/// A materialized sample: crop pixels plus the dataset class index.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub pixels: PixelBuffer,
    pub class_index: usize,
}

/// Validation result for one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
}

/// A model being optimized by one job on one worker thread.
///
/// Implementations must draw every random choice from the `rng` they are
/// handed so that a fixed seed reproduces the trajectory. Bit-exact
/// reproduction additionally requires a deterministic numeric backend;
/// multithreaded or GPU kernels only reproduce as far as their library allows.
pub trait TrainableModel: Send {
    /// Run one optimizer step over `batch` and return its mean loss.
    fn train_step(
        &mut self,
        batch: &[&TrainingExample],
        rng: &mut StdRng,
    ) -> Result<f32, ModelError>;

    fn evaluate(&mut self, examples: &[TrainingExample]) -> Result<Evaluation, ModelError>;

    /// Serialize learned parameters.
    fn export(&self) -> Result<serde_json::Value, ModelError>;
}

/// Builds models for one architecture name.
pub trait ModelFactory: Send + Sync {
    fn architecture(&self) -> &str;

    fn build(
        &self,
        config: &ModelConfig,
        classes: &[String],
        rng: &mut StdRng,
    ) -> Result<Box<dyn TrainableModel>, ModelError>;
}

/// Architecture name to factory lookup.
#[derive(Clone)]
pub struct ModelRegistry {
    factories: HashMap<String, Arc<dyn ModelFactory>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(LinearPatchFactory));
        registry
    }
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Add or replace the factory for its architecture.
    pub fn register(&mut self, factory: Arc<dyn ModelFactory>) {
        self.factories
            .insert(factory.architecture().to_string(), factory);
    }

    pub fn get(&self, architecture: &str) -> Option<Arc<dyn ModelFactory>> {
        self.factories.get(architecture).cloned()
    }

    pub fn architectures(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
