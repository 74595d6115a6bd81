//! A model that parks inside a chosen training step until released.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use mregion::training::{
    Evaluation, ModelConfig, ModelError, ModelFactory, ModelRegistry, TrainableModel,
    TrainingExample,
};
use rand::rngs::StdRng;
use serde_json::json;

pub const GATED_ARCHITECTURE: &str = "gated";

pub struct Gate {
    /// Receives the step number once the worker is parked.
    pub reached: Receiver<u64>,
    /// Send (or drop) to let the parked step return.
    pub release: Sender<()>,
}

struct GatedFactory {
    block_at: u64,
    wiring: Mutex<Option<(Sender<u64>, Receiver<()>)>>,
}

impl ModelFactory for GatedFactory {
    fn architecture(&self) -> &str {
        GATED_ARCHITECTURE
    }

    fn build(
        &self,
        _config: &ModelConfig,
        _classes: &[String],
        _rng: &mut StdRng,
    ) -> Result<Box<dyn TrainableModel>, ModelError> {
        let wiring = self.wiring.lock().unwrap().take();
        Ok(Box::new(GatedModel {
            block_at: self.block_at,
            wiring,
            steps: 0,
        }))
    }
}

struct GatedModel {
    block_at: u64,
    wiring: Option<(Sender<u64>, Receiver<()>)>,
    steps: u64,
}

impl TrainableModel for GatedModel {
    fn train_step(
        &mut self,
        _batch: &[&TrainingExample],
        _rng: &mut StdRng,
    ) -> Result<f32, ModelError> {
        self.steps += 1;
        if self.steps == self.block_at {
            if let Some((reached, release)) = &self.wiring {
                let _ = reached.send(self.steps);
                let _ = release.recv();
            }
        }
        Ok(1.0 / self.steps as f32)
    }

    fn evaluate(&mut self, _examples: &[TrainingExample]) -> Result<Evaluation, ModelError> {
        Ok(Evaluation {
            loss: 0.25,
            accuracy: 0.75,
        })
    }

    fn export(&self) -> Result<serde_json::Value, ModelError> {
        Ok(json!({ "steps": self.steps }))
    }
}

/// Registry with the built-in models plus one that blocks at step `block_at`.
pub fn gated_registry(block_at: u64) -> (ModelRegistry, Gate) {
    let (reached_tx, reached_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let mut models = ModelRegistry::default();
    models.register(Arc::new(GatedFactory {
        block_at,
        wiring: Mutex::new(Some((reached_tx, release_rx))),
    }));
    (
        models,
        Gate {
            reached: reached_rx,
            release: release_tx,
        },
    )
}

/// One step per epoch for the small datasets used in these tests.
pub fn gated_config(epochs: u32) -> ModelConfig {
    ModelConfig {
        architecture: GATED_ARCHITECTURE.to_string(),
        epochs,
        batch_size: 256,
        ..ModelConfig::default()
    }
}
