//! Built-in `linear_patch` model: softmax regression over pooled crop colors.

use rand::Rng;
use rand::rngs::StdRng;
use serde_json::json;

use super::model::{
    Evaluation, LINEAR_PATCH_ARCHITECTURE, ModelConfig, ModelError, ModelFactory, TrainableModel,
    TrainingExample,
};
use crate::image_source::PixelBuffer;

const DEFAULT_GRID: u32 = 4;
const MAX_GRID: u32 = 32;
const DEFAULT_L2: f64 = 1e-4;

pub(super) struct LinearPatchFactory;

impl ModelFactory for LinearPatchFactory {
    fn architecture(&self) -> &str {
        LINEAR_PATCH_ARCHITECTURE
    }

    fn build(
        &self,
        config: &ModelConfig,
        classes: &[String],
        rng: &mut StdRng,
    ) -> Result<Box<dyn TrainableModel>, ModelError> {
        config.validate()?;
        if classes.is_empty() {
            return Err(ModelError::InvalidConfig("no classes to learn".into()));
        }
        let grid = config.param_u32("grid").unwrap_or(DEFAULT_GRID);
        if grid == 0 || grid > MAX_GRID {
            return Err(ModelError::InvalidConfig(format!(
                "grid must lie in 1..={MAX_GRID}, got {grid}"
            )));
        }
        let l2 = config.param_f64("l2").unwrap_or(DEFAULT_L2);
        if !l2.is_finite() || l2 < 0.0 {
            return Err(ModelError::InvalidConfig("l2 must be >= 0".into()));
        }
        Ok(Box::new(LinearPatchModel::new(
            classes.to_vec(),
            grid as usize,
            config.learning_rate as f32,
            l2 as f32,
            rng,
        )))
    }
}

/// Row-major `classes x dim` weights over a `grid x grid x 3` feature.
#[derive(Debug, Clone)]
pub struct LinearPatchModel {
    classes: Vec<String>,
    grid: usize,
    dim: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
    learning_rate: f32,
    l2: f32,
}

impl LinearPatchModel {
    fn new(
        classes: Vec<String>,
        grid: usize,
        learning_rate: f32,
        l2: f32,
        rng: &mut StdRng,
    ) -> Self {
        let dim = grid * grid * PixelBuffer::CHANNELS;
        let mut weights = vec![0.0f32; classes.len() * dim];
        for w in &mut weights {
            *w = (rng.random::<f32>() - 0.5) * 0.01;
        }
        let bias = vec![0.0f32; classes.len()];
        Self {
            classes,
            grid,
            dim,
            weights,
            bias,
            learning_rate,
            l2,
        }
    }

    fn probabilities(&self, features: &[f32]) -> Vec<f32> {
        let classes = self.classes.len();
        let mut logits = vec![0.0f32; classes];
        for (c, logit) in logits.iter_mut().enumerate() {
            let base = c * self.dim;
            let mut sum = self.bias[c];
            for (i, x) in features.iter().enumerate() {
                sum += self.weights[base + i] * x;
            }
            *logit = sum;
        }
        softmax(&logits)
    }

    fn check_class(&self, class_index: usize) -> Result<(), ModelError> {
        if class_index >= self.classes.len() {
            return Err(ModelError::InvalidConfig(format!(
                "class index {class_index} outside {} classes",
                self.classes.len()
            )));
        }
        Ok(())
    }
}

impl TrainableModel for LinearPatchModel {
    fn train_step(
        &mut self,
        batch: &[&TrainingExample],
        _rng: &mut StdRng,
    ) -> Result<f32, ModelError> {
        if batch.is_empty() {
            return Ok(0.0);
        }
        let classes = self.classes.len();
        let mut grad_w = vec![0.0f32; self.weights.len()];
        let mut grad_b = vec![0.0f32; classes];
        let mut loss = 0.0f32;
        for example in batch {
            self.check_class(example.class_index)?;
            let x = pooled_features(&example.pixels, self.grid);
            let probs = self.probabilities(&x);
            loss -= probs[example.class_index].max(1e-12).ln();
            for c in 0..classes {
                let diff = probs[c] - if c == example.class_index { 1.0 } else { 0.0 };
                let base = c * self.dim;
                for (i, xi) in x.iter().enumerate() {
                    grad_w[base + i] += diff * xi;
                }
                grad_b[c] += diff;
            }
        }
        let inv = 1.0 / batch.len() as f32;
        let lr = self.learning_rate;
        for (idx, weight) in self.weights.iter_mut().enumerate() {
            let l2_term = self.l2 * *weight;
            *weight -= lr * (grad_w[idx] * inv + l2_term);
        }
        for (bias, grad) in self.bias.iter_mut().zip(&grad_b) {
            *bias -= lr * grad * inv;
        }
        let loss = loss * inv;
        if !loss.is_finite() {
            return Err(ModelError::Numeric(format!("training loss became {loss}")));
        }
        Ok(loss)
    }

    fn evaluate(&mut self, examples: &[TrainingExample]) -> Result<Evaluation, ModelError> {
        if examples.is_empty() {
            return Err(ModelError::Numeric("empty evaluation set".into()));
        }
        let mut loss = 0.0f32;
        let mut correct = 0usize;
        for example in examples {
            self.check_class(example.class_index)?;
            let probs = self.probabilities(&pooled_features(&example.pixels, self.grid));
            loss -= probs[example.class_index].max(1e-12).ln();
            if argmax(&probs) == example.class_index {
                correct += 1;
            }
        }
        let n = examples.len() as f32;
        Ok(Evaluation {
            loss: loss / n,
            accuracy: correct as f32 / n,
        })
    }

    fn export(&self) -> Result<serde_json::Value, ModelError> {
        Ok(json!({
            "architecture": LINEAR_PATCH_ARCHITECTURE,
            "classes": self.classes,
            "grid": self.grid,
            "weights": self.weights,
            "bias": self.bias,
        }))
    }
}

/// Mean RGB per grid cell, scaled to `[0, 1]`.
pub(crate) fn pooled_features(pixels: &PixelBuffer, grid: usize) -> Vec<f32> {
    let channels = PixelBuffer::CHANNELS;
    let mut sums = vec![0.0f32; grid * grid * channels];
    let mut counts = vec![0u32; grid * grid];
    let (width, height) = (pixels.width() as usize, pixels.height() as usize);
    for y in 0..height {
        let cell_y = y * grid / height;
        for x in 0..width {
            let cell = cell_y * grid + x * grid / width;
            let rgb = pixels.pixel(x as u32, y as u32);
            for (ch, value) in rgb.iter().enumerate() {
                sums[cell * channels + ch] += *value as f32;
            }
            counts[cell] += 1;
        }
    }
    for (cell, count) in counts.iter().enumerate() {
        if *count == 0 {
            continue;
        }
        let scale = 1.0 / (*count as f32 * 255.0);
        for ch in 0..channels {
            sums[cell * channels + ch] *= scale;
        }
    }
    sums
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![1.0 / logits.len() as f32; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &value) in values.iter().enumerate() {
        if value > best_val {
            best_val = value;
            best = idx;
        }
    }
    best
}
