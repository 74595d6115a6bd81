use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{error, info, warn};

use super::control::{JobControl, Stop};
use super::{
    FailureKind, JobFailure, JobId, JobState, ModelArtifact, ModelConfig, ModelFactory,
    TrainingError, TrainingExample,
};
use crate::config::TrainingSettings;
use crate::dataset::{Dataset, Sample};
use crate::image_source::{ImageId, ImageSource, PixelBuffer};
use crate::metrics::{MetricEvent, MetricsBridge};

pub(super) type ActiveJobs = Arc<Mutex<HashMap<ImageId, JobId>>>;

/// Everything one worker thread needs; owned by that thread.
pub(super) struct JobRunner {
    pub(super) job_id: JobId,
    pub(super) image_id: ImageId,
    pub(super) dataset: Arc<Dataset>,
    pub(super) source: Arc<dyn ImageSource>,
    pub(super) model_config: ModelConfig,
    pub(super) seed: u64,
    pub(super) settings: TrainingSettings,
    pub(super) factory: Arc<dyn ModelFactory>,
    pub(super) control: Arc<JobControl>,
    pub(super) bridge: Arc<MetricsBridge>,
    pub(super) active: ActiveJobs,
}

impl JobRunner {
    pub(super) fn run(self) {
        info!(
            "Training job {} preparing {} samples for {}",
            self.job_id,
            self.dataset.len(),
            self.image_id
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute()));
        let (state, failure, artifact) = match outcome {
            Ok(Ok(artifact)) => (JobState::Completed, None, Some(artifact)),
            Ok(Err(Stop::Cancelled)) => (JobState::Cancelled, None, None),
            Ok(Err(Stop::Failed(err))) => {
                let failure = JobFailure::from_error(&err);
                match &err {
                    TrainingError::Model(model_err) if model_err.is_fatal() => {
                        error!("Training job {} failed: {}", self.job_id, err)
                    }
                    TrainingError::MetricStream(_) => {
                        error!("Training job {} failed: {}", self.job_id, err)
                    }
                    _ => warn!("Training job {} failed: {}", self.job_id, err),
                }
                (JobState::Failed, Some(failure), None)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Training job {} panicked: {}", self.job_id, message);
                (
                    JobState::Failed,
                    Some(JobFailure::new(FailureKind::Panic, message)),
                    None,
                )
            }
        };
        self.finish(state, failure, artifact);
    }

    fn execute(&self) -> Result<ModelArtifact, Stop> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let train = self.materialize(self.dataset.train())?;
        let validation = self.materialize(self.dataset.validation())?;
        let mut model = self
            .factory
            .build(&self.model_config, self.dataset.classes(), &mut rng)
            .map_err(Stop::model)?;
        self.control.begin_running()?;
        info!(
            "Training job {} running {} epochs over {} train / {} validation samples",
            self.job_id,
            self.model_config.epochs,
            train.len(),
            validation.len()
        );

        let batch_size = self.model_config.batch_size.max(1) as usize;
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut step = 0u64;
        for epoch in 1..=self.model_config.epochs {
            self.control.set_position(epoch, step);
            order.shuffle(&mut rng);
            let batches = order.len().div_ceil(batch_size);
            let mut loss_sum = 0.0f64;
            for (batch_index, chunk) in order.chunks(batch_size).enumerate() {
                self.control.checkpoint()?;
                let batch: Vec<&TrainingExample> = chunk.iter().map(|&i| &train[i]).collect();
                let loss = model.train_step(&batch, &mut rng).map_err(Stop::model)?;
                step += 1;
                loss_sum += loss as f64;
                self.control.set_position(epoch, step);
                // The epoch summary below already covers the last batch.
                if batch_index + 1 < batches && self.step_event_due(step) {
                    self.emit(epoch, step, [("train_loss", loss as f64)])?;
                }
            }
            self.control.checkpoint()?;
            let evaluation = model.evaluate(&validation).map_err(Stop::model)?;
            self.emit(
                epoch,
                step,
                [
                    ("train_loss", loss_sum / batches.max(1) as f64),
                    ("val_loss", evaluation.loss as f64),
                    ("val_accuracy", evaluation.accuracy as f64),
                ],
            )?;
        }

        let parameters = model.export().map_err(Stop::model)?;
        Ok(ModelArtifact {
            job_id: self.job_id.clone(),
            architecture: self.model_config.architecture.clone(),
            classes: self.dataset.classes().to_vec(),
            dataset_fingerprint: self.dataset.fingerprint().to_string(),
            parameters,
        })
    }

    fn step_event_due(&self, step: u64) -> bool {
        self.settings
            .step_metrics_every
            .is_some_and(|every| every > 0 && step % every == 0)
    }

    fn emit<const N: usize>(
        &self,
        epoch: u32,
        step: u64,
        values: [(&str, f64); N],
    ) -> Result<(), Stop> {
        let values: BTreeMap<String, f64> = values
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        let event = MetricEvent::new(self.job_id.clone(), epoch, step, values);
        self.control.publish_if_live(|| {
            self.bridge
                .publish(event)
                .map_err(|err| Stop::Failed(TrainingError::MetricStream(err)))
        })
    }

    fn materialize(&self, samples: &[Sample]) -> Result<Vec<TrainingExample>, Stop> {
        let mut examples = Vec::with_capacity(samples.len());
        for sample in samples {
            self.control.checkpoint()?;
            let pixels = self.read_sample(sample)?;
            examples.push(TrainingExample {
                pixels,
                class_index: sample.class_index,
            });
        }
        Ok(examples)
    }

    fn read_sample(&self, sample: &Sample) -> Result<PixelBuffer, Stop> {
        let mut attempt = 0u32;
        loop {
            match sample.materialize(self.source.as_ref()) {
                Ok(pixels) => return Ok(pixels),
                Err(err) if err.is_transient() && attempt < self.settings.max_sample_retries => {
                    attempt += 1;
                    warn!(
                        "Retrying {} for job {} (attempt {}/{}): {}",
                        sample.region_id,
                        self.job_id,
                        attempt,
                        self.settings.max_sample_retries,
                        err
                    );
                    std::thread::sleep(Duration::from_millis(
                        self.settings.retry_backoff_ms * attempt as u64,
                    ));
                    self.control.checkpoint()?;
                }
                Err(err) => {
                    return Err(Stop::Failed(TrainingError::SampleRead {
                        region: sample.region_id,
                        attempts: attempt + 1,
                        source: err,
                    }));
                }
            }
        }
    }

    /// Close the metric stream, free the image slot, then publish the terminal
    /// state, so waiters observe all three together.
    fn finish(
        &self,
        state: JobState,
        failure: Option<JobFailure>,
        artifact: Option<ModelArtifact>,
    ) {
        if let Err(err) = self.bridge.close(&self.job_id, state) {
            warn!("Metric stream for {} already gone: {}", self.job_id, err);
        }
        {
            let mut active = self.active.lock().unwrap_or_else(|err| err.into_inner());
            if active.get(&self.image_id) == Some(&self.job_id) {
                active.remove(&self.image_id);
            }
        }
        self.control.finish(state, failure, artifact);
        info!("Training job {} finished as {}", self.job_id, state);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
