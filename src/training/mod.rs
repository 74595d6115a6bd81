//! Training orchestration: job lifecycle, background workers and models.
//!
//! Jobs run on dedicated worker threads. The orchestrator only ever flips
//! flags in a job's shared control block, so every request returns without
//! waiting on training work.

mod control;
mod job;
mod linear_patch;
mod model;
mod orchestrator;
mod record;
mod runner;
mod state;

use thiserror::Error;

use crate::annotations::RegionId;
use crate::image_source::{ImageError, ImageId};
use crate::metrics::MetricsError;

pub use job::{FailureKind, JobFailure, JobHandle, JobId, JobProgress, ModelArtifact};
pub use linear_patch::LinearPatchModel;
pub use model::{
    Evaluation, LINEAR_PATCH_ARCHITECTURE, ModelConfig, ModelError, ModelFactory, ModelRegistry,
    TrainableModel, TrainingExample,
};
pub use orchestrator::Orchestrator;
pub use record::{JobRecord, RecordError, load_record, save_record, save_record_to_jobs_dir};
pub use state::JobState;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("Job {job_id} is already training on {image_id}")]
    JobAlreadyRunning { image_id: ImageId, job_id: JobId },
    #[error("Unknown job {0}")]
    UnknownJob(JobId),
    #[error("No model registered for architecture {0:?}")]
    UnknownArchitecture(String),
    #[error("Cannot {operation} job {job_id} while it is {state}")]
    UnsupportedOperation {
        job_id: JobId,
        operation: &'static str,
        state: JobState,
    },
    #[error("Job {0} has not finished yet")]
    JobStillActive(JobId),
    #[error("Dataset was built for {dataset}, but the image source is {image}")]
    ImageMismatch { dataset: ImageId, image: ImageId },
    #[error("Failed to read {region} after {attempts} attempt(s): {source}")]
    SampleRead {
        region: RegionId,
        attempts: u32,
        source: ImageError,
    },
    #[error("Model failure: {0}")]
    Model(#[from] ModelError),
    #[error("Image {0} was removed while the job was running")]
    ImageRemoved(ImageId),
    #[error("Metric stream rejected an event: {0}")]
    MetricStream(#[from] MetricsError),
    #[error("Failed to spawn training worker: {0}")]
    Spawn(std::io::Error),
}

impl JobFailure {
    pub fn from_error(err: &TrainingError) -> Self {
        let kind = match err {
            TrainingError::SampleRead { .. } => FailureKind::SampleRead,
            TrainingError::ImageRemoved(_) => FailureKind::ImageRemoved,
            TrainingError::MetricStream(_) => FailureKind::MetricStream,
            TrainingError::Model(ModelError::ResourceExhausted(_)) => {
                FailureKind::ResourceExhausted
            }
            TrainingError::Model(ModelError::Device(_)) => FailureKind::Device,
            _ => FailureKind::Model,
        };
        JobFailure::new(kind, err.to_string())
    }
}
