//! Durable JSON records describing how a job was configured and how it ended.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{JobFailure, JobId, JobState, ModelConfig};
use crate::app_dirs;
use crate::dataset::{Dataset, SamplingPolicy};
use crate::image_source::ImageId;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Failed to write job record {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read job record {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid job record {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to serialize job record: {0}")]
    Serialize(serde_json::Error),
    #[error(transparent)]
    AppDir(#[from] app_dirs::AppDirError),
}

/// Everything needed to reproduce a job, plus its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub image_id: ImageId,
    pub snapshot_version: u64,
    /// Seed the dataset was built with.
    pub seed: u64,
    pub split_ratio: f64,
    pub sampling_policy: SamplingPolicy,
    /// Seed driving model initialization and batch order.
    pub training_seed: u64,
    pub model_config: ModelConfig,
    pub dataset_fingerprint: String,
    pub classes: Vec<String>,
    pub created_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    pub state: JobState,
    #[serde(default)]
    pub failure: Option<JobFailure>,
    #[serde(default)]
    pub last_epoch: u32,
    #[serde(default)]
    pub last_step: u64,
}

impl JobRecord {
    pub(super) fn new(
        job_id: JobId,
        dataset: &Dataset,
        model_config: ModelConfig,
        training_seed: u64,
    ) -> Self {
        let spec = dataset.spec();
        Self {
            job_id,
            image_id: spec.image_id.clone(),
            snapshot_version: spec.snapshot_version,
            seed: spec.seed,
            split_ratio: spec.split_ratio,
            sampling_policy: spec.sampling_policy.clone(),
            training_seed,
            model_config,
            dataset_fingerprint: dataset.fingerprint().to_string(),
            classes: dataset.classes().to_vec(),
            created_at: timestamp_now(),
            finished_at: None,
            state: JobState::Preparing,
            failure: None,
            last_epoch: 0,
            last_step: 0,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.job_id)
    }
}

pub(super) fn timestamp_now() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Write `<dir>/<job_id>.json` atomically.
pub fn save_record(dir: &Path, record: &JobRecord) -> Result<PathBuf, RecordError> {
    std::fs::create_dir_all(dir).map_err(|source| RecordError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(record.file_name());
    let data = serde_json::to_vec_pretty(record).map_err(RecordError::Serialize)?;
    crate::atomic_file::atomic_write(&path, &data).map_err(|source| RecordError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Write the record under `<app root>/jobs`.
pub fn save_record_to_jobs_dir(record: &JobRecord) -> Result<PathBuf, RecordError> {
    save_record(&app_dirs::jobs_dir()?, record)
}

pub fn load_record(path: &Path) -> Result<JobRecord, RecordError> {
    let bytes = std::fs::read(path).map_err(|source| RecordError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| RecordError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
