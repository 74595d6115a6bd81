use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JobState;
use crate::image_source::ImageId;

/// Unique identity of a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First uuid group, for thread names and log lines.
    pub fn short(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-side reference to a started job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub image_id: ImageId,
}

/// Broad cause of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SampleRead,
    ResourceExhausted,
    Device,
    Model,
    ImageRemoved,
    /// The metric stream refused an event.
    MetricStream,
    Panic,
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Trained parameters produced by a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub job_id: JobId,
    pub architecture: String,
    pub classes: Vec<String>,
    pub dataset_fingerprint: String,
    pub parameters: serde_json::Value,
}

/// Live position of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobProgress {
    pub state: JobState,
    /// Last epoch that started, 0 before training begins.
    pub epoch: u32,
    pub step: u64,
    pub planned_epochs: u32,
}
