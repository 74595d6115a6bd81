//! Deterministic conversion of annotation snapshots into training datasets.

mod builder;
mod policy;
mod sample;

use thiserror::Error;

use crate::image_source::ImageId;

pub use builder::DatasetBuilder;
pub use policy::SamplingPolicy;
pub use sample::{Dataset, DatasetSpec, Sample};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Snapshot has no regions to sample")]
    EmptyAnnotationSet,
    #[error("{total} samples cannot fill both splits ({train} train / {validation} validation)")]
    InsufficientSamples {
        total: usize,
        train: usize,
        validation: usize,
    },
    #[error("Split ratio {0} must lie strictly between 0 and 1")]
    InvalidSplitRatio(f64),
    #[error("Invalid sampling policy: {0}")]
    InvalidPolicy(String),
    #[error("Sampling level {level} does not exist (image has {levels} levels)")]
    InvalidLevel { level: usize, levels: usize },
    #[error("Snapshot belongs to {snapshot}, not {image}")]
    ImageMismatch { snapshot: ImageId, image: ImageId },
}
