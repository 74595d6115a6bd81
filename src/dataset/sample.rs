use serde::{Deserialize, Serialize};

use super::SamplingPolicy;
use crate::annotations::RegionId;
use crate::image_source::{BoundingBox, ImageError, ImageId, ImageSource, PixelBuffer};

/// One labeled training unit: a crop reference plus how it was drawn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    pub region_id: RegionId,
    pub label: String,
    pub class_index: usize,
    pub level: usize,
    pub crop: BoundingBox,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    /// Generation ordinal before shuffling. Together with the seed it fixes
    /// every random draw that produced this sample.
    pub draw_index: u64,
}

impl Sample {
    /// Read the crop and apply the recorded flips.
    pub fn materialize(&self, source: &dyn ImageSource) -> Result<PixelBuffer, ImageError> {
        let mut pixels = source.read_region(self.crop, self.level)?;
        if self.flip_horizontal {
            pixels.flip_horizontal();
        }
        if self.flip_vertical {
            pixels.flip_vertical();
        }
        Ok(pixels)
    }
}

/// Inputs that fully determine a dataset, given the snapshot they name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub image_id: ImageId,
    pub snapshot_version: u64,
    pub seed: u64,
    pub split_ratio: f64,
    pub sampling_policy: SamplingPolicy,
}

/// Immutable train/validation split built from one snapshot and one seed.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    spec: DatasetSpec,
    classes: Vec<String>,
    train: Vec<Sample>,
    validation: Vec<Sample>,
    fingerprint: String,
}

#[derive(Serialize)]
struct CanonicalDataset<'a> {
    spec: &'a DatasetSpec,
    split_ratio_bits: u64,
    classes: &'a [String],
    train: &'a [Sample],
    validation: &'a [Sample],
}

impl Dataset {
    pub(super) fn new(
        spec: DatasetSpec,
        classes: Vec<String>,
        train: Vec<Sample>,
        validation: Vec<Sample>,
    ) -> Self {
        let fingerprint = fingerprint(&spec, &classes, &train, &validation);
        Self {
            spec,
            classes,
            train,
            validation,
            fingerprint,
        }
    }

    pub fn spec(&self) -> &DatasetSpec {
        &self.spec
    }

    pub fn image_id(&self) -> &ImageId {
        &self.spec.image_id
    }

    pub fn seed(&self) -> u64 {
        self.spec.seed
    }

    /// Sorted distinct labels; `Sample::class_index` indexes this list.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn train(&self) -> &[Sample] {
        &self.train
    }

    pub fn validation(&self) -> &[Sample] {
        &self.validation
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// BLAKE3 hex digest over the dataset content.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn fingerprint(
    spec: &DatasetSpec,
    classes: &[String],
    train: &[Sample],
    validation: &[Sample],
) -> String {
    let canonical = CanonicalDataset {
        spec,
        split_ratio_bits: spec.split_ratio.to_bits(),
        classes,
        train,
        validation,
    };
    let mut hasher = blake3::Hasher::new();
    // Plain data structs cannot fail to serialize; the Debug form is a fallback only.
    let bytes = serde_json::to_vec(&canonical)
        .unwrap_or_else(|_| format!("{:?}", (spec, classes, train, validation)).into_bytes());
    hasher.update(&bytes);
    hasher.finalize().to_hex().to_string()
}
