use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng, seq::SliceRandom};
use tracing::debug;

use super::sample::{Dataset, DatasetSpec, Sample};
use super::{DatasetError, SamplingPolicy};
use crate::annotations::{AnnotationSnapshot, Region};
use crate::image_source::{BoundingBox, ImageInfo, LevelInfo};

/// Turns annotation snapshots of one image into datasets.
pub struct DatasetBuilder<'a> {
    image: &'a ImageInfo,
}

impl<'a> DatasetBuilder<'a> {
    pub fn new(image: &'a ImageInfo) -> Self {
        Self { image }
    }

    /// Build a dataset; identical inputs always yield identical datasets.
    ///
    /// Regions are visited in ascending id order. All draws (jitter, flips,
    /// shuffle) come from one `StdRng` seeded with `seed`. After shuffling, the
    /// first `floor(n * split_ratio)` samples form the train split.
    pub fn build(
        &self,
        snapshot: &AnnotationSnapshot,
        seed: u64,
        split_ratio: f64,
        policy: &SamplingPolicy,
    ) -> Result<Dataset, DatasetError> {
        if !split_ratio.is_finite() || split_ratio <= 0.0 || split_ratio >= 1.0 {
            return Err(DatasetError::InvalidSplitRatio(split_ratio));
        }
        policy.validate().map_err(DatasetError::InvalidPolicy)?;
        if snapshot.image_id() != &self.image.id {
            return Err(DatasetError::ImageMismatch {
                snapshot: snapshot.image_id().clone(),
                image: self.image.id.clone(),
            });
        }
        let level = *self
            .image
            .level(policy.level)
            .ok_or(DatasetError::InvalidLevel {
                level: policy.level,
                levels: self.image.level_count(),
            })?;

        let regions: Vec<&Region> = snapshot
            .regions()
            .filter(|region| policy.accepts_label(&region.label))
            .collect();
        if regions.is_empty() {
            return Err(DatasetError::EmptyAnnotationSet);
        }
        let classes: Vec<String> = regions
            .iter()
            .map(|region| region.label.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut samples = Vec::with_capacity(regions.len() * policy.samples_per_region as usize);
        for region in &regions {
            let class_index = classes
                .binary_search(&region.label)
                .map_err(|_| DatasetError::InvalidPolicy(format!("unknown label {}", region.label)))?;
            for _ in 0..policy.samples_per_region {
                let draw_index = samples.len() as u64;
                samples.push(draw_sample(region, class_index, &level, policy, draw_index, &mut rng));
            }
        }
        samples.shuffle(&mut rng);

        let total = samples.len();
        let train_len = (total as f64 * split_ratio).floor() as usize;
        if train_len == 0 || train_len == total {
            return Err(DatasetError::InsufficientSamples {
                total,
                train: train_len,
                validation: total - train_len,
            });
        }
        let validation = samples.split_off(train_len);
        let dataset = Dataset::new(
            DatasetSpec {
                image_id: snapshot.image_id().clone(),
                snapshot_version: snapshot.version(),
                seed,
                split_ratio,
                sampling_policy: policy.clone(),
            },
            classes,
            samples,
            validation,
        );
        debug!(
            "Built dataset for {} v{} (seed {}): {} train / {} validation, fingerprint {}",
            dataset.image_id(),
            snapshot.version(),
            seed,
            dataset.train().len(),
            dataset.validation().len(),
            dataset.fingerprint()
        );
        Ok(dataset)
    }
}

fn draw_sample(
    region: &Region,
    class_index: usize,
    level: &LevelInfo,
    policy: &SamplingPolicy,
    draw_index: u64,
    rng: &mut StdRng,
) -> Sample {
    let center = region.geometry.extent().center();
    let scale = level.downsample.max(1) as f64;
    let jitter = policy.jitter as i64;
    let (dx, dy) = if jitter > 0 {
        (
            rng.random_range(-jitter..=jitter),
            rng.random_range(-jitter..=jitter),
        )
    } else {
        (0, 0)
    };
    let flip_horizontal = policy.flip_horizontal && rng.random_bool(0.5);
    let flip_vertical = policy.flip_vertical && rng.random_bool(0.5);

    let width = policy.crop_size.min(level.width);
    let height = policy.crop_size.min(level.height);
    let cx = (center.x / scale).round() as i64 + dx;
    let cy = (center.y / scale).round() as i64 + dy;
    let x = (cx - width as i64 / 2).clamp(0, (level.width - width) as i64) as u32;
    let y = (cy - height as i64 / 2).clamp(0, (level.height - height) as i64) as u32;

    Sample {
        region_id: region.id,
        label: region.label.clone(),
        class_index,
        level: policy.level,
        crop: BoundingBox::new(x, y, width, height),
        flip_horizontal,
        flip_vertical,
        draw_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{AnnotationStore, Geometry};
    use crate::image_source::{ImageId, pyramid_levels};

    fn image_info(width: u32, height: u32) -> ImageInfo {
        ImageInfo {
            id: ImageId::new("slide"),
            width,
            height,
            levels: pyramid_levels(width, height, 64),
            tile_size: 64,
            sha256: None,
        }
    }

    fn snapshot_with(labels: &[&str]) -> AnnotationSnapshot {
        let store = AnnotationStore::new();
        let image = ImageId::new("slide");
        store.register_image(&image);
        for (i, label) in labels.iter().enumerate() {
            let x = 20.0 + i as f64 * 40.0;
            store
                .add_region(
                    &image,
                    Geometry::polygon([(x, 20.0), (x + 10.0, 20.0), (x + 10.0, 30.0)]),
                    label,
                )
                .unwrap();
        }
        store.snapshot(&image).unwrap()
    }

    #[test]
    fn same_inputs_build_identical_datasets() {
        let info = image_info(256, 128);
        let snapshot = snapshot_with(&["a", "b", "a", "c", "b"]);
        let policy = SamplingPolicy {
            crop_size: 16,
            samples_per_region: 3,
            jitter: 5,
            flip_horizontal: true,
            flip_vertical: true,
            ..SamplingPolicy::default()
        };
        let builder = DatasetBuilder::new(&info);
        let first = builder.build(&snapshot, 99, 0.7, &policy).unwrap();
        let second = builder.build(&snapshot, 99, 0.7, &policy).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.len(), 15);
        assert_eq!(first.train().len(), 10);
        assert_eq!(first.classes(), &["a", "b", "c"]);

        let reseeded = builder.build(&snapshot, 100, 0.7, &policy).unwrap();
        assert_ne!(first.fingerprint(), reseeded.fingerprint());
    }

    #[test]
    fn crops_stay_inside_the_level() {
        let info = image_info(40, 30);
        let snapshot = snapshot_with(&["edge", "edge"]);
        let policy = SamplingPolicy {
            crop_size: 64,
            jitter: 50,
            samples_per_region: 4,
            ..SamplingPolicy::default()
        };
        let dataset = DatasetBuilder::new(&info)
            .build(&snapshot, 1, 0.5, &policy)
            .unwrap();
        for sample in dataset.train().iter().chain(dataset.validation()) {
            assert!(sample.crop.fits_within(40, 30), "{:?}", sample.crop);
            assert_eq!((sample.crop.width, sample.crop.height), (40, 30));
        }
    }

    #[test]
    fn crops_scale_to_lower_levels() {
        let info = image_info(256, 256);
        let snapshot = snapshot_with(&["a", "b"]);
        let policy = SamplingPolicy {
            crop_size: 8,
            level: 1,
            ..SamplingPolicy::default()
        };
        let dataset = DatasetBuilder::new(&info)
            .build(&snapshot, 5, 0.5, &policy)
            .unwrap();
        let sample = dataset
            .train()
            .iter()
            .chain(dataset.validation())
            .find(|sample| sample.label == "a")
            .unwrap();
        // Region "a" spans x 20..30, y 20..30 at level 0, centered (25, 25).
        assert_eq!(sample.crop, BoundingBox::new(9, 9, 8, 8));
        assert_eq!(sample.level, 1);
    }

    #[test]
    fn rejects_bad_inputs() {
        let info = image_info(128, 128);
        let builder = DatasetBuilder::new(&info);
        let policy = SamplingPolicy::default();
        assert!(matches!(
            builder.build(&snapshot_with(&[]), 1, 0.8, &policy),
            Err(DatasetError::EmptyAnnotationSet)
        ));
        assert!(matches!(
            builder.build(&snapshot_with(&["a"]), 1, 0.8, &policy),
            Err(DatasetError::InsufficientSamples {
                total: 1,
                train: 0,
                validation: 1
            })
        ));
        for ratio in [0.0, 1.0, f64::NAN] {
            assert!(matches!(
                builder.build(&snapshot_with(&["a", "b"]), 1, ratio, &policy),
                Err(DatasetError::InvalidSplitRatio(_))
            ));
        }
        let filtered = SamplingPolicy {
            labels: Some(vec!["zzz".to_string()]),
            ..SamplingPolicy::default()
        };
        assert!(matches!(
            builder.build(&snapshot_with(&["a", "b"]), 1, 0.5, &filtered),
            Err(DatasetError::EmptyAnnotationSet)
        ));
        let deep = SamplingPolicy {
            level: 9,
            ..SamplingPolicy::default()
        };
        assert!(matches!(
            builder.build(&snapshot_with(&["a", "b"]), 1, 0.5, &deep),
            Err(DatasetError::InvalidLevel { .. })
        ));
    }

    #[test]
    fn label_filter_limits_classes() {
        let info = image_info(256, 64);
        let policy = SamplingPolicy {
            labels: Some(vec!["b".to_string()]),
            samples_per_region: 2,
            ..SamplingPolicy::default()
        };
        let dataset = DatasetBuilder::new(&info)
            .build(&snapshot_with(&["a", "b", "b"]), 3, 0.5, &policy)
            .unwrap();
        assert_eq!(dataset.classes(), &["b"]);
        assert_eq!(dataset.len(), 4);
    }
}
