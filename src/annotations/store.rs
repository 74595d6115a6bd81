use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::geometry::{Geometry, Point};
use super::{AnnotationError, AnnotationSnapshot};
use crate::image_source::ImageId;

/// Store-wide region identifier; allocation order is ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region-{}", self.0)
    }
}

/// One user annotation. Immutable once created; edits replace the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub image_id: ImageId,
    pub geometry: Geometry,
    pub label: String,
    /// Unix milliseconds of the edit that produced this value.
    pub authored_at_ms: i64,
}

/// Physical scale bar drawn on an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleInfo {
    pub p1: Point,
    pub p2: Point,
    /// Physical length of the `p1`-`p2` segment.
    pub value: f64,
    pub unit: String,
}

impl ScaleInfo {
    /// Physical units per level-0 pixel, if the bar has a usable length.
    pub fn units_per_pixel(&self) -> Option<f64> {
        let pixels = self.p1.distance(&self.p2);
        if pixels > 0.0 && self.value.is_finite() && self.value > 0.0 {
            Some(self.value / pixels)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct ImageAnnotations {
    revision: u64,
    regions: BTreeMap<RegionId, Arc<Region>>,
    boundary: Option<Geometry>,
    scale: Option<ScaleInfo>,
    labels: Vec<String>,
}

impl ImageAnnotations {
    fn touch_label(&mut self, label: &str) {
        if !self.labels.iter().any(|existing| existing == label) {
            self.labels.push(label.to_string());
        }
    }
}

/// Versioned, per-image collection of regions.
///
/// Each image's region set sits behind its own mutex; edits on one image never
/// wait on another. Regions are shared as `Arc<Region>`, so a snapshot only
/// copies the membership map.
#[derive(Default)]
pub struct AnnotationStore {
    next_region_id: AtomicU64,
    /// Store-wide, so a re-registered image never repeats a version.
    revisions: AtomicU64,
    images: RwLock<HashMap<ImageId, Arc<Mutex<ImageAnnotations>>>>,
    region_index: RwLock<HashMap<RegionId, ImageId>>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start tracking an image. Re-registering an existing image is a no-op.
    pub fn register_image(&self, image_id: &ImageId) {
        let mut images = self.images.write().unwrap_or_else(|err| err.into_inner());
        if !images.contains_key(image_id) {
            let annotations = ImageAnnotations {
                revision: self.next_revision(),
                ..ImageAnnotations::default()
            };
            images.insert(image_id.clone(), Arc::new(Mutex::new(annotations)));
        }
    }

    pub fn contains_image(&self, image_id: &ImageId) -> bool {
        self.images
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .contains_key(image_id)
    }

    /// Drop an image and all its regions. Existing snapshots stay valid.
    ///
    /// Returns the number of regions removed.
    pub fn remove_image(&self, image_id: &ImageId) -> Result<usize, AnnotationError> {
        let slot = self
            .images
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(image_id)
            .ok_or_else(|| AnnotationError::UnknownImage(image_id.clone()))?;
        let annotations = lock(&slot);
        let mut index = self
            .region_index
            .write()
            .unwrap_or_else(|err| err.into_inner());
        for id in annotations.regions.keys() {
            index.remove(id);
        }
        debug!(
            "Removed image {} with {} regions",
            image_id,
            annotations.regions.len()
        );
        Ok(annotations.regions.len())
    }

    pub fn add_region(
        &self,
        image_id: &ImageId,
        geometry: Geometry,
        label: &str,
    ) -> Result<Arc<Region>, AnnotationError> {
        geometry
            .validate()
            .map_err(AnnotationError::InvalidGeometry)?;
        let label = normalize_label(label)?;
        let slot = self.slot(image_id)?;
        let mut annotations = lock(&slot);
        let id = RegionId(self.next_region_id.fetch_add(1, Ordering::Relaxed) + 1);
        let region = Arc::new(Region {
            id,
            image_id: image_id.clone(),
            geometry,
            label,
            authored_at_ms: now_ms(),
        });
        annotations.touch_label(&region.label);
        annotations.regions.insert(id, region.clone());
        annotations.revision = self.next_revision();
        self.region_index
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(id, image_id.clone());
        debug!("Added {} ({}) on {}", id, region.label, image_id);
        Ok(region)
    }

    /// Replace a region's geometry and/or label.
    pub fn update_region(
        &self,
        id: RegionId,
        geometry: Option<Geometry>,
        label: Option<&str>,
    ) -> Result<Arc<Region>, AnnotationError> {
        if let Some(geometry) = &geometry {
            geometry
                .validate()
                .map_err(AnnotationError::InvalidGeometry)?;
        }
        let label = label.map(normalize_label).transpose()?;
        let image_id = self.image_of(id)?;
        let slot = self.slot(&image_id)?;
        let mut annotations = lock(&slot);
        let current = annotations
            .regions
            .get(&id)
            .cloned()
            .ok_or(AnnotationError::NotFound(id))?;
        let updated = Arc::new(Region {
            id,
            image_id: current.image_id.clone(),
            geometry: geometry.unwrap_or_else(|| current.geometry.clone()),
            label: label.unwrap_or_else(|| current.label.clone()),
            authored_at_ms: now_ms(),
        });
        annotations.touch_label(&updated.label);
        annotations.regions.insert(id, updated.clone());
        annotations.revision = self.next_revision();
        debug!("Updated {} on {}", id, image_id);
        Ok(updated)
    }

    pub fn delete_region(&self, id: RegionId) -> Result<(), AnnotationError> {
        let image_id = self.image_of(id)?;
        let slot = self.slot(&image_id)?;
        let mut annotations = lock(&slot);
        annotations
            .regions
            .remove(&id)
            .ok_or(AnnotationError::NotFound(id))?;
        annotations.revision = self.next_revision();
        self.region_index
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&id);
        debug!("Deleted {} from {}", id, image_id);
        Ok(())
    }

    pub fn region(&self, id: RegionId) -> Result<Arc<Region>, AnnotationError> {
        let image_id = self.image_of(id)?;
        let slot = self.slot(&image_id)?;
        let annotations = lock(&slot);
        annotations
            .regions
            .get(&id)
            .cloned()
            .ok_or(AnnotationError::NotFound(id))
    }

    pub fn set_boundary(
        &self,
        image_id: &ImageId,
        boundary: Option<Geometry>,
    ) -> Result<(), AnnotationError> {
        if let Some(geometry) = &boundary {
            geometry
                .validate()
                .map_err(AnnotationError::InvalidGeometry)?;
        }
        let slot = self.slot(image_id)?;
        let mut annotations = lock(&slot);
        annotations.boundary = boundary;
        annotations.revision = self.next_revision();
        Ok(())
    }

    pub fn set_scale(
        &self,
        image_id: &ImageId,
        scale: Option<ScaleInfo>,
    ) -> Result<(), AnnotationError> {
        if let Some(scale) = &scale {
            if scale.units_per_pixel().is_none() {
                return Err(AnnotationError::InvalidGeometry(
                    "scale bar needs two distinct points and a positive value".to_string(),
                ));
            }
        }
        let slot = self.slot(image_id)?;
        let mut annotations = lock(&slot);
        annotations.scale = scale;
        annotations.revision = self.next_revision();
        Ok(())
    }

    /// Register a label without drawing a region yet.
    pub fn add_label(&self, image_id: &ImageId, label: &str) -> Result<(), AnnotationError> {
        let label = normalize_label(label)?;
        let slot = self.slot(image_id)?;
        lock(&slot).touch_label(&label);
        Ok(())
    }

    /// Labels used on an image, in first-seen order.
    pub fn labels(&self, image_id: &ImageId) -> Result<Vec<String>, AnnotationError> {
        let slot = self.slot(image_id)?;
        let labels = lock(&slot).labels.clone();
        Ok(labels)
    }

    /// Capture the image's current annotations as an immutable snapshot.
    pub fn snapshot(&self, image_id: &ImageId) -> Result<AnnotationSnapshot, AnnotationError> {
        let slot = self.slot(image_id)?;
        let annotations = lock(&slot);
        Ok(AnnotationSnapshot::new(
            image_id.clone(),
            annotations.revision,
            annotations.regions.clone(),
            annotations.boundary.clone(),
            annotations.scale.clone(),
            annotations.labels.clone(),
        ))
    }

    fn slot(&self, image_id: &ImageId) -> Result<Arc<Mutex<ImageAnnotations>>, AnnotationError> {
        self.images
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(image_id)
            .cloned()
            .ok_or_else(|| AnnotationError::UnknownImage(image_id.clone()))
    }

    fn image_of(&self, id: RegionId) -> Result<ImageId, AnnotationError> {
        self.region_index
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(&id)
            .cloned()
            .ok_or(AnnotationError::NotFound(id))
    }
}

fn lock(slot: &Mutex<ImageAnnotations>) -> MutexGuard<'_, ImageAnnotations> {
    slot.lock().unwrap_or_else(|err| err.into_inner())
}

fn normalize_label(label: &str) -> Result<String, AnnotationError> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return Err(AnnotationError::InvalidLabel);
    }
    Ok(trimmed.to_string())
}

pub(crate) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
