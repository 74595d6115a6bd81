use std::collections::BTreeMap;
use std::sync::Arc;

use super::geometry::Geometry;
use super::store::{Region, RegionId, ScaleInfo, now_ms};
use crate::image_source::ImageId;

/// Immutable point-in-time copy of one image's annotations.
///
/// `version` is the image's edit revision at capture time: two snapshots of
/// the same image with equal versions hold identical regions. Revisions come
/// from a store-wide counter and never repeat, even after an image is closed
/// and opened again.
#[derive(Debug, Clone)]
pub struct AnnotationSnapshot {
    image_id: ImageId,
    version: u64,
    regions: BTreeMap<RegionId, Arc<Region>>,
    boundary: Option<Geometry>,
    scale: Option<ScaleInfo>,
    labels: Vec<String>,
    taken_at_ms: i64,
}

impl AnnotationSnapshot {
    pub(super) fn new(
        image_id: ImageId,
        version: u64,
        regions: BTreeMap<RegionId, Arc<Region>>,
        boundary: Option<Geometry>,
        scale: Option<ScaleInfo>,
        labels: Vec<String>,
    ) -> Self {
        Self {
            image_id,
            version,
            regions,
            boundary,
            scale,
            labels,
            taken_at_ms: now_ms(),
        }
    }

    /// Build a detached snapshot from explicit regions, e.g. for replaying a record.
    pub fn from_regions(image_id: ImageId, version: u64, regions: Vec<Region>) -> Self {
        let mut labels: Vec<String> = Vec::new();
        let regions = regions
            .into_iter()
            .map(|region| {
                if !labels.contains(&region.label) {
                    labels.push(region.label.clone());
                }
                (region.id, Arc::new(region))
            })
            .collect();
        Self::new(image_id, version, regions, None, None, labels)
    }

    pub fn image_id(&self) -> &ImageId {
        &self.image_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn taken_at_ms(&self) -> i64 {
        self.taken_at_ms
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Regions in ascending id order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values().map(|region| region.as_ref())
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(&id).map(|region| region.as_ref())
    }

    pub fn boundary(&self) -> Option<&Geometry> {
        self.boundary.as_ref()
    }

    pub fn scale(&self) -> Option<&ScaleInfo> {
        self.scale.as_ref()
    }

    /// Labels known for the image, in first-seen order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}
