//! Unified annotation file (JSON) shared with the annotate and analysis views.

use std::path::Path;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};
use tracing::{info, warn};

use super::geometry::{Geometry, Point};
use super::store::{AnnotationStore, ScaleInfo};
use super::{AnnotationError, AnnotationSnapshot};
use crate::atomic_file::atomic_write;
use crate::image_source::{ImageId, ImageInfo};

/// Version string written into exported documents.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LABEL: &str = "object";
const BOUNDARY_LABEL: &str = "boundary";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentImage {
    #[serde(default)]
    pub path: String,
    /// `[width, height]` in level-0 pixels.
    #[serde(default)]
    pub size: [u32; 2],
    #[serde(default)]
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRegion {
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default)]
    pub color: Option<[f32; 4]>,
    #[serde(default, alias = "pts", alias = "xy")]
    pub points: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBoundary {
    #[serde(default = "boundary_label")]
    pub label: String,
    #[serde(default)]
    pub points: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentScale {
    pub p1: [f64; 2],
    pub p2: [f64; 2],
    pub value: f64,
    #[serde(default)]
    pub unit: String,
}

/// On-disk annotation document.
///
/// Older files store regions under `polygons`, or are a bare list of regions;
/// both load through [`AnnotationDocument::from_json_slice`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationDocument {
    #[serde(default = "unknown_version")]
    pub app_version: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub image: Option<DocumentImage>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, alias = "polygons")]
    pub regions: Vec<DocumentRegion>,
    #[serde(default)]
    pub boundary: Option<DocumentBoundary>,
    #[serde(default)]
    pub scale: Option<DocumentScale>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Unified(AnnotationDocument),
    RegionList(Vec<DocumentRegion>),
}

/// Outcome of importing a document into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub regions_added: usize,
    /// Regions dropped for having fewer than 3 points or invalid coordinates.
    pub regions_skipped: usize,
    pub boundary_set: bool,
    pub scale_set: bool,
}

impl AnnotationDocument {
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        match serde_json::from_slice::<RawDocument>(bytes)? {
            RawDocument::Unified(document) => Ok(document),
            RawDocument::RegionList(regions) => {
                let mut labels: Vec<String> = Vec::new();
                for region in &regions {
                    if !labels.contains(&region.label) {
                        labels.push(region.label.clone());
                    }
                }
                labels.sort();
                Ok(Self {
                    app_version: unknown_version(),
                    created_at: String::new(),
                    image: None,
                    labels,
                    regions,
                    boundary: None,
                    scale: None,
                })
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, AnnotationError> {
        let bytes = std::fs::read(path).map_err(|err| AnnotationError::Document {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Self::from_json_slice(&bytes).map_err(|err| AnnotationError::Document {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), AnnotationError> {
        let json = serde_json::to_vec_pretty(self).map_err(|err| AnnotationError::Document {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        atomic_write(path, &json).map_err(|err| AnnotationError::Document {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        info!("Saved {} regions to {}", self.regions.len(), path.display());
        Ok(())
    }

    /// Describe a snapshot as a document, tagging it with the image's identity.
    pub fn from_snapshot(snapshot: &AnnotationSnapshot, image: Option<&ImageInfo>) -> Self {
        let labels = snapshot.labels().to_vec();
        let regions = snapshot
            .regions()
            .map(|region| DocumentRegion {
                label: region.label.clone(),
                color: labels
                    .iter()
                    .position(|label| label == &region.label)
                    .map(label_color),
                points: geometry_points(&region.geometry),
            })
            .collect();
        Self {
            app_version: APP_VERSION.to_string(),
            created_at: format_created_at(OffsetDateTime::now_utc()),
            image: image.map(|info| DocumentImage {
                path: info.id.to_string(),
                size: [info.width, info.height],
                sha256: info.sha256.clone().unwrap_or_default(),
            }),
            labels,
            regions,
            boundary: snapshot.boundary().map(|geometry| DocumentBoundary {
                label: boundary_label(),
                points: geometry_points(geometry),
            }),
            scale: snapshot.scale().map(|scale| DocumentScale {
                p1: [scale.p1.x, scale.p1.y],
                p2: [scale.p2.x, scale.p2.y],
                value: scale.value,
                unit: scale.unit.clone(),
            }),
        }
    }
}

impl AnnotationStore {
    /// Add every usable region, the boundary and the scale of `document`.
    pub fn import_document(
        &self,
        image_id: &ImageId,
        document: &AnnotationDocument,
    ) -> Result<ImportSummary, AnnotationError> {
        let mut summary = ImportSummary::default();
        for label in &document.labels {
            if !label.trim().is_empty() {
                self.add_label(image_id, label)?;
            }
        }
        for region in &document.regions {
            let geometry = Geometry::polygon(region.points.iter().map(|[x, y]| (*x, *y)));
            if geometry.validate().is_err() {
                summary.regions_skipped += 1;
                continue;
            }
            let label = if region.label.trim().is_empty() {
                DEFAULT_LABEL
            } else {
                region.label.as_str()
            };
            self.add_region(image_id, geometry, label)?;
            summary.regions_added += 1;
        }
        if let Some(boundary) = &document.boundary {
            let geometry = Geometry::polygon(boundary.points.iter().map(|[x, y]| (*x, *y)));
            if geometry.validate().is_ok() {
                self.set_boundary(image_id, Some(geometry))?;
                summary.boundary_set = true;
            }
        }
        if let Some(scale) = &document.scale {
            let info = ScaleInfo {
                p1: Point::new(scale.p1[0], scale.p1[1]),
                p2: Point::new(scale.p2[0], scale.p2[1]),
                value: scale.value,
                unit: scale.unit.clone(),
            };
            if self.set_scale(image_id, Some(info)).is_ok() {
                summary.scale_set = true;
            }
        }
        if summary.regions_skipped > 0 {
            warn!(
                "Skipped {} unusable regions while importing into {}",
                summary.regions_skipped, image_id
            );
        }
        Ok(summary)
    }
}

/// Display color for the label at `index` in an image's label list.
pub fn label_color(index: usize) -> [f32; 4] {
    let hue = ((index + 1) as f32 * 0.17).fract();
    let [r, g, b] = hsv_to_rgb(hue, 0.8, 0.9);
    [r, g, b, 0.9]
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);
    match sector as i32 % 6 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

fn geometry_points(geometry: &Geometry) -> Vec<[f64; 2]> {
    match geometry {
        Geometry::Polygon { points } => points.iter().map(|p| [p.x, p.y]).collect(),
        Geometry::Mask { .. } => {
            let extent = geometry.extent();
            vec![
                [extent.min_x, extent.min_y],
                [extent.max_x, extent.min_y],
                [extent.max_x, extent.max_y],
                [extent.min_x, extent.max_y],
            ]
        }
    }
}

fn format_created_at(now: OffsetDateTime) -> String {
    const FORMAT: &[FormatItem<'_>] =
        format_description!("[year][month][day]_[hour][minute][second]");
    now.format(FORMAT).unwrap_or_default()
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

fn boundary_label() -> String {
    BOUNDARY_LABEL.to_string()
}

fn unknown_version() -> String {
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIFIED: &str = r#"{
        "app_version": "refactor",
        "created_at": "20240101_120000",
        "image": {"path": "slide.tif", "size": [100, 80], "sha256": "abc"},
        "labels": ["object", "tumor"],
        "regions": [
            {"label": "tumor", "color": [1, 0, 0, 0.9], "points": [[0, 0], [10, 0], [10, 10], [0, 10]]},
            {"label": "tumor", "points": [[0, 0], [5, 5]]}
        ],
        "boundary": {"label": "boundary", "points": [[0, 0], [50, 0], [50, 50], [0, 50]]},
        "scale": {"p1": [0, 0], "p2": [10, 0], "value": 5.0, "unit": "mm"},
        "measurements": []
    }"#;

    #[test]
    fn imports_unified_document() {
        let store = AnnotationStore::new();
        let image = ImageId::new("slide.tif");
        store.register_image(&image);
        let document = AnnotationDocument::from_json_slice(UNIFIED.as_bytes()).unwrap();
        let summary = store.import_document(&image, &document).unwrap();
        assert_eq!(summary.regions_added, 1);
        assert_eq!(summary.regions_skipped, 1);
        assert!(summary.boundary_set && summary.scale_set);

        let snapshot = store.snapshot(&image).unwrap();
        assert_eq!(snapshot.labels(), &["object".to_string(), "tumor".to_string()]);
        assert_eq!(snapshot.scale().unwrap().units_per_pixel(), Some(0.5));
        assert!(snapshot.boundary().is_some());
    }

    #[test]
    fn loads_legacy_shapes() {
        let polygons = r#"{"labels": ["a"], "polygons": [{"label": "a", "points": [[0,0],[1,0],[1,1]]}]}"#;
        let document = AnnotationDocument::from_json_slice(polygons.as_bytes()).unwrap();
        assert_eq!(document.regions.len(), 1);
        assert_eq!(document.app_version, "unknown");

        let list = r#"[{"label": "b", "pts": [[0,0],[1,0],[1,1]]}, {"points": [[0,0],[2,0],[2,2]]}]"#;
        let document = AnnotationDocument::from_json_slice(list.as_bytes()).unwrap();
        assert_eq!(document.labels, vec!["b".to_string(), "object".to_string()]);
        assert_eq!(document.regions[0].points.len(), 3);
    }

    #[test]
    fn export_then_import_preserves_regions() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnnotationStore::new();
        let image = ImageId::new("slide.png");
        store.register_image(&image);
        store
            .add_region(
                &image,
                Geometry::polygon([(1.0, 1.0), (9.0, 1.0), (5.0, 7.0)]),
                "gland",
            )
            .unwrap();
        let document = AnnotationDocument::from_snapshot(&store.snapshot(&image).unwrap(), None);
        assert_eq!(document.regions[0].color, Some(label_color(0)));
        let path = dir.path().join("slide.annotations.json");
        document.save(&path).unwrap();

        let other = AnnotationStore::new();
        other.register_image(&image);
        let loaded = AnnotationDocument::load(&path).unwrap();
        other.import_document(&image, &loaded).unwrap();
        let snapshot = other.snapshot(&image).unwrap();
        let region = snapshot.regions().next().unwrap();
        assert_eq!(region.label, "gland");
        assert_eq!(
            region.geometry,
            Geometry::polygon([(1.0, 1.0), (9.0, 1.0), (5.0, 7.0)])
        );
    }

    #[test]
    fn label_colors_are_stable_and_opaque() {
        assert_eq!(label_color(3), label_color(3));
        assert_ne!(label_color(0), label_color(1));
        assert_eq!(label_color(0)[3], 0.9);
    }
}
