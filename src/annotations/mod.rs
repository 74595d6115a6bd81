//! Annotation store: user-authored regions per image, plus snapshots, file
//! import/export and area reporting built on top of them.

mod document;
mod geometry;
mod report;
mod snapshot;
mod store;

use std::path::PathBuf;

use thiserror::Error;

use crate::image_source::ImageId;

pub use document::{
    APP_VERSION, AnnotationDocument, DocumentBoundary, DocumentImage, DocumentRegion,
    DocumentScale, ImportSummary, label_color,
};
pub use geometry::{Extent, Geometry, Point, RasterMask};
pub use report::{AreaReport, LabelTotals, ReportError, area_report};
pub use snapshot::AnnotationSnapshot;
pub use store::{AnnotationStore, Region, RegionId, ScaleInfo};
pub(crate) use store::now_ms;

/// Errors raised by annotation edits and document I/O.
#[derive(Debug, Error)]
pub enum AnnotationError {
    /// The region id is stale or was never allocated.
    #[error("Region {0} not found")]
    NotFound(RegionId),
    #[error("Image {0} is not open")]
    UnknownImage(ImageId),
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("Labels must not be blank")]
    InvalidLabel,
    #[error("Annotation document {path}: {reason}")]
    Document { path: PathBuf, reason: String },
}
