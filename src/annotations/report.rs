//! Per-label area totals clipped to the boundary polygon.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use super::AnnotationSnapshot;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("Report requires a boundary polygon")]
    NoBoundary,
    #[error("There are no regions to report on")]
    NoRegions,
    #[error("Boundary area is zero after rasterization")]
    EmptyBoundary,
    #[error("Image size {width}x{height} is not usable for rasterization")]
    InvalidImageSize { width: u32, height: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelTotals {
    /// Regions contributing a non-zero clipped area.
    pub count: u32,
    pub area_px: u64,
    /// Share of the boundary area, in percent.
    pub percent_of_boundary: f64,
    /// `unit^2`, when the image has a scale.
    pub physical_area: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AreaReport {
    pub boundary_area_px: u64,
    pub boundary_physical_area: Option<f64>,
    pub unit: Option<String>,
    pub totals: BTreeMap<String, LabelTotals>,
}

/// Rasterize on the full-resolution `width`x`height` grid and aggregate by label.
pub fn area_report(
    snapshot: &AnnotationSnapshot,
    width: u32,
    height: u32,
) -> Result<AreaReport, ReportError> {
    let boundary = snapshot.boundary().ok_or(ReportError::NoBoundary)?;
    if snapshot.is_empty() {
        return Err(ReportError::NoRegions);
    }
    if width == 0 || height == 0 {
        return Err(ReportError::InvalidImageSize { width, height });
    }
    let boundary_mask = boundary.rasterize(width, height);
    let boundary_area_px = boundary_mask.count();
    if boundary_area_px == 0 {
        return Err(ReportError::EmptyBoundary);
    }

    let scale = snapshot
        .scale()
        .and_then(|scale| scale.units_per_pixel().map(|upp| (upp, scale.unit.clone())));
    let physical = |px: u64| scale.as_ref().map(|(upp, _)| upp * upp * px as f64);

    let mut totals: BTreeMap<String, LabelTotals> = BTreeMap::new();
    for region in snapshot.regions() {
        let area_px = region
            .geometry
            .rasterize(width, height)
            .intersection_count(&boundary_mask);
        if area_px == 0 {
            continue;
        }
        let entry = totals
            .entry(region.label.clone())
            .or_insert_with(|| LabelTotals {
                count: 0,
                area_px: 0,
                percent_of_boundary: 0.0,
                physical_area: None,
            });
        entry.count += 1;
        entry.area_px += area_px;
    }
    for entry in totals.values_mut() {
        entry.percent_of_boundary = 100.0 * entry.area_px as f64 / boundary_area_px as f64;
        entry.physical_area = physical(entry.area_px);
    }

    Ok(AreaReport {
        boundary_area_px,
        boundary_physical_area: physical(boundary_area_px),
        unit: scale.map(|(_, unit)| unit),
        totals,
    })
}

impl fmt::Display for AreaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Boundary area (px): {}", self.boundary_area_px)?;
        let unit = self.unit.as_deref().unwrap_or("");
        if let Some(area) = self.boundary_physical_area {
            writeln!(f, "Boundary area ({unit}^2): {area}")?;
        }
        writeln!(f)?;
        writeln!(f, "Totals by region label (clipped to boundary):")?;
        if self.totals.is_empty() {
            return writeln!(f, "  (No region area fell within the boundary.)");
        }
        for (label, totals) in &self.totals {
            write!(
                f,
                "  {label:15}  count={:3}  total_px={:8}  %boundary={:6.2}%",
                totals.count, totals.area_px, totals.percent_of_boundary
            )?;
            if let Some(area) = totals.physical_area {
                write!(f, "  area={area} {unit}^2")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{AnnotationStore, Geometry, Point, ScaleInfo};
    use crate::image_source::ImageId;

    fn rect(x: f64, y: f64, w: f64, h: f64) -> Geometry {
        Geometry::polygon([(x, y), (x + w, y), (x + w, y + h), (x, y + h)])
    }

    fn store() -> (AnnotationStore, ImageId) {
        let store = AnnotationStore::new();
        let image = ImageId::new("report");
        store.register_image(&image);
        (store, image)
    }

    #[test]
    fn clips_regions_to_boundary_and_aggregates_by_label() {
        let (store, image) = store();
        store
            .set_boundary(&image, Some(rect(0.0, 0.0, 10.0, 10.0)))
            .unwrap();
        store.add_region(&image, rect(0.0, 0.0, 5.0, 5.0), "a").unwrap();
        store.add_region(&image, rect(8.0, 8.0, 4.0, 4.0), "a").unwrap();
        store.add_region(&image, rect(20.0, 20.0, 2.0, 2.0), "b").unwrap();

        let report = area_report(&store.snapshot(&image).unwrap(), 32, 32).unwrap();
        assert_eq!(report.boundary_area_px, 100);
        assert_eq!(report.totals.len(), 1);
        let a = &report.totals["a"];
        assert_eq!((a.count, a.area_px), (2, 29));
        assert!((a.percent_of_boundary - 29.0).abs() < 1e-9);
        assert!(a.physical_area.is_none());
    }

    #[test]
    fn physical_units_follow_scale() {
        let (store, image) = store();
        store
            .set_boundary(&image, Some(rect(0.0, 0.0, 10.0, 10.0)))
            .unwrap();
        store
            .set_scale(
                &image,
                Some(ScaleInfo {
                    p1: Point::new(0.0, 0.0),
                    p2: Point::new(4.0, 0.0),
                    value: 2.0,
                    unit: "um".into(),
                }),
            )
            .unwrap();
        store.add_region(&image, rect(0.0, 0.0, 2.0, 2.0), "cell").unwrap();
        let report = area_report(&store.snapshot(&image).unwrap(), 16, 16).unwrap();
        assert_eq!(report.boundary_physical_area, Some(25.0));
        assert_eq!(report.totals["cell"].physical_area, Some(1.0));
        let text = report.to_string();
        assert!(text.contains("Boundary area (um^2): 25"));
        assert!(text.contains("cell"));
    }

    #[test]
    fn missing_inputs_are_reported() {
        let (store, image) = store();
        store.add_region(&image, rect(0.0, 0.0, 2.0, 2.0), "a").unwrap();
        assert_eq!(
            area_report(&store.snapshot(&image).unwrap(), 8, 8),
            Err(ReportError::NoBoundary)
        );
        store
            .set_boundary(&image, Some(rect(50.0, 50.0, 5.0, 5.0)))
            .unwrap();
        assert_eq!(
            area_report(&store.snapshot(&image).unwrap(), 8, 8),
            Err(ReportError::EmptyBoundary)
        );
    }
}
