use serde::{Deserialize, Serialize};

/// Point in level-0 image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned extent of a geometry, in continuous image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn center(&self) -> Point {
        Point::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Shape of a region: a closed polygon or a rectangular occupancy bitmap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Geometry {
    Polygon {
        points: Vec<Point>,
    },
    Mask {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        /// Row-major occupancy, `width * height` entries.
        bits: Vec<bool>,
    },
}

impl Geometry {
    pub fn polygon<P: Into<Point>>(points: impl IntoIterator<Item = P>) -> Self {
        Geometry::Polygon {
            points: points.into_iter().map(Into::into).collect(),
        }
    }

    /// Check structural validity; returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Geometry::Polygon { points } => {
                if points.len() < 3 {
                    return Err(format!(
                        "polygon needs at least 3 vertices, got {}",
                        points.len()
                    ));
                }
                if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
                    return Err("polygon has non-finite coordinates".to_string());
                }
                Ok(())
            }
            Geometry::Mask {
                x,
                y,
                width,
                height,
                bits,
            } => {
                if *width == 0 || *height == 0 {
                    return Err("mask must have non-zero size".to_string());
                }
                if x.checked_add(*width).is_none() || y.checked_add(*height).is_none() {
                    return Err(format!(
                        "mask {width}x{height} at ({x}, {y}) extends past the u32 pixel range"
                    ));
                }
                let expected = (*width as usize)
                    .checked_mul(*height as usize)
                    .ok_or_else(|| format!("mask {width}x{height} is too large"))?;
                if bits.len() != expected {
                    return Err(format!(
                        "mask bitmap has {} entries, expected {expected}",
                        bits.len()
                    ));
                }
                if !bits.iter().any(|bit| *bit) {
                    return Err("mask is empty".to_string());
                }
                Ok(())
            }
        }
    }

    pub fn extent(&self) -> Extent {
        match self {
            Geometry::Polygon { points } => {
                let mut extent = Extent {
                    min_x: f64::INFINITY,
                    min_y: f64::INFINITY,
                    max_x: f64::NEG_INFINITY,
                    max_y: f64::NEG_INFINITY,
                };
                for p in points {
                    extent.min_x = extent.min_x.min(p.x);
                    extent.min_y = extent.min_y.min(p.y);
                    extent.max_x = extent.max_x.max(p.x);
                    extent.max_y = extent.max_y.max(p.y);
                }
                extent
            }
            Geometry::Mask {
                x,
                y,
                width,
                height,
                ..
            } => Extent {
                min_x: *x as f64,
                min_y: *y as f64,
                max_x: *x as f64 + *width as f64,
                max_y: *y as f64 + *height as f64,
            },
        }
    }

    /// Nonzero-winding containment test for a point.
    pub fn contains(&self, px: f64, py: f64) -> bool {
        match self {
            Geometry::Polygon { points } => winding_number(points, px, py) != 0,
            Geometry::Mask {
                x,
                y,
                width,
                height,
                bits,
            } => {
                if px < *x as f64 || py < *y as f64 {
                    return false;
                }
                let col = (px - *x as f64).floor() as u64;
                let row = (py - *y as f64).floor() as u64;
                if col >= *width as u64 || row >= *height as u64 {
                    return false;
                }
                bits[(row * *width as u64 + col) as usize]
            }
        }
    }

    /// Rasterize onto a `width`x`height` pixel grid, sampling pixel centers.
    pub fn rasterize(&self, width: u32, height: u32) -> RasterMask {
        let mut mask = RasterMask::new(width, height);
        let extent = self.extent();
        let x0 = extent.min_x.floor().max(0.0) as u32;
        let y0 = extent.min_y.floor().max(0.0) as u32;
        let x1 = (extent.max_x.ceil().max(0.0) as u32).min(width);
        let y1 = (extent.max_y.ceil().max(0.0) as u32).min(height);
        for y in y0..y1 {
            for x in x0..x1 {
                if self.contains(x as f64 + 0.5, y as f64 + 0.5) {
                    mask.set(x, y);
                }
            }
        }
        mask
    }
}

/// Boolean pixel mask on a full image grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterMask {
    pub width: u32,
    pub height: u32,
    bits: Vec<bool>,
}

impl RasterMask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; width as usize * height as usize],
        }
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.bits[y as usize * self.width as usize + x as usize]
    }

    fn set(&mut self, x: u32, y: u32) {
        self.bits[y as usize * self.width as usize + x as usize] = true;
    }

    pub fn count(&self) -> u64 {
        self.bits.iter().filter(|bit| **bit).count() as u64
    }

    /// Number of pixels set in both masks. Masks must share dimensions.
    pub fn intersection_count(&self, other: &RasterMask) -> u64 {
        self.bits
            .iter()
            .zip(&other.bits)
            .filter(|(a, b)| **a && **b)
            .count() as u64
    }
}

fn winding_number(points: &[Point], px: f64, py: f64) -> i32 {
    let mut winding = 0;
    let n = points.len();
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        let cross = (b.x - a.x) * (py - a.y) - (px - a.x) * (b.y - a.y);
        if a.y <= py {
            if b.y > py && cross > 0.0 {
                winding += 1;
            }
        } else if b.y <= py && cross < 0.0 {
            winding -= 1;
        }
    }
    winding
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, size: f64) -> Geometry {
        Geometry::polygon([(x, y), (x + size, y), (x + size, y + size), (x, y + size)])
    }

    #[test]
    fn validate_rejects_degenerate_shapes() {
        assert!(Geometry::polygon([(0.0, 0.0), (1.0, 1.0)]).validate().is_err());
        assert!(
            Geometry::polygon([(0.0, 0.0), (f64::NAN, 1.0), (2.0, 0.0)])
                .validate()
                .is_err()
        );
        let bad_mask = Geometry::Mask {
            x: 0,
            y: 0,
            width: 2,
            height: 2,
            bits: vec![true; 3],
        };
        assert!(bad_mask.validate().is_err());
        assert!(square(0.0, 0.0, 4.0).validate().is_ok());
    }

    #[test]
    fn square_rasterizes_to_its_area() {
        let mask = square(2.0, 3.0, 4.0).rasterize(10, 10);
        assert_eq!(mask.count(), 16);
        assert!(mask.get(2, 3));
        assert!(!mask.get(6, 3));
    }

    #[test]
    fn rasterize_clips_to_grid() {
        let mask = square(-2.0, -2.0, 4.0).rasterize(10, 10);
        assert_eq!(mask.count(), 4);
    }

    #[test]
    fn winding_fill_counts_self_overlap_once() {
        // Polygon traced twice around the same square still covers it once.
        let twice = Geometry::polygon([
            (0.0, 0.0),
            (4.0, 0.0),
            (4.0, 4.0),
            (0.0, 4.0),
            (0.0, 0.0),
            (4.0, 0.0),
            (4.0, 4.0),
            (0.0, 4.0),
        ]);
        assert_eq!(twice.rasterize(8, 8).count(), 16);
    }

    #[test]
    fn mask_geometry_contains_set_bits() {
        let mask = Geometry::Mask {
            x: 5,
            y: 5,
            width: 2,
            height: 1,
            bits: vec![false, true],
        };
        assert!(!mask.contains(5.5, 5.5));
        assert!(mask.contains(6.5, 5.5));
        assert_eq!(mask.rasterize(10, 10).count(), 1);
        assert_eq!(mask.extent().center(), Point::new(6.0, 5.5));
    }

    #[test]
    fn mask_at_the_edge_of_the_pixel_range() {
        let edge = Geometry::Mask {
            x: u32::MAX - 1,
            y: 0,
            width: 1,
            height: 1,
            bits: vec![true],
        };
        assert!(edge.validate().is_ok());
        assert_eq!(edge.extent().max_x, u32::MAX as f64);
        let past = Geometry::Mask {
            x: u32::MAX - 1,
            y: 0,
            width: 4,
            height: 1,
            bits: vec![true; 4],
        };
        assert!(past.validate().is_err());
    }

    #[test]
    fn intersection_counts_overlap() {
        let a = square(0.0, 0.0, 4.0).rasterize(8, 8);
        let b = square(2.0, 2.0, 4.0).rasterize(8, 8);
        assert_eq!(a.intersection_count(&b), 4);
    }
}
