use std::path::Path;
use std::sync::Arc;

use image::{Rgb, RgbImage};
use mregion::annotations::Geometry;
use mregion::image_source::{DecodedImage, ImageId, ImageSource};

pub const RED: [u8; 3] = [220, 40, 40];
pub const BLUE: [u8; 3] = [40, 40, 220];

/// Left half red, right half blue.
pub fn stripes(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, _| {
        if x < width / 2 { Rgb(RED) } else { Rgb(BLUE) }
    })
}

pub fn write_test_png(path: &Path, width: u32, height: u32) {
    stripes(width, height).save(path).unwrap();
}

pub fn in_memory_source(id: &str, width: u32, height: u32) -> Arc<dyn ImageSource> {
    Arc::new(DecodedImage::from_rgb(
        ImageId::new(id),
        stripes(width, height),
        64,
    ))
}

pub fn square(x: f64, y: f64, side: f64) -> Geometry {
    Geometry::polygon([(x, y), (x + side, y), (x + side, y + side), (x, y + side)])
}
