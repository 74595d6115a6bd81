use super::{ImageError, ImageSource, PixelBuffer};

/// Downscaled view of a whole image for display.
#[derive(Debug, Clone)]
pub struct Preview {
    pub pixels: PixelBuffer,
    pub level: usize,
    /// Level-0 width divided by preview width.
    pub scale: f64,
}

/// Read the highest-resolution level whose long side fits in `max_side`.
///
/// Falls back to the smallest level when none fits.
pub fn preview(source: &dyn ImageSource, max_side: u32) -> Result<Preview, ImageError> {
    let info = source.info();
    let level = info
        .levels
        .iter()
        .position(|level| level.width.max(level.height) <= max_side)
        .unwrap_or(info.level_count().saturating_sub(1));
    let bounds = info.level_bounds(level).ok_or(ImageError::InvalidLevel {
        level,
        levels: info.level_count(),
    })?;
    let pixels = source.read_region(bounds, level)?;
    let scale = if pixels.width() == 0 {
        1.0
    } else {
        info.width as f64 / pixels.width() as f64
    };
    Ok(Preview {
        pixels,
        level,
        scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_source::{DecodedImage, ImageId};
    use image::RgbImage;

    #[test]
    fn picks_first_level_that_fits() {
        let image = DecodedImage::from_rgb(ImageId::new("p"), RgbImage::new(400, 200), 64);
        let view = preview(&image, 120).unwrap();
        assert_eq!(view.level, 2);
        assert_eq!((view.pixels.width(), view.pixels.height()), (100, 50));
        assert!((view.scale - 4.0).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_smallest_level() {
        let image = DecodedImage::from_rgb(ImageId::new("p"), RgbImage::new(400, 200), 256);
        let view = preview(&image, 10).unwrap();
        assert_eq!(view.level, image.info().level_count() - 1);
    }
}
