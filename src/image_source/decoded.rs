use std::path::Path;

use image::{ImageReader, RgbImage, imageops::FilterType};
use tracing::debug;

use super::{
    BoundingBox, ImageError, ImageId, ImageInfo, ImageSource, PixelBuffer, check_bounds,
    pyramid_levels, sha256_file,
};

/// Flat image file decoded once into an in-memory, read-only pyramid.
///
/// Formats without random access (PNG, JPEG, plain TIFF) have to be decoded
/// whole; large slides should be converted with
/// [`write_tiled_pyramid`](super::write_tiled_pyramid) instead.
pub struct DecodedImage {
    info: ImageInfo,
    levels: Vec<RgbImage>,
}

impl DecodedImage {
    pub fn open(path: &Path, tile_size: u32) -> Result<Self, ImageError> {
        let locator = path.display().to_string();
        let reader = ImageReader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|err| ImageError::UnreadableImage {
                locator: locator.clone(),
                reason: err.to_string(),
            })?;
        let decoded = reader.decode().map_err(|err| ImageError::DecodeError {
            locator: locator.clone(),
            reason: err.to_string(),
        })?;
        let sha256 = sha256_file(path).map_err(|source| ImageError::Io {
            path: locator.clone(),
            source,
        })?;
        let mut image = Self::from_rgb(ImageId::from_path(path), decoded.to_rgb8(), tile_size);
        image.info.sha256 = Some(sha256);
        debug!(
            "Decoded {} ({}x{}, {} levels)",
            locator,
            image.info.width,
            image.info.height,
            image.info.level_count()
        );
        Ok(image)
    }

    /// Wrap already-decoded pixels, generating the lower pyramid levels.
    pub fn from_rgb(id: ImageId, base: RgbImage, tile_size: u32) -> Self {
        let (width, height) = base.dimensions();
        let level_infos = pyramid_levels(width, height, tile_size);
        let mut levels = Vec::with_capacity(level_infos.len());
        levels.push(base);
        for info in level_infos.iter().skip(1) {
            let Some(previous) = levels.last() else {
                break;
            };
            let next = image::imageops::resize(previous, info.width, info.height, FilterType::Triangle);
            levels.push(next);
        }
        Self {
            info: ImageInfo {
                id,
                width,
                height,
                levels: level_infos,
                tile_size: tile_size.max(1),
                sha256: None,
            },
            levels,
        }
    }

    pub(crate) fn level_pixels(&self, level: usize) -> Option<&RgbImage> {
        self.levels.get(level)
    }
}

impl ImageSource for DecodedImage {
    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn read_region(&self, bbox: BoundingBox, level: usize) -> Result<PixelBuffer, ImageError> {
        check_bounds(&self.info, bbox, level)?;
        let pixels = self.levels.get(level).ok_or(ImageError::InvalidLevel {
            level,
            levels: self.levels.len(),
        })?;
        let crop = image::imageops::crop_imm(pixels, bbox.x, bbox.y, bbox.width, bbox.height);
        Ok(PixelBuffer::from_rgb_image(crop.to_image()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 7]))
    }

    #[test]
    fn reads_sub_region_at_level_zero() {
        let image = DecodedImage::from_rgb(ImageId::new("grad"), gradient(64, 32), 16);
        let buf = image.read_region(BoundingBox::new(10, 5, 4, 3), 0).unwrap();
        assert_eq!((buf.width(), buf.height()), (4, 3));
        assert_eq!(buf.pixel(0, 0), [10, 5, 7]);
        assert_eq!(buf.pixel(3, 2), [13, 7, 7]);
    }

    #[test]
    fn lower_levels_are_downsampled() {
        let image = DecodedImage::from_rgb(ImageId::new("grad"), gradient(64, 32), 16);
        assert_eq!(image.info().level_count(), 3);
        let level = image.info().level(2).unwrap();
        assert_eq!((level.width, level.height, level.downsample), (16, 8, 4));
        let buf = image
            .read_region(BoundingBox::new(0, 0, 16, 8), 2)
            .unwrap();
        assert_eq!(buf.as_raw().len(), 16 * 8 * 3);
    }

    #[test]
    fn out_of_bounds_and_bad_level_are_rejected() {
        let image = DecodedImage::from_rgb(ImageId::new("grad"), gradient(20, 20), 64);
        assert!(matches!(
            image.read_region(BoundingBox::new(15, 15, 10, 10), 0),
            Err(ImageError::OutOfBounds { .. })
        ));
        assert!(matches!(
            image.read_region(BoundingBox::new(0, 0, 1, 1), 3),
            Err(ImageError::InvalidLevel { .. })
        ));
    }

    #[test]
    fn open_reports_unreadable_and_decode_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = DecodedImage::open(&dir.path().join("missing.png"), 64);
        assert!(matches!(missing, Err(ImageError::UnreadableImage { .. })));

        let garbage = dir.path().join("garbage.png");
        std::fs::write(&garbage, b"definitely not a png").unwrap();
        let err = DecodedImage::open(&garbage, 64).err().unwrap();
        assert!(matches!(err, ImageError::DecodeError { .. }));
    }

    #[test]
    fn open_hashes_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grad.png");
        gradient(8, 8).save(&path).unwrap();
        let image = DecodedImage::open(&path, 64).unwrap();
        let sha = image.info().sha256.clone().unwrap();
        assert_eq!(sha.len(), 64);
        assert_eq!(sha, sha256_file(&path).unwrap());
    }
}
