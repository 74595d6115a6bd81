use std::path::{Path, PathBuf};

use image::{RgbImage, imageops};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::atomic_file::atomic_write;

use super::{
    BoundingBox, DecodedImage, ImageError, ImageId, ImageInfo, ImageSource, LevelInfo,
    PixelBuffer, check_bounds,
};

/// Manifest file that marks a directory as a tiled pyramid.
pub const PYRAMID_MANIFEST_FILE_NAME: &str = "pyramid.json";
const PYRAMID_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PyramidManifest {
    format_version: u32,
    width: u32,
    height: u32,
    tile_size: u32,
    levels: Vec<LevelInfo>,
    #[serde(default)]
    source_sha256: Option<String>,
}

/// Multi-resolution image stored as PNG tiles under `<level>/<col>_<row>.png`.
///
/// Only the tiles intersecting a request are decoded, so memory use is bounded
/// by the request size rather than the slide size.
pub struct TiledPyramid {
    root: PathBuf,
    info: ImageInfo,
}

impl TiledPyramid {
    pub fn open(root: &Path) -> Result<Self, ImageError> {
        let locator = root.display().to_string();
        let manifest_path = root.join(PYRAMID_MANIFEST_FILE_NAME);
        let bytes = std::fs::read(&manifest_path).map_err(|err| ImageError::UnreadableImage {
            locator: locator.clone(),
            reason: format!("read {}: {err}", manifest_path.display()),
        })?;
        let manifest: PyramidManifest =
            serde_json::from_slice(&bytes).map_err(|err| ImageError::UnreadableImage {
                locator: locator.clone(),
                reason: format!("invalid manifest: {err}"),
            })?;
        validate_manifest(&manifest).map_err(|reason| ImageError::UnreadableImage {
            locator: locator.clone(),
            reason,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            info: ImageInfo {
                id: ImageId::from_path(root),
                width: manifest.width,
                height: manifest.height,
                levels: manifest.levels,
                tile_size: manifest.tile_size,
                sha256: manifest.source_sha256,
            },
        })
    }

    fn tile_path(&self, level: usize, col: u32, row: u32) -> PathBuf {
        tile_path(&self.root, level, col, row)
    }

    fn read_tile(&self, level: usize, col: u32, row: u32) -> Result<RgbImage, ImageError> {
        let path = self.tile_path(level, col, row);
        let locator = path.display().to_string();
        let reader = image::ImageReader::open(&path).map_err(|source| ImageError::Io {
            path: locator.clone(),
            source,
        })?;
        let decoded = reader.decode().map_err(|err| ImageError::DecodeError {
            locator,
            reason: err.to_string(),
        })?;
        Ok(decoded.to_rgb8())
    }
}

impl ImageSource for TiledPyramid {
    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn read_region(&self, bbox: BoundingBox, level: usize) -> Result<PixelBuffer, ImageError> {
        check_bounds(&self.info, bbox, level)?;
        let tile = self.info.tile_size;
        let mut out = RgbImage::new(bbox.width, bbox.height);
        let first_col = bbox.x / tile;
        let first_row = bbox.y / tile;
        let last_col = ((bbox.right() - 1) / tile as u64) as u32;
        let last_row = ((bbox.bottom() - 1) / tile as u64) as u32;
        for row in first_row..=last_row {
            for col in first_col..=last_col {
                let tile_box = BoundingBox::new(col * tile, row * tile, tile, tile);
                let Some(overlap) = bbox.intersect(&tile_box) else {
                    continue;
                };
                let pixels = self.read_tile(level, col, row)?;
                let local_x = overlap.x - tile_box.x;
                let local_y = overlap.y - tile_box.y;
                if local_x as u64 + overlap.width as u64 > pixels.width() as u64
                    || local_y as u64 + overlap.height as u64 > pixels.height() as u64
                {
                    return Err(ImageError::DecodeError {
                        locator: self.tile_path(level, col, row).display().to_string(),
                        reason: format!(
                            "tile is {}x{}, too small for the manifest geometry",
                            pixels.width(),
                            pixels.height()
                        ),
                    });
                }
                let piece =
                    imageops::crop_imm(&pixels, local_x, local_y, overlap.width, overlap.height);
                imageops::replace(
                    &mut out,
                    &*piece,
                    (overlap.x - bbox.x) as i64,
                    (overlap.y - bbox.y) as i64,
                );
            }
        }
        Ok(PixelBuffer::from_rgb_image(out))
    }
}

/// Write every level of `image` as PNG tiles plus a manifest under `root`.
pub fn write_tiled_pyramid(image: &DecodedImage, root: &Path) -> Result<(), ImageError> {
    let info = image.info();
    let tile = info.tile_size;
    let io_err = |path: &Path, source: std::io::Error| ImageError::Io {
        path: path.display().to_string(),
        source,
    };
    for (level, level_info) in info.levels.iter().enumerate() {
        let level_dir = root.join(level.to_string());
        std::fs::create_dir_all(&level_dir).map_err(|source| io_err(&level_dir, source))?;
        let Some(pixels) = image.level_pixels(level) else {
            continue;
        };
        for row in 0..level_info.height.div_ceil(tile) {
            for col in 0..level_info.width.div_ceil(tile) {
                let x = col * tile;
                let y = row * tile;
                let w = tile.min(level_info.width - x);
                let h = tile.min(level_info.height - y);
                let piece = imageops::crop_imm(pixels, x, y, w, h).to_image();
                let path = tile_path(root, level, col, row);
                piece.save(&path).map_err(|err| ImageError::DecodeError {
                    locator: path.display().to_string(),
                    reason: format!("encode tile: {err}"),
                })?;
            }
        }
    }
    let manifest = PyramidManifest {
        format_version: PYRAMID_FORMAT_VERSION,
        width: info.width,
        height: info.height,
        tile_size: tile,
        levels: info.levels.clone(),
        source_sha256: info.sha256.clone(),
    };
    let manifest_path = root.join(PYRAMID_MANIFEST_FILE_NAME);
    let json = serde_json::to_vec_pretty(&manifest).map_err(|err| ImageError::Io {
        path: manifest_path.display().to_string(),
        source: std::io::Error::other(err),
    })?;
    atomic_write(&manifest_path, &json).map_err(|source| io_err(&manifest_path, source))?;
    info!(
        "Wrote tiled pyramid for {} to {} ({} levels)",
        info.id,
        root.display(),
        info.level_count()
    );
    Ok(())
}

fn tile_path(root: &Path, level: usize, col: u32, row: u32) -> PathBuf {
    root.join(level.to_string()).join(format!("{col}_{row}.png"))
}

fn validate_manifest(manifest: &PyramidManifest) -> Result<(), String> {
    if manifest.format_version != PYRAMID_FORMAT_VERSION {
        return Err(format!(
            "unsupported format_version {} (expected {PYRAMID_FORMAT_VERSION})",
            manifest.format_version
        ));
    }
    if manifest.tile_size == 0 {
        return Err("tile_size must be >= 1".to_string());
    }
    let Some(base) = manifest.levels.first() else {
        return Err("manifest lists no levels".to_string());
    };
    if base.width != manifest.width || base.height != manifest.height || base.downsample != 1 {
        return Err("level 0 must match the image size".to_string());
    }
    if manifest.levels.iter().any(|l| l.width == 0 || l.height == 0) {
        return Err("levels must have non-zero size".to_string());
    }
    Ok(())
}
