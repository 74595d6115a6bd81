//! Read-only access to large, possibly multi-resolution images.
//!
//! Every source exposes the same level/tile geometry through [`ImageInfo`] and
//! serves arbitrary sub-regions through [`ImageSource::read_region`]. Sources
//! hold no interior mutability, so one `Arc<dyn ImageSource>` can be shared by
//! the interactive thread and any number of training workers.

mod decoded;
mod preview;
mod tiled;

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use image::{Rgb, RgbImage, imageops};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use decoded::DecodedImage;
pub use preview::{Preview, preview};
pub use tiled::{PYRAMID_MANIFEST_FILE_NAME, TiledPyramid, write_tiled_pyramid};

/// Default tile edge used when a flat image is split into pyramid levels.
pub const DEFAULT_TILE_SIZE: u32 = 512;
/// Upper bound on generated pyramid levels.
const MAX_PYRAMID_LEVELS: usize = 16;

/// Stable identity of an opened image (its locator as given by the caller).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_path(path: &Path) -> Self {
        Self(path.display().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Dimensions of one pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelInfo {
    pub width: u32,
    pub height: u32,
    /// Level-0 pixels per level pixel along each axis.
    pub downsample: u32,
}

/// Immutable description of an opened image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: ImageId,
    pub width: u32,
    pub height: u32,
    /// Level 0 is full resolution; each following level halves both sides.
    pub levels: Vec<LevelInfo>,
    pub tile_size: u32,
    /// Hex SHA-256 of the source file when known.
    pub sha256: Option<String>,
}

impl ImageInfo {
    pub fn level(&self, level: usize) -> Option<&LevelInfo> {
        self.levels.get(level)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Box covering a whole level.
    pub fn level_bounds(&self, level: usize) -> Option<BoundingBox> {
        self.level(level)
            .map(|info| BoundingBox::new(0, 0, info.width, info.height))
    }
}

/// Pixel rectangle in the coordinate space of one pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        !self.is_empty() && self.right() <= width as u64 && self.bottom() <= height as u64
    }

    pub fn intersect(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 as u64 || y1 <= y0 as u64 {
            return None;
        }
        Some(BoundingBox::new(
            x0,
            y0,
            (x1 - x0 as u64) as u32,
            (y1 - y0 as u64) as u32,
        ))
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Owned 8-bit RGB pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer(RgbImage);

impl PixelBuffer {
    pub const CHANNELS: usize = 3;

    /// Black buffer of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self(RgbImage::new(width, height))
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        Self(image)
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.0.get_pixel(x, y).0
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        self.0.put_pixel(x, y, Rgb(rgb));
    }

    /// Interleaved RGB bytes, row-major.
    pub fn as_raw(&self) -> &[u8] {
        self.0.as_raw()
    }

    pub fn as_image(&self) -> &RgbImage {
        &self.0
    }

    pub fn into_image(self) -> RgbImage {
        self.0
    }

    pub fn flip_horizontal(&mut self) {
        imageops::flip_horizontal_in_place(&mut self.0);
    }

    pub fn flip_vertical(&mut self) {
        imageops::flip_vertical_in_place(&mut self.0);
    }
}

impl From<RgbImage> for PixelBuffer {
    fn from(image: RgbImage) -> Self {
        Self(image)
    }
}

/// Uniform, read-only access to one image by level and region.
pub trait ImageSource: Send + Sync {
    fn info(&self) -> &ImageInfo;

    /// Read the pixels inside `bbox`, expressed in `level` coordinates.
    fn read_region(&self, bbox: BoundingBox, level: usize) -> Result<PixelBuffer, ImageError>;
}

/// Errors raised while opening or reading an image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Unreadable image {locator}: {reason}")]
    UnreadableImage { locator: String, reason: String },
    #[error("Failed to decode {locator}: {reason}")]
    DecodeError { locator: String, reason: String },
    #[error("Region {bbox} is outside level {level} ({level_width}x{level_height})")]
    OutOfBounds {
        bbox: BoundingBox,
        level: usize,
        level_width: u32,
        level_height: u32,
    },
    #[error("Level {level} does not exist (image has {levels} levels)")]
    InvalidLevel { level: usize, levels: usize },
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl ImageError {
    /// Whether retrying the same read may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ImageError::Io { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

/// Open an image by locator.
///
/// Directories holding a `pyramid.json` manifest open as tiled pyramids; any
/// other path is decoded as a flat image file.
pub fn open_image(locator: impl AsRef<Path>) -> Result<Arc<dyn ImageSource>, ImageError> {
    let path = locator.as_ref();
    if path.is_dir() {
        if path.join(PYRAMID_MANIFEST_FILE_NAME).is_file() {
            return Ok(Arc::new(TiledPyramid::open(path)?));
        }
        return Err(ImageError::UnreadableImage {
            locator: path.display().to_string(),
            reason: format!("directory has no {PYRAMID_MANIFEST_FILE_NAME}"),
        });
    }
    Ok(Arc::new(DecodedImage::open(path, DEFAULT_TILE_SIZE)?))
}

/// Hex SHA-256 of a file, streamed in 1 MiB chunks.
pub fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

/// Level geometry for a `width`x`height` image halved until one tile covers it.
pub(crate) fn pyramid_levels(width: u32, height: u32, tile_size: u32) -> Vec<LevelInfo> {
    let tile_size = tile_size.max(1);
    let mut levels = vec![LevelInfo {
        width,
        height,
        downsample: 1,
    }];
    while levels.len() < MAX_PYRAMID_LEVELS {
        let Some(last) = levels.last().copied() else {
            break;
        };
        if last.width.max(last.height) <= tile_size || last.width.min(last.height) <= 1 {
            break;
        }
        levels.push(LevelInfo {
            width: last.width.div_ceil(2),
            height: last.height.div_ceil(2),
            downsample: last.downsample * 2,
        });
    }
    levels
}

pub(crate) fn check_bounds(
    info: &ImageInfo,
    bbox: BoundingBox,
    level: usize,
) -> Result<LevelInfo, ImageError> {
    let level_info = *info.level(level).ok_or(ImageError::InvalidLevel {
        level,
        levels: info.level_count(),
    })?;
    if !bbox.fits_within(level_info.width, level_info.height) {
        return Err(ImageError::OutOfBounds {
            bbox,
            level,
            level_width: level_info.width,
            level_height: level_info.height,
        });
    }
    Ok(level_info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pyramid_halves_until_single_tile() {
        let levels = pyramid_levels(2000, 1000, 512);
        let dims: Vec<(u32, u32, u32)> = levels
            .iter()
            .map(|l| (l.width, l.height, l.downsample))
            .collect();
        assert_eq!(
            dims,
            vec![(2000, 1000, 1), (1000, 500, 2), (500, 250, 4)]
        );
        assert_eq!(pyramid_levels(100, 80, 512).len(), 1);
    }

    #[test]
    fn bounding_box_intersection() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 8, 10, 10);
        assert_eq!(a.intersect(&b), Some(BoundingBox::new(5, 8, 5, 2)));
        assert_eq!(a.intersect(&BoundingBox::new(10, 0, 3, 3)), None);
        assert!(a.fits_within(10, 10));
        assert!(!b.fits_within(10, 10));
        assert!(!BoundingBox::new(0, 0, 0, 4).fits_within(10, 10));
    }

    #[test]
    fn flips_mirror_pixels() {
        let mut buf = PixelBuffer::new(3, 2);
        buf.set_pixel(0, 0, [1, 2, 3]);
        buf.flip_horizontal();
        assert_eq!(buf.pixel(2, 0), [1, 2, 3]);
        assert_eq!(buf.pixel(0, 0), [0, 0, 0]);
        buf.flip_vertical();
        assert_eq!(buf.pixel(2, 1), [1, 2, 3]);
    }

    #[test]
    fn io_errors_are_transient_unless_missing() {
        let transient = ImageError::Io {
            path: "tile".into(),
            source: std::io::Error::new(std::io::ErrorKind::Interrupted, "again"),
        };
        let missing = ImageError::Io {
            path: "tile".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(transient.is_transient());
        assert!(!missing.is_transient());
        assert!(
            !ImageError::DecodeError {
                locator: "x".into(),
                reason: "bad".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn open_image_rejects_plain_directories() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_image(dir.path()).err().unwrap();
        assert!(matches!(err, ImageError::UnreadableImage { .. }));
    }
}
