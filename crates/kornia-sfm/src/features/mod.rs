//! Feature extraction, descriptor matching and per-image feature storage.

/// FAST corner detection.
pub mod fast;

/// Brute-force binary descriptor matching.
pub mod matcher;

/// Oriented FAST keypoints with rotated BRIEF descriptors.
pub mod orb;

/// In-memory store of extracted features keyed by image id.
pub mod store;

use std::path::Path;

use glam::DVec2;

pub use matcher::{match_descriptors, FeatureMatch, MatchingOptions};
pub use orb::{ExtractionOptions, OrbExtractor};
pub use store::FeatureStore;

/// A 256-bit binary descriptor.
pub type Descriptor = [u8; 32];

/// Error types for feature extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// The image could not be decoded.
    #[error("extraction failed for {path}: {reason}")]
    ExtractionFailed {
        /// Path of the image.
        path: String,
        /// Reason reported by the decoder.
        reason: String,
    },

    /// No usable keypoint was found in the image.
    #[error("no usable keypoints detected")]
    NoKeypoints,

    /// The pixel buffer does not match the declared size.
    #[error("invalid image buffer: {width}x{height} with {len} bytes")]
    InvalidImage {
        /// Declared width.
        width: usize,
        /// Declared height.
        height: usize,
        /// Buffer length.
        len: usize,
    },

    /// The mask does not have the size of the image.
    #[error("mask size {mask_width}x{mask_height} does not match image size {width}x{height}")]
    MaskSizeMismatch {
        /// Image width.
        width: usize,
        /// Image height.
        height: usize,
        /// Mask width.
        mask_width: usize,
        /// Mask height.
        mask_height: usize,
    },

    /// Failed to read the image or mask file.
    #[error("failed to read image")]
    Io(#[from] std::io::Error),
}

/// An 8-bit single channel image in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayImage {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl GrayImage {
    /// Wrap a pixel buffer of `width * height` bytes.
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self, ExtractionError> {
        if width == 0 || height == 0 || data.len() != width * height {
            return Err(ExtractionError::InvalidImage {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> u8) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Image width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Image height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Raw pixel buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Pixel value at column `x` and row `y`.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }
}

/// A detected keypoint in level-0 pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, bincode::Encode, bincode::Decode)]
pub struct Keypoint {
    /// Column coordinate.
    pub x: f32,
    /// Row coordinate.
    pub y: f32,
    /// Pyramid scale the keypoint was detected at.
    pub scale: f32,
    /// Orientation in radians.
    pub orientation: f32,
    /// Detector response.
    pub response: f32,
    /// Gray value at the keypoint, used to color triangulated points.
    pub intensity: u8,
}

impl Keypoint {
    /// Pixel position as a double precision vector.
    pub fn position(&self) -> DVec2 {
        DVec2::new(self.x as f64, self.y as f64)
    }
}

/// Keypoints and descriptors of one image, index aligned.
#[derive(Debug, Clone, Default, PartialEq, bincode::Encode, bincode::Decode)]
pub struct ImageFeatures {
    /// Detected keypoints.
    pub keypoints: Vec<Keypoint>,
    /// One descriptor per keypoint.
    pub descriptors: Vec<Descriptor>,
}

impl ImageFeatures {
    /// Number of keypoints.
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    /// Whether the image has no keypoints.
    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Keypoint positions in pixels.
    pub fn positions(&self) -> Vec<DVec2> {
        self.keypoints.iter().map(Keypoint::position).collect()
    }
}

/// Decodes an image file into a gray image.
///
/// Image formats are handled outside of this crate; implementations typically
/// wrap an image codec library.
pub trait ImageDecoder: Send + Sync {
    /// Decode the image at `path`.
    fn decode(&self, path: &Path) -> Result<GrayImage, ExtractionError>;
}

/// Produces keypoints and descriptors for an image.
pub trait FeatureExtractor: Send + Sync {
    /// Extract features, ignoring pixels where `mask` is zero.
    fn extract(
        &self,
        image: &GrayImage,
        mask: Option<&GrayImage>,
    ) -> Result<ImageFeatures, ExtractionError>;
}
