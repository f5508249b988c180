use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::fast::fast_corners;
use super::{
    Descriptor, ExtractionError, FeatureExtractor, GrayImage, ImageFeatures, Keypoint,
};

// Radius of the patch used for the intensity centroid.
const HALF_PATCH_SIZE: i32 = 15;
// Sampling pairs lie inside this radius so rotated pairs stay inside the patch.
const PATTERN_RADIUS: i32 = 13;
const PATTERN_SEED: u64 = 0x0b5e_55ed;
const EDGE_THRESHOLD: usize = (HALF_PATCH_SIZE + 1) as usize;

/// Options of the ORB extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionOptions {
    /// Maximum number of keypoints kept per image, strongest first.
    pub max_num_features: usize,
    /// FAST intensity threshold.
    pub fast_threshold: u8,
    /// FAST contiguous arc length.
    pub fast_arc_length: usize,
    /// Number of pyramid levels.
    pub num_levels: usize,
    /// Downscaling factor between consecutive pyramid levels.
    pub scale_factor: f64,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            max_num_features: 4096,
            fast_threshold: 20,
            fast_arc_length: 9,
            num_levels: 4,
            scale_factor: 1.3,
        }
    }
}

/// Oriented FAST and rotated BRIEF extractor.
///
/// The sampling pattern is generated from a fixed seed so that identical
/// pixels and options always yield identical features.
#[derive(Debug, Clone)]
pub struct OrbExtractor {
    options: ExtractionOptions,
    pattern: Vec<[i32; 4]>,
}

impl Default for OrbExtractor {
    fn default() -> Self {
        Self::new(ExtractionOptions::default())
    }
}

struct Candidate {
    level: usize,
    x: usize,
    y: usize,
    score: u32,
}

impl OrbExtractor {
    /// Create an extractor with the given options.
    pub fn new(options: ExtractionOptions) -> Self {
        Self {
            options,
            pattern: sampling_pattern(),
        }
    }

    /// Extractor options.
    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    fn build_pyramid(&self, image: &GrayImage) -> Vec<GrayImage> {
        let mut levels = vec![image.clone()];
        let min_size = 2 * EDGE_THRESHOLD + 1;
        for _ in 1..self.options.num_levels.max(1) {
            let Some(prev) = levels.last() else { break };
            let w = (prev.width() as f64 / self.options.scale_factor).round() as usize;
            let h = (prev.height() as f64 / self.options.scale_factor).round() as usize;
            if w < min_size || h < min_size {
                break;
            }
            let next = resize_bilinear(&gaussian_blur(prev), w, h);
            levels.push(next);
        }
        levels
    }

    fn describe(&self, smoothed: &GrayImage, x: usize, y: usize, angle: f32) -> Descriptor {
        let (sin_a, cos_a) = angle.sin_cos();
        let rotate = |px: i32, py: i32| -> (usize, usize) {
            let rx = (cos_a * px as f32 - sin_a * py as f32).round() as i32;
            let ry = (sin_a * px as f32 + cos_a * py as f32).round() as i32;
            ((x as i32 + rx) as usize, (y as i32 + ry) as usize)
        };

        let mut desc = [0u8; 32];
        for (byte_idx, byte) in desc.iter_mut().enumerate() {
            for bit in 0..8 {
                let [x0, y0, x1, y1] = self.pattern[byte_idx * 8 + bit];
                let (ax, ay) = rotate(x0, y0);
                let (bx, by) = rotate(x1, y1);
                if smoothed.get(ax, ay) < smoothed.get(bx, by) {
                    *byte |= 1 << bit;
                }
            }
        }
        desc
    }
}

impl FeatureExtractor for OrbExtractor {
    fn extract(
        &self,
        image: &GrayImage,
        mask: Option<&GrayImage>,
    ) -> Result<ImageFeatures, ExtractionError> {
        if let Some(mask) = mask {
            if mask.width() != image.width() || mask.height() != image.height() {
                return Err(ExtractionError::MaskSizeMismatch {
                    width: image.width(),
                    height: image.height(),
                    mask_width: mask.width(),
                    mask_height: mask.height(),
                });
            }
        }

        let levels = self.build_pyramid(image);
        let level_scale = |level: usize| -> (f64, f64) {
            (
                image.width() as f64 / levels[level].width() as f64,
                image.height() as f64 / levels[level].height() as f64,
            )
        };

        let mut candidates = Vec::new();
        for (level, img) in levels.iter().enumerate() {
            let (sx, sy) = level_scale(level);
            for c in fast_corners(
                img,
                self.options.fast_threshold,
                self.options.fast_arc_length,
                EDGE_THRESHOLD,
            ) {
                if let Some(mask) = mask {
                    let mx = ((c.x as f64 * sx).round() as usize).min(image.width() - 1);
                    let my = ((c.y as f64 * sy).round() as usize).min(image.height() - 1);
                    if mask.get(mx, my) == 0 {
                        continue;
                    }
                }
                candidates.push(Candidate {
                    level,
                    x: c.x,
                    y: c.y,
                    score: c.score,
                });
            }
        }

        if candidates.is_empty() {
            return Err(ExtractionError::NoKeypoints);
        }

        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.level.cmp(&b.level))
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });
        candidates.truncate(self.options.max_num_features);

        let smoothed = levels.iter().map(gaussian_blur).collect::<Vec<_>>();

        let mut features = ImageFeatures::default();
        for c in &candidates {
            let (sx, sy) = level_scale(c.level);
            let angle = intensity_centroid_angle(&levels[c.level], c.x, c.y);
            let descriptor = self.describe(&smoothed[c.level], c.x, c.y, angle);
            let x0 = c.x as f64 * sx;
            let y0 = c.y as f64 * sy;
            let intensity = image.get(
                (x0.round() as usize).min(image.width() - 1),
                (y0.round() as usize).min(image.height() - 1),
            );
            features.keypoints.push(Keypoint {
                x: x0 as f32,
                y: y0 as f32,
                scale: sx as f32,
                orientation: angle,
                response: c.score as f32,
                intensity,
            });
            features.descriptors.push(descriptor);
        }

        Ok(features)
    }
}

fn sampling_pattern() -> Vec<[i32; 4]> {
    let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
    let sample = |rng: &mut StdRng| loop {
        let x = rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
        let y = rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
        if x * x + y * y <= PATTERN_RADIUS * PATTERN_RADIUS {
            return (x, y);
        }
    };
    (0..256)
        .map(|_| {
            let (x0, y0) = sample(&mut rng);
            let (x1, y1) = sample(&mut rng);
            [x0, y0, x1, y1]
        })
        .collect()
}

fn intensity_centroid_angle(img: &GrayImage, x: usize, y: usize) -> f32 {
    let r2 = HALF_PATCH_SIZE * HALF_PATCH_SIZE;
    let (mut m01, mut m10) = (0f32, 0f32);
    for dy in -HALF_PATCH_SIZE..=HALF_PATCH_SIZE {
        for dx in -HALF_PATCH_SIZE..=HALF_PATCH_SIZE {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let v = img.get((x as i32 + dx) as usize, (y as i32 + dy) as usize) as f32;
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }
    m01.atan2(m10)
}

/// Separable 5-tap binomial blur with clamped borders.
pub(crate) fn gaussian_blur(src: &GrayImage) -> GrayImage {
    const K: [u32; 5] = [1, 4, 6, 4, 1];
    let (w, h) = (src.width(), src.height());
    let clamp = |v: i32, n: usize| v.clamp(0, n as i32 - 1) as usize;

    let mut tmp = vec![0u32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0;
            for (k, &wk) in K.iter().enumerate() {
                acc += wk * src.get(clamp(x as i32 + k as i32 - 2, w), y) as u32;
            }
            tmp[y * w + x] = acc;
        }
    }
    GrayImage::from_fn(w, h, |x, y| {
        let mut acc = 0;
        for (k, &wk) in K.iter().enumerate() {
            acc += wk * tmp[clamp(y as i32 + k as i32 - 2, h) * w + x];
        }
        ((acc + 128) / 256) as u8
    })
}

fn resize_bilinear(src: &GrayImage, width: usize, height: usize) -> GrayImage {
    let sx = src.width() as f64 / width as f64;
    let sy = src.height() as f64 / height as f64;
    let max_x = (src.width() - 1) as f64;
    let max_y = (src.height() - 1) as f64;
    GrayImage::from_fn(width, height, |x, y| {
        let fx = ((x as f64 + 0.5) * sx - 0.5).clamp(0.0, max_x);
        let fy = ((y as f64 + 0.5) * sy - 0.5).clamp(0.0, max_y);
        let (x0, y0) = (fx.floor() as usize, fy.floor() as usize);
        let x1 = (x0 + 1).min(src.width() - 1);
        let y1 = (y0 + 1).min(src.height() - 1);
        let (ax, ay) = (fx - x0 as f64, fy - y0 as f64);
        let top = src.get(x0, y0) as f64 * (1.0 - ax) + src.get(x1, y0) as f64 * ax;
        let bottom = src.get(x0, y1) as f64 * (1.0 - ax) + src.get(x1, y1) as f64 * ax;
        (top * (1.0 - ay) + bottom * ay).round() as u8
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Random rectangles on a textured background.
    fn synthetic_image(width: usize, height: usize, seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let rects = (0..40)
            .map(|_| {
                let x = rng.random_range(0..width);
                let y = rng.random_range(0..height);
                let w = rng.random_range(5..40);
                let h = rng.random_range(5..40);
                let v = rng.random_range(0..=255u8);
                (x, y, w, h, v)
            })
            .collect::<Vec<_>>();
        GrayImage::from_fn(width, height, |px, py| {
            let mut value = ((px * 7 + py * 3) % 64) as u8;
            for &(x, y, w, h, v) in &rects {
                if px >= x && px < x + w && py >= y && py < y + h {
                    value = v;
                }
            }
            value
        })
    }

    #[test]
    fn test_extraction_is_deterministic() -> Result<(), ExtractionError> {
        let img = synthetic_image(160, 120, 3);
        let orb = OrbExtractor::default();
        let a = orb.extract(&img, None)?;
        let b = orb.extract(&img, None)?;
        assert!(!a.is_empty());
        assert_eq!(a, b);
        assert_eq!(a.keypoints.len(), a.descriptors.len());
        Ok(())
    }

    #[test]
    fn test_max_num_features() -> Result<(), ExtractionError> {
        let img = synthetic_image(160, 120, 5);
        let orb = OrbExtractor::new(ExtractionOptions {
            max_num_features: 10,
            ..Default::default()
        });
        let f = orb.extract(&img, None)?;
        assert!(f.len() <= 10);
        let responses = f.keypoints.iter().map(|k| k.response).collect::<Vec<_>>();
        assert!(responses.windows(2).all(|w| w[0] >= w[1]));
        Ok(())
    }

    #[test]
    fn test_zero_mask_yields_no_keypoints() {
        let img = synthetic_image(120, 100, 7);
        let mask = GrayImage::from_fn(120, 100, |_, _| 0);
        let orb = OrbExtractor::default();
        assert!(matches!(
            orb.extract(&img, Some(&mask)),
            Err(ExtractionError::NoKeypoints)
        ));
    }

    #[test]
    fn test_mask_excludes_region() -> Result<(), ExtractionError> {
        let img = synthetic_image(160, 120, 11);
        let mask = GrayImage::from_fn(160, 120, |x, _| if x < 80 { 255 } else { 0 });
        let f = OrbExtractor::default().extract(&img, Some(&mask))?;
        assert!(f.keypoints.iter().all(|k| k.x < 81.0));
        Ok(())
    }

    #[test]
    fn test_mask_size_mismatch() {
        let img = synthetic_image(64, 64, 1);
        let mask = GrayImage::from_fn(32, 32, |_, _| 255);
        assert!(matches!(
            OrbExtractor::default().extract(&img, Some(&mask)),
            Err(ExtractionError::MaskSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_blank_image_fails() {
        let img = GrayImage::from_fn(64, 64, |_, _| 90);
        assert!(matches!(
            OrbExtractor::default().extract(&img, None),
            Err(ExtractionError::NoKeypoints)
        ));
    }
}
