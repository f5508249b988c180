use rayon::prelude::*;

use super::GrayImage;

// Bresenham circle of radius 3, clockwise from the top.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// A FAST corner after non-maximum suppression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FastCorner {
    /// Column.
    pub x: usize,
    /// Row.
    pub y: usize,
    /// Sum of absolute differences over the contiguous arc.
    pub score: u32,
}

/// Detect FAST corners with 3x3 non-maximum suppression.
///
/// # Arguments
///
/// * `src` - The source gray image.
/// * `threshold` - Intensity difference for a circle pixel to count as brighter or darker.
/// * `arc_length` - Number of contiguous circle pixels required, 9 for FAST-9.
/// * `border` - Pixels closer than this to the image border are ignored (at least 3).
///
/// # Returns
///
/// Corners sorted in row-major order.
pub fn fast_corners(
    src: &GrayImage,
    threshold: u8,
    arc_length: usize,
    border: usize,
) -> Vec<FastCorner> {
    let (width, height) = (src.width(), src.height());
    let border = border.max(3);
    if width <= 2 * border || height <= 2 * border {
        return Vec::new();
    }

    let scores = (0..height)
        .into_par_iter()
        .map(|y| {
            let mut row = vec![0u32; width];
            if y < border || y >= height - border {
                return row;
            }
            for (x, s) in row.iter_mut().enumerate().take(width - border).skip(border) {
                *s = corner_score(src, x, y, threshold, arc_length).unwrap_or(0);
            }
            row
        })
        .collect::<Vec<_>>();

    (border..height - border)
        .into_par_iter()
        .flat_map_iter(|y| {
            let scores = &scores;
            (border..width - border).filter_map(move |x| {
                let s = scores[y][x];
                if s == 0 || !is_local_maximum(scores, x, y, s) {
                    return None;
                }
                Some(FastCorner { x, y, score: s })
            })
        })
        .collect()
}

// Ties are broken towards the first pixel in row-major order.
fn is_local_maximum(scores: &[Vec<u32>], x: usize, y: usize, s: u32) -> bool {
    for dy in -1i32..=1 {
        for dx in -1i32..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let n = scores[(y as i32 + dy) as usize][(x as i32 + dx) as usize];
            let before = dy < 0 || (dy == 0 && dx < 0);
            if n > s || (before && n == s) {
                return false;
            }
        }
    }
    true
}

/// FAST score of a pixel, `None` when it is not a corner.
pub fn corner_score(
    src: &GrayImage,
    x: usize,
    y: usize,
    threshold: u8,
    arc_length: usize,
) -> Option<u32> {
    let center = src.get(x, y) as i32;
    let t = threshold as i32;

    let mut classes = [0i8; 16];
    let mut diffs = [0i32; 16];
    for (k, &(dx, dy)) in CIRCLE.iter().enumerate() {
        let p = src.get((x as i32 + dx) as usize, (y as i32 + dy) as usize) as i32;
        diffs[k] = p - center;
        classes[k] = if p > center + t {
            1
        } else if p < center - t {
            -1
        } else {
            0
        };
    }

    // quick rejection on the four compass pixels
    if arc_length >= 12 {
        let compass = [classes[0], classes[4], classes[8], classes[12]];
        let bright = compass.iter().filter(|&&c| c == 1).count();
        let dark = compass.iter().filter(|&&c| c == -1).count();
        if bright < 3 && dark < 3 {
            return None;
        }
    }

    let mut best: Option<i8> = None;
    'outer: for class in [1i8, -1] {
        let mut run = 0usize;
        for k in 0..16 + arc_length {
            if classes[k % 16] == class {
                run += 1;
                if run >= arc_length {
                    best = Some(class);
                    break 'outer;
                }
            } else {
                run = 0;
            }
        }
    }

    let class = best?;
    let score: u32 = classes
        .iter()
        .zip(diffs.iter())
        .filter(|(&c, _)| c == class)
        .map(|(_, &d)| (d.abs() - t) as u32)
        .sum();
    Some(score.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_image() -> GrayImage {
        GrayImage::from_fn(40, 40, |x, y| {
            if (15..25).contains(&x) && (15..25).contains(&y) {
                200
            } else {
                20
            }
        })
    }

    #[test]
    fn test_fast_detects_square_corners() {
        let corners = fast_corners(&square_image(), 50, 9, 3);
        assert!(!corners.is_empty());
        for c in &corners {
            let near_corner = [(15, 15), (24, 15), (15, 24), (24, 24)]
                .iter()
                .any(|&(cx, cy)| c.x.abs_diff(cx) <= 2 && c.y.abs_diff(cy) <= 2);
            assert!(near_corner, "unexpected corner at {}, {}", c.x, c.y);
        }
    }

    #[test]
    fn test_corner_score_sums_contrast_above_threshold() {
        // bright dot: every circle pixel is 200 darker than the center
        let img = GrayImage::from_fn(7, 7, |x, y| if (x, y) == (3, 3) { 220 } else { 20 });
        assert_eq!(corner_score(&img, 3, 3, 20, 9), Some(16 * (200 - 20)));
        assert_eq!(corner_score(&img, 3, 3, 20, 12), Some(16 * (200 - 20)));

        let flat = GrayImage::from_fn(7, 7, |_, _| 128);
        assert_eq!(corner_score(&flat, 3, 3, 20, 9), None);
    }

    #[test]
    fn test_flat_image_has_no_corners() {
        let img = GrayImage::from_fn(32, 32, |_, _| 128);
        assert!(fast_corners(&img, 10, 9, 3).is_empty());
    }

    #[test]
    fn test_detection_is_deterministic() {
        let img = square_image();
        assert_eq!(fast_corners(&img, 40, 9, 3), fast_corners(&img, 40, 9, 3));
    }
}
