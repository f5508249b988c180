use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::Descriptor;

/// Options of the brute-force descriptor matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingOptions {
    /// Lowe ratio between best and second best distance; values >= 1 disable the test.
    pub max_ratio: f32,
    /// Maximum Hamming distance of an accepted match.
    pub max_distance: u32,
    /// Keep only mutual nearest neighbors.
    pub cross_check: bool,
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self {
            max_ratio: 0.8,
            max_distance: 80,
            cross_check: true,
        }
    }
}

/// A putative correspondence between keypoints of two images.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct FeatureMatch {
    /// Keypoint index in the first image.
    pub point2d_idx1: u32,
    /// Keypoint index in the second image.
    pub point2d_idx2: u32,
}

impl FeatureMatch {
    /// Create a new match.
    pub fn new(point2d_idx1: u32, point2d_idx2: u32) -> Self {
        Self {
            point2d_idx1,
            point2d_idx2,
        }
    }

    /// The same correspondence seen from the other image.
    pub fn swapped(&self) -> Self {
        Self::new(self.point2d_idx2, self.point2d_idx1)
    }
}

/// Hamming distance between two binary descriptors.
#[inline]
pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x ^ y).count_ones())
        .sum()
}

// (best index, best distance, second best distance)
fn nearest_two(query: &Descriptor, train: &[Descriptor]) -> (usize, u32, u32) {
    let mut best = (0usize, u32::MAX, u32::MAX);
    for (j, d) in train.iter().enumerate() {
        let dist = hamming_distance(query, d);
        if dist < best.1 {
            best = (j, dist, best.1);
        } else if dist < best.2 {
            best.2 = dist;
        }
    }
    best
}

/// Match binary descriptors with brute-force Hamming distance.
///
/// Each descriptor of `descriptors1` is matched to its nearest neighbor in
/// `descriptors2`, then filtered by maximum distance, Lowe's ratio test and
/// optionally a mutual cross-check. Matches are returned sorted by the index
/// in the first image.
pub fn match_descriptors(
    descriptors1: &[Descriptor],
    descriptors2: &[Descriptor],
    options: &MatchingOptions,
) -> Vec<FeatureMatch> {
    if descriptors1.is_empty() || descriptors2.is_empty() {
        return Vec::new();
    }

    let forward = descriptors1
        .par_iter()
        .map(|d| nearest_two(d, descriptors2))
        .collect::<Vec<_>>();

    let reverse = options.cross_check.then(|| {
        descriptors2
            .par_iter()
            .map(|d| nearest_two(d, descriptors1).0)
            .collect::<Vec<_>>()
    });

    forward
        .iter()
        .enumerate()
        .filter_map(|(i, &(j, best, second))| {
            if best > options.max_distance {
                return None;
            }
            if let Some(rev) = &reverse {
                if rev[j] != i {
                    return None;
                }
            }
            if options.max_ratio < 1.0 && second != u32::MAX {
                let denom = (second as f32).max(f32::EPSILON);
                if best as f32 / denom >= options.max_ratio {
                    return None;
                }
            }
            Some(FeatureMatch::new(i as u32, j as u32))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(seed: u8) -> Descriptor {
        let mut d = [0u8; 32];
        for (i, b) in d.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8).rotate_left(seed as u32 % 8);
        }
        d
    }

    #[test]
    fn test_hamming_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[0] = 0b1011;
        b[31] = 0xff;
        assert_eq!(hamming_distance(&a, &b), 11);
        assert_eq!(hamming_distance(&a, &a), 0);
    }

    #[test]
    fn test_match_permuted_descriptors() {
        let d1 = (0..20).map(desc).collect::<Vec<_>>();
        let perm = [3usize, 7, 1, 0, 19, 5];
        let d2 = perm.iter().map(|&i| d1[i]).collect::<Vec<_>>();

        let matches = match_descriptors(&d1, &d2, &MatchingOptions::default());
        assert_eq!(matches.len(), perm.len());
        for m in &matches {
            assert_eq!(perm[m.point2d_idx2 as usize], m.point2d_idx1 as usize);
        }
        assert!(matches
            .windows(2)
            .all(|w| w[0].point2d_idx1 < w[1].point2d_idx1));
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[0] = 1;
        let d1 = vec![a];
        let d2 = vec![a, b];
        let opts = MatchingOptions {
            max_ratio: 0.5,
            cross_check: false,
            ..Default::default()
        };
        // best = 0, second = 1 -> ratio 0 passes
        assert_eq!(match_descriptors(&d1, &d2, &opts).len(), 1);

        let mut c = [0u8; 32];
        c[0] = 1;
        let mut e = [0u8; 32];
        e[0] = 7;
        // best = 1, second = 2 -> ratio 0.5 rejected
        assert!(match_descriptors(&[c], &[[0u8; 32], e], &opts).is_empty());
    }

    #[test]
    fn test_empty_inputs() {
        assert!(match_descriptors(&[], &[[0u8; 32]], &MatchingOptions::default()).is_empty());
    }
}
