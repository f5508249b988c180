use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use super::essential::{fundamental_from_essential, pose_from_essential, EssentialEstimator};
use super::homography::HomographyEstimator;
use super::ransac::{ransac, Estimator, RansacOptions};
use super::triangulation::triangulation_angle;
use crate::camera::Camera;
use crate::features::FeatureMatch;
use crate::pose::Rigid3;

/// Errors returned by two-view geometry estimation.
#[derive(thiserror::Error, Debug)]
pub enum TwoViewError {
    /// Not enough putative matches to attempt an estimate.
    #[error("Need at least {required} matches, got {actual}")]
    InsufficientMatches {
        /// Minimum number of matches.
        required: usize,
        /// Number of matches given.
        actual: usize,
    },
    /// A match references a keypoint outside the keypoint list.
    #[error("Match references keypoint {index} but the image has {num_keypoints} keypoints")]
    InvalidMatch {
        /// Offending keypoint index.
        index: u32,
        /// Number of keypoints of the image.
        num_keypoints: usize,
    },
    /// RANSAC failed to find any model.
    #[error("RANSAC failed to find a valid model")]
    RansacFailure,
    /// The best model has too few inliers.
    #[error("Best model has {actual} inliers, need {required}")]
    InsufficientInliers {
        /// Minimum number of inliers.
        required: usize,
        /// Number of inliers of the winning model.
        actual: usize,
    },
}

/// Geometric configuration of a verified pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwoViewConfiguration {
    /// The essential matrix explains the matches best; the pair has a usable baseline.
    Calibrated,
    /// A homography explains the matches best (planar scene or pure rotation).
    Planar,
}

/// Options of two-view geometric verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoViewGeometryOptions {
    /// Minimum number of inliers of the winning model.
    pub min_num_inliers: usize,
    /// RANSAC options; `max_error` is expressed in pixels.
    pub ransac: RansacOptions,
}

impl Default for TwoViewGeometryOptions {
    fn default() -> Self {
        Self {
            min_num_inliers: 15,
            ransac: RansacOptions::default(),
        }
    }
}

/// Verified geometry of an image pair.
#[derive(Debug, Clone)]
pub struct TwoViewGeometry {
    /// Winning model.
    pub config: TwoViewConfiguration,
    /// Matches consistent with the winning model.
    pub inlier_matches: Vec<FeatureMatch>,
    /// Essential matrix in normalized coordinates.
    pub essential: DMat3,
    /// Fundamental matrix in pixel coordinates.
    pub fundamental: DMat3,
    /// Homography in normalized coordinates.
    pub homography: DMat3,
    /// Pose of the second camera relative to the first, with unit translation.
    pub relative_pose: Option<Rigid3>,
    /// Median triangulation angle of the essential inliers, in degrees.
    pub tri_angle_deg: f64,
    /// Number of essential matrix inliers.
    pub num_essential_inliers: usize,
    /// Number of homography inliers.
    pub num_homography_inliers: usize,
}

impl TwoViewGeometry {
    /// Number of inlier matches of the winning model.
    pub fn num_inliers(&self) -> usize {
        self.inlier_matches.len()
    }

    /// The same geometry with the roles of the two images exchanged.
    pub fn inverted(&self) -> Self {
        let homography = if self.homography.determinant().abs() > f64::EPSILON {
            self.homography.inverse()
        } else {
            self.homography
        };
        Self {
            config: self.config,
            inlier_matches: self.inlier_matches.iter().map(FeatureMatch::swapped).collect(),
            essential: self.essential.transpose(),
            fundamental: self.fundamental.transpose(),
            homography,
            relative_pose: self.relative_pose.map(|p| p.inverse()),
            tri_angle_deg: self.tri_angle_deg,
            num_essential_inliers: self.num_essential_inliers,
            num_homography_inliers: self.num_homography_inliers,
        }
    }
}

fn normalized_points(
    camera: &Camera,
    keypoints: &[DVec2],
    idxs: impl Iterator<Item = u32>,
) -> Result<Vec<DVec2>, TwoViewError> {
    idxs.map(|i| {
        keypoints
            .get(i as usize)
            .map(|&uv| camera.normalized_from_img(uv))
            .ok_or(TwoViewError::InvalidMatch {
                index: i,
                num_keypoints: keypoints.len(),
            })
    })
    .collect()
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

/// Estimate the two-view geometry of an image pair from putative matches.
///
/// Both an essential matrix (8-point, Sampson error) and a homography (DLT,
/// transfer error) are estimated with RANSAC on normalized coordinates. The
/// model with more inliers wins; the essential matrix wins ties. The relative
/// pose is always recovered from the essential matrix.
///
/// # Arguments
///
/// * `camera1`, `camera2` - Intrinsics of both images.
/// * `keypoints1`, `keypoints2` - Keypoint pixel positions of both images.
/// * `matches` - Putative matches between the two keypoint lists.
/// * `options` - Verification options.
pub fn estimate_two_view_geometry(
    camera1: &Camera,
    camera2: &Camera,
    keypoints1: &[DVec2],
    keypoints2: &[DVec2],
    matches: &[FeatureMatch],
    options: &TwoViewGeometryOptions,
) -> Result<TwoViewGeometry, TwoViewError> {
    let required = options.min_num_inliers.max(EssentialEstimator::SAMPLE_SIZE);
    if matches.len() < required {
        return Err(TwoViewError::InsufficientMatches {
            required,
            actual: matches.len(),
        });
    }

    let x1 = normalized_points(camera1, keypoints1, matches.iter().map(|m| m.point2d_idx1))?;
    let x2 = normalized_points(camera2, keypoints2, matches.iter().map(|m| m.point2d_idx2))?;
    let data = x1.iter().copied().zip(x2.iter().copied()).collect::<Vec<_>>();

    let threshold = 0.5
        * (camera1.threshold_to_normalized(options.ransac.max_error)
            + camera2.threshold_to_normalized(options.ransac.max_error));
    let ransac_options = RansacOptions {
        max_error: threshold,
        ..options.ransac.clone()
    };

    let essential = ransac(&EssentialEstimator, &data, &ransac_options);
    let homography = ransac(&HomographyEstimator, &data, &ransac_options);

    let num_e = essential.as_ref().map_or(0, |r| r.num_inliers);
    let num_h = homography.as_ref().map_or(0, |r| r.num_inliers);

    let (config, inliers) = match (&essential, &homography) {
        (Some(e), Some(h)) if h.num_inliers > e.num_inliers => {
            (TwoViewConfiguration::Planar, &h.inliers)
        }
        (Some(e), _) => (TwoViewConfiguration::Calibrated, &e.inliers),
        (None, Some(h)) => (TwoViewConfiguration::Planar, &h.inliers),
        (None, None) => return Err(TwoViewError::RansacFailure),
    };

    let inlier_matches = matches
        .iter()
        .zip(inliers.iter())
        .filter(|(_, &inl)| inl)
        .map(|(m, _)| *m)
        .collect::<Vec<_>>();

    if inlier_matches.len() < options.min_num_inliers {
        return Err(TwoViewError::InsufficientInliers {
            required: options.min_num_inliers,
            actual: inlier_matches.len(),
        });
    }

    let e = essential.as_ref().map_or(DMat3::ZERO, |r| r.model);
    let (relative_pose, tri_angle_deg) = match &essential {
        Some(report) => {
            let (ex1, ex2): (Vec<_>, Vec<_>) = data
                .iter()
                .zip(report.inliers.iter())
                .filter(|(_, &inl)| inl)
                .map(|(d, _)| *d)
                .unzip();
            match pose_from_essential(&report.model, &ex1, &ex2) {
                Some((pose, points)) => {
                    let center2 = pose.center();
                    let mut angles = points
                        .iter()
                        .flatten()
                        .map(|&p| triangulation_angle(DVec3::ZERO, center2, p).to_degrees())
                        .collect::<Vec<_>>();
                    (Some(pose), median(&mut angles))
                }
                None => (None, 0.0),
            }
        }
        None => (None, 0.0),
    };

    Ok(TwoViewGeometry {
        config,
        inlier_matches,
        essential: e,
        fundamental: fundamental_from_essential(
            &e,
            &camera1.calibration_matrix(),
            &camera2.calibration_matrix(),
        ),
        homography: homography.as_ref().map_or(DMat3::ZERO, |r| r.model),
        relative_pose,
        tri_angle_deg,
        num_essential_inliers: num_e,
        num_homography_inliers: num_h,
    })
}
