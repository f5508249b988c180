use glam::{DVec2, DVec3};
use log::debug;
use serde::{Deserialize, Serialize};

use super::epnp::solve_epnp;
use super::refine::{refine_pose, PoseRefineOptions};
use super::{check_lengths, PnPError};
use crate::camera::Camera;
use crate::geometry::ransac::{ransac, Estimator, RansacOptions};
use crate::pose::Rigid3;

/// Options of robust absolute pose estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsolutePoseOptions {
    /// RANSAC options; `max_error` is expressed in pixels.
    pub ransac: RansacOptions,
    /// Minimum number of inliers to accept a pose.
    pub min_num_inliers: usize,
    /// Refinement applied to the inliers of the best hypothesis.
    pub refine: PoseRefineOptions,
}

impl Default for AbsolutePoseOptions {
    fn default() -> Self {
        Self {
            ransac: RansacOptions {
                max_error: 8.0,
                ..Default::default()
            },
            min_num_inliers: 12,
            refine: PoseRefineOptions::default(),
        }
    }
}

/// Result of robust absolute pose estimation.
#[derive(Debug, Clone)]
pub struct AbsolutePoseReport {
    /// World to camera pose.
    pub pose: Rigid3,
    /// Per-correspondence inlier mask.
    pub inliers: Vec<bool>,
    /// Number of inliers.
    pub num_inliers: usize,
}

struct EPnPEstimator;

impl Estimator for EPnPEstimator {
    type Datum = (DVec3, DVec2);
    type Model = Rigid3;
    const SAMPLE_SIZE: usize = 6;

    fn estimate(&self, data: &[Self::Datum]) -> Vec<Rigid3> {
        let (world, image): (Vec<_>, Vec<_>) = data.iter().copied().unzip();
        solve_epnp(&world, &image).into_iter().collect()
    }

    fn residual(&self, pose: &Rigid3, datum: &Self::Datum) -> f64 {
        let pc = pose.transform_point(datum.0);
        if pc.z <= f64::EPSILON {
            return f64::INFINITY;
        }
        (pc.truncate() / pc.z - datum.1).length_squared()
    }
}

/// Estimate a camera pose from 2D-3D correspondences with EPnP inside RANSAC,
/// followed by LM refinement on the inliers.
///
/// The inlier mask is recomputed with the refined pose.
pub fn estimate_absolute_pose(
    camera: &Camera,
    points_world: &[DVec3],
    points_image: &[DVec2],
    options: &AbsolutePoseOptions,
) -> Result<AbsolutePoseReport, PnPError> {
    let required = options.min_num_inliers.max(EPnPEstimator::SAMPLE_SIZE);
    check_lengths(points_world.len(), points_image.len(), required)?;

    let data = points_world
        .iter()
        .zip(points_image.iter())
        .map(|(pw, uv)| (*pw, camera.normalized_from_img(*uv)))
        .collect::<Vec<_>>();
    let ransac_options = RansacOptions {
        max_error: camera.threshold_to_normalized(options.ransac.max_error),
        ..options.ransac.clone()
    };

    let report = ransac(&EPnPEstimator, &data, &ransac_options).ok_or(PnPError::Degenerate)?;
    if report.num_inliers < required {
        return Err(PnPError::InsufficientInliers {
            required,
            actual: report.num_inliers,
        });
    }

    let (inlier_world, inlier_image): (Vec<_>, Vec<_>) = points_world
        .iter()
        .zip(points_image.iter())
        .zip(report.inliers.iter())
        .filter(|(_, &inl)| inl)
        .map(|((pw, uv), _)| (*pw, *uv))
        .unzip();

    let pose = match refine_pose(
        camera,
        &inlier_world,
        &inlier_image,
        &report.model,
        &options.refine,
    ) {
        Ok(summary) => {
            debug!(
                "pose refinement: rmse {:.3} -> {:.3} px in {} iterations",
                summary.initial_rmse, summary.final_rmse, summary.num_iterations
            );
            summary.pose
        }
        Err(err) => {
            debug!("pose refinement skipped: {err}");
            report.model
        }
    };

    let threshold_sq = options.ransac.max_error * options.ransac.max_error;
    let inliers = points_world
        .iter()
        .zip(points_image.iter())
        .map(|(pw, uv)| {
            camera
                .project(pose.transform_point(*pw))
                .is_some_and(|p| (p - *uv).length_squared() <= threshold_sq)
        })
        .collect::<Vec<_>>();
    let num_inliers = inliers.iter().filter(|&&b| b).count();
    if num_inliers < required {
        return Err(PnPError::InsufficientInliers {
            required,
            actual: num_inliers,
        });
    }

    Ok(AbsolutePoseReport {
        pose,
        inliers,
        num_inliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModelId;
    use glam::DQuat;

    fn setup(num_outliers: usize) -> (Camera, Rigid3, Vec<DVec3>, Vec<DVec2>) {
        let camera = Camera::new(1, CameraModelId::Pinhole, 640, 480, vec![500.0, 500.0, 320.0, 240.0])
            .expect("valid camera");
        let pose = Rigid3::new(
            DQuat::from_scaled_axis(DVec3::new(-0.05, 0.2, 0.01)),
            DVec3::new(0.5, 0.1, 1.0),
        );
        let mut world = Vec::new();
        let mut image = Vec::new();
        for i in 0..60 {
            let p = DVec3::new(
                ((i * 37) % 61) as f64 / 10.0 - 3.0,
                ((i * 53) % 47) as f64 / 8.0 - 3.0,
                8.0 + ((i * 17) % 41) as f64 / 10.0,
            );
            world.push(p);
            image.push(camera.project(pose.transform_point(p)).expect("in front"));
        }
        for i in 0..num_outliers {
            world.push(DVec3::new(i as f64 * 0.1, -1.0, 9.0));
            image.push(DVec2::new(30.0 + 25.0 * i as f64, 440.0 - 9.0 * i as f64));
        }
        (camera, pose, world, image)
    }

    #[test]
    fn test_absolute_pose_with_outliers() -> Result<(), PnPError> {
        let (camera, pose, world, image) = setup(15);
        let report = estimate_absolute_pose(&camera, &world, &image, &AbsolutePoseOptions::default())?;
        assert!(report.pose.rotation_angle_to(&pose) < 1e-6);
        assert!((report.pose.translation - pose.translation).length() < 1e-5);
        assert!(report.inliers[..60].iter().all(|&b| b));
        assert!(report.num_inliers >= 60);
        Ok(())
    }

    #[test]
    fn test_absolute_pose_too_few_points() {
        let (camera, _, world, image) = setup(0);
        let res = estimate_absolute_pose(
            &camera,
            &world[..8],
            &image[..8],
            &AbsolutePoseOptions::default(),
        );
        assert!(matches!(
            res,
            Err(PnPError::InsufficientCorrespondences { required: 12, actual: 8 })
        ));
    }
}
