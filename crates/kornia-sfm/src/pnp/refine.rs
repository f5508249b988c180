//! Levenberg-Marquardt pose refinement for PnP solutions.
//!
//! Minimizes the pixel reprojection error over a left perturbation
//! `R' = exp(w) R`, `t' = t + v` of the world to camera pose.

use faer::Mat;
use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

use super::{check_lengths, PnPError};
use crate::camera::Camera;
use crate::linalg::solve_spd;
use crate::pose::{skew, Rigid3};

/// Parameters controlling the LM pose refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseRefineOptions {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,
    /// Convergence threshold on the relative cost change.
    pub cost_tolerance: f64,
    /// Convergence threshold on the gradient max-norm.
    pub gradient_tolerance: f64,
    /// Initial damping factor (lambda).
    pub initial_lambda: f64,
}

impl Default for PoseRefineOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            cost_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

/// Outcome of a pose refinement.
#[derive(Debug, Clone)]
pub struct PoseRefineSummary {
    /// Refined pose.
    pub pose: Rigid3,
    /// Root-mean-square reprojection error in pixels before refinement.
    pub initial_rmse: f64,
    /// Root-mean-square reprojection error in pixels after refinement.
    pub final_rmse: f64,
    /// Number of iterations taken.
    pub num_iterations: usize,
}

fn cost(camera: &Camera, world: &[DVec3], image: &[DVec2], pose: &Rigid3) -> f64 {
    world
        .iter()
        .zip(image.iter())
        .map(|(pw, uv)| match camera.project(pose.transform_point(*pw)) {
            Some(p) => (p - *uv).length_squared(),
            None => f64::INFINITY,
        })
        .sum()
}

// Normal equations J^T J and J^T r of the 2N x 6 system, or None if a point is behind the camera.
fn linearize(
    camera: &Camera,
    world: &[DVec3],
    image: &[DVec2],
    pose: &Rigid3,
) -> Option<(Mat<f64>, [f64; 6])> {
    let mut jtj = Mat::<f64>::zeros(6, 6);
    let mut jtr = [0.0; 6];
    for (pw, uv) in world.iter().zip(image.iter()) {
        let rx = pose.rotation * *pw;
        let pc = rx + pose.translation;
        if pc.z <= f64::EPSILON {
            return None;
        }
        let n = DVec2::new(pc.x / pc.z, pc.y / pc.z);
        let r = camera.img_from_normalized(n) - *uv;

        // d uv / d pc = (d uv / d n) (d n / d pc)
        let [jn_x, jn_y] = camera.normalized_jacobian(n);
        let inv_z = 1.0 / pc.z;
        let dn_dpc = [
            DVec3::new(inv_z, 0.0, -n.x * inv_z),
            DVec3::new(0.0, inv_z, -n.y * inv_z),
        ];
        let duv_dpc = [
            dn_dpc[0] * jn_x.x + dn_dpc[1] * jn_y.x,
            dn_dpc[0] * jn_x.y + dn_dpc[1] * jn_y.y,
        ];

        // d pc / d w = -[R X]x, d pc / d v = I
        let dpc_dw = -skew(rx);
        let mut rows = [[0.0; 6]; 2];
        for (row, g) in rows.iter_mut().zip(duv_dpc.iter()) {
            let gw = dpc_dw.transpose() * *g;
            *row = [gw.x, gw.y, gw.z, g.x, g.y, g.z];
        }

        for (row, res) in rows.iter().zip([r.x, r.y]) {
            for i in 0..6 {
                jtr[i] += row[i] * res;
                for j in 0..6 {
                    jtj.write(i, j, jtj.read(i, j) + row[i] * row[j]);
                }
            }
        }
    }
    Some((jtj, jtr))
}

/// Refine a pose by minimizing the pixel reprojection error of 2D-3D correspondences.
///
/// # Arguments
///
/// * `camera` - Intrinsics used for projection, including distortion.
/// * `points_world` - 3-D points in the world frame.
/// * `points_image` - Observed pixel positions.
/// * `initial` - Initial world to camera pose.
/// * `options` - LM settings.
pub fn refine_pose(
    camera: &Camera,
    points_world: &[DVec3],
    points_image: &[DVec2],
    initial: &Rigid3,
    options: &PoseRefineOptions,
) -> Result<PoseRefineSummary, PnPError> {
    check_lengths(points_world.len(), points_image.len(), 3)?;
    let n = points_world.len() as f64;

    let mut pose = *initial;
    let mut current = cost(camera, points_world, points_image, &pose);
    if !current.is_finite() {
        return Err(PnPError::Degenerate);
    }
    let initial_rmse = (current / n).sqrt();
    let mut lambda = options.initial_lambda;
    let mut num_iterations = 0;

    while num_iterations < options.max_iterations {
        num_iterations += 1;
        let Some((jtj, jtr)) = linearize(camera, points_world, points_image, &pose) else {
            break;
        };
        if jtr.iter().fold(0.0f64, |m, g| m.max(g.abs())) < options.gradient_tolerance {
            break;
        }

        let mut accepted = false;
        let mut converged = false;
        while lambda < 1e10 {
            let mut damped = jtj.clone();
            for i in 0..6 {
                let d = jtj.read(i, i);
                damped.write(i, i, d + lambda * d.max(1e-12));
            }
            let rhs = jtr.map(|g| -g);
            let Some(delta) = solve_spd(&damped, &rhs) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = pose.perturbed(
                DVec3::new(delta[0], delta[1], delta[2]),
                DVec3::new(delta[3], delta[4], delta[5]),
            );
            let new_cost = cost(camera, points_world, points_image, &candidate);
            if new_cost < current {
                let rel = (current - new_cost) / current.max(f64::EPSILON);
                pose = candidate;
                current = new_cost;
                lambda = (lambda / 10.0).max(1e-12);
                accepted = true;
                converged = rel < options.cost_tolerance;
                break;
            }
            lambda *= 10.0;
        }
        if !accepted || converged {
            break;
        }
    }

    Ok(PoseRefineSummary {
        pose,
        initial_rmse,
        final_rmse: (current / n).sqrt(),
        num_iterations,
    })
}
