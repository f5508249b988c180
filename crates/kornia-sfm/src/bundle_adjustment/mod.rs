//! Bundle adjustment of poses, intrinsics and points.
//!
//! Minimizes `0.5 * sum rho(|r|^2)` over the pixel reprojection residuals `r`
//! with Levenberg-Marquardt. Poses are updated with a left perturbation
//! `R' = exp(w) R`, `t' = t + v`; the normal equations are reduced on the
//! point blocks, see [`schur`].

use std::collections::{BTreeMap, BTreeSet};

use glam::{DVec2, DVec3};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::camera::{img_from_normalized_with, Camera};
use crate::pose::{skew, Rigid3};
use crate::reconstruction::Reconstruction;
use crate::types::{CameraId, ImageId, Point3DId};

/// Robust loss functions.
pub mod loss;

mod schur;

pub use loss::LossFunction;
use schur::{NormalEquations, ObservationBlock, PointBlock};

/// Error types for bundle adjustment.
#[derive(Debug, thiserror::Error)]
pub enum BundleAdjustmentError {
    /// No residual or no free parameter.
    #[error("bundle adjustment problem is empty")]
    EmptyProblem,

    /// The loss function parameters are not usable.
    #[error("invalid loss function {0:?}")]
    InvalidLoss(LossFunction),

    /// The iteration budget ended before convergence.
    #[error("no convergence after {iterations} iterations (cost {initial_cost} -> {final_cost})")]
    NoConvergence {
        /// Iterations performed.
        iterations: usize,
        /// Cost before the adjustment.
        initial_cost: f64,
        /// Cost of the last accepted state.
        final_cost: f64,
    },

    /// The linear system is singular or not finite.
    #[error("numeric failure: {0}")]
    NumericFailure(&'static str),
}

/// Parameters of the Levenberg-Marquardt solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentOptions {
    /// Robust loss applied to squared pixel residuals.
    pub loss: LossFunction,
    /// Refine focal lengths of non-constant cameras.
    pub refine_focal_length: bool,
    /// Refine distortion parameters of non-constant cameras.
    pub refine_extra_params: bool,
    /// Maximum number of linearizations.
    pub max_iterations: usize,
    /// Convergence threshold on the relative cost decrease.
    pub function_tolerance: f64,
    /// Convergence threshold on the gradient max-norm.
    pub gradient_tolerance: f64,
    /// Convergence threshold on the relative step size.
    pub parameter_tolerance: f64,
    /// Initial damping factor.
    pub initial_lambda: f64,
    /// Damping beyond which the solver stops.
    pub max_lambda: f64,
    /// Multiplier applied to the damping after a rejected step.
    pub lambda_factor: f64,
}

impl Default for BundleAdjustmentOptions {
    fn default() -> Self {
        Self {
            loss: LossFunction::Trivial,
            refine_focal_length: false,
            refine_extra_params: false,
            max_iterations: 100,
            function_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-8,
            initial_lambda: 1e-4,
            max_lambda: 1e10,
            lambda_factor: 10.0,
        }
    }
}

/// Which parts of the reconstruction enter the problem and which are held fixed.
///
/// All observations in `image_ids` are added. Variable points observed by
/// images outside the set also bring those observations in, with the pose of
/// the outside image held constant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleAdjustmentConfig {
    /// Images whose observations are optimized.
    pub image_ids: BTreeSet<ImageId>,
    /// Images with a fixed pose.
    pub constant_poses: BTreeSet<ImageId>,
    /// Images with one fixed translation component (0, 1 or 2).
    pub constant_translation_axis: BTreeMap<ImageId, usize>,
    /// Points optimized with all their observations.
    pub variable_points: BTreeSet<Point3DId>,
    /// Points with a fixed position.
    pub constant_points: BTreeSet<Point3DId>,
    /// Cameras with fixed intrinsics.
    pub constant_cameras: BTreeSet<CameraId>,
}

impl BundleAdjustmentConfig {
    /// Config over the given images.
    pub fn from_images(image_ids: impl IntoIterator<Item = ImageId>) -> Self {
        Self {
            image_ids: image_ids.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Fix the gauge: the pose of the first registered image of the set, and the
    /// largest translation component of the second.
    pub fn fix_gauge(&mut self, reconstruction: &Reconstruction) {
        let mut ordered = reconstruction
            .registered_image_ids()
            .iter()
            .filter(|id| self.image_ids.contains(id));
        if let Some(&first) = ordered.next() {
            self.constant_poses.insert(first);
        }
        if let Some(&second) = ordered.next() {
            if let Ok(image) = reconstruction.image(second) {
                let t = image.pose.translation.abs();
                let axis = if t.x >= t.y && t.x >= t.z {
                    0
                } else if t.y >= t.z {
                    1
                } else {
                    2
                };
                self.constant_translation_axis.insert(second, axis);
            }
        }
    }
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Relative cost decrease below tolerance.
    FunctionConverged,
    /// Gradient max-norm below tolerance.
    GradientConverged,
    /// Relative step size below tolerance.
    ParameterConverged,
    /// No decreasing step found before the damping limit.
    LambdaMaxExceeded,
}

/// Outcome of a successful bundle adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleAdjustmentSummary {
    /// Cost before the adjustment.
    pub initial_cost: f64,
    /// Cost after the adjustment, never above `initial_cost`.
    pub final_cost: f64,
    /// Number of linearizations.
    pub num_iterations: usize,
    /// Number of 2D residuals.
    pub num_residuals: usize,
    /// Number of free parameters.
    pub num_parameters: usize,
    /// Why the solver stopped.
    pub termination: TerminationReason,
}

struct Residual {
    image_id: ImageId,
    xy: DVec2,
}

struct PointResiduals {
    point3d_id: Point3DId,
    variable: bool,
    residuals: Vec<Residual>,
}

// Offsets of free parameters in the reduced camera system.
#[derive(Default)]
struct Layout {
    poses: BTreeMap<ImageId, Vec<(usize, usize)>>,
    cameras: BTreeMap<CameraId, Vec<(usize, usize)>>,
    num_params: usize,
}

#[derive(Clone)]
struct State {
    poses: BTreeMap<ImageId, Rigid3>,
    params: BTreeMap<CameraId, Vec<f64>>,
    points: Vec<DVec3>,
}

struct Problem<'a> {
    reconstruction: &'a Reconstruction,
    camera_of: BTreeMap<ImageId, CameraId>,
    groups: Vec<PointResiduals>,
    layout: Layout,
    loss: LossFunction,
}

impl Problem<'_> {
    fn num_residuals(&self) -> usize {
        self.groups.iter().map(|g| g.residuals.len()).sum()
    }

    fn camera(&self, camera_id: CameraId) -> Option<&Camera> {
        self.reconstruction.cameras().get(&camera_id)
    }

    fn project(&self, state: &State, image_id: ImageId, xyz: DVec3) -> Option<DVec2> {
        let camera_id = self.camera_of.get(&image_id)?;
        let camera = self.camera(*camera_id)?;
        let pc = state.poses.get(&image_id)?.transform_point(xyz);
        if pc.z <= f64::EPSILON {
            return None;
        }
        let params = state.params.get(camera_id)?;
        Some(img_from_normalized_with(
            camera.model,
            params,
            DVec2::new(pc.x / pc.z, pc.y / pc.z),
        ))
    }

    fn cost(&self, state: &State) -> f64 {
        self.groups
            .par_iter()
            .zip(state.points.par_iter())
            .map(|(group, xyz)| {
                group
                    .residuals
                    .iter()
                    .map(|res| match self.project(state, res.image_id, *xyz) {
                        Some(uv) => 0.5 * self.loss.rho((uv - res.xy).length_squared()),
                        None => f64::INFINITY,
                    })
                    .sum::<f64>()
            })
            .sum()
    }

    fn linearize_point(&self, state: &State, group: &PointResiduals, xyz: DVec3) -> Option<PointBlock> {
        let mut observations = Vec::with_capacity(group.residuals.len());
        for res in &group.residuals {
            let camera_id = *self.camera_of.get(&res.image_id)?;
            let camera = self.camera(camera_id)?;
            let params = state.params.get(&camera_id)?;
            let pose = state.poses.get(&res.image_id)?;

            let rx = pose.rotation * xyz;
            let pc = rx + pose.translation;
            if pc.z <= f64::EPSILON {
                return None;
            }
            let n = DVec2::new(pc.x / pc.z, pc.y / pc.z);
            let r = img_from_normalized_with(camera.model, params, n) - res.xy;

            let [jn_x, jn_y] = normalized_jacobian(camera, params, n);
            let inv_z = 1.0 / pc.z;
            let dn_dpc = [
                DVec3::new(inv_z, 0.0, -n.x * inv_z),
                DVec3::new(0.0, inv_z, -n.y * inv_z),
            ];
            // rows d u / d pc and d v / d pc
            let duv_dpc = [
                dn_dpc[0] * jn_x.x + dn_dpc[1] * jn_y.x,
                dn_dpc[0] * jn_x.y + dn_dpc[1] * jn_y.y,
            ];

            let weight = self.loss.weight(r.length_squared()).sqrt();
            let mut cols = Vec::new();
            if let Some(pose_cols) = self.layout.poses.get(&res.image_id) {
                let dpc_dw = -skew(rx);
                let gw = [
                    dpc_dw.transpose() * duv_dpc[0],
                    dpc_dw.transpose() * duv_dpc[1],
                ];
                for &(local, index) in pose_cols {
                    let col = if local < 3 {
                        DVec2::new(gw[0][local], gw[1][local])
                    } else {
                        DVec2::new(duv_dpc[0][local - 3], duv_dpc[1][local - 3])
                    };
                    cols.push((index, col * weight));
                }
            }
            if let Some(camera_cols) = self.layout.cameras.get(&camera_id) {
                for &(param, index) in camera_cols {
                    cols.push((index, intrinsic_derivative(camera, params, param, n) * weight));
                }
            }
            let rotation = pose.rotation_matrix();
            let jp = [
                rotation.transpose() * duv_dpc[0] * weight,
                rotation.transpose() * duv_dpc[1] * weight,
            ];
            observations.push(ObservationBlock {
                cols,
                jp,
                residual: r * weight,
            });
        }
        Some(PointBlock {
            variable: group.variable,
            observations,
        })
    }

    fn linearize(&self, state: &State) -> Option<Vec<PointBlock>> {
        self.groups
            .par_iter()
            .zip(state.points.par_iter())
            .map(|(group, xyz)| self.linearize_point(state, group, *xyz))
            .collect()
    }

    fn apply(&self, state: &State, dc: &[f64], dp: &[DVec3]) -> Option<State> {
        let mut next = state.clone();
        for (image_id, cols) in &self.layout.poses {
            let mut delta = [0.0; 6];
            for &(local, index) in cols {
                delta[local] = dc[index];
            }
            let pose = next.poses.get_mut(image_id)?;
            *pose = pose.perturbed(
                DVec3::new(delta[0], delta[1], delta[2]),
                DVec3::new(delta[3], delta[4], delta[5]),
            );
        }
        for (camera_id, cols) in &self.layout.cameras {
            let params = next.params.get_mut(camera_id)?;
            for &(param, index) in cols {
                params[param] += dc[index];
            }
            let camera = self.camera(*camera_id)?;
            let focal_ok = camera
                .model
                .focal_length_idxs()
                .iter()
                .all(|&i| params[i] > 0.0);
            if !focal_ok {
                return None;
            }
        }
        for (xyz, step) in next.points.iter_mut().zip(dp) {
            *xyz += *step;
        }
        Some(next)
    }
}

fn normalized_jacobian(camera: &Camera, params: &[f64], n: DVec2) -> [DVec2; 2] {
    let h = 1e-7;
    let f = |p: DVec2| img_from_normalized_with(camera.model, params, p);
    let dx = DVec2::new(h, 0.0);
    let dy = DVec2::new(0.0, h);
    [
        (f(n + dx) - f(n - dx)) / (2.0 * h),
        (f(n + dy) - f(n - dy)) / (2.0 * h),
    ]
}

fn intrinsic_derivative(camera: &Camera, params: &[f64], param: usize, n: DVec2) -> DVec2 {
    let h = 1e-6 * params[param].abs().max(1e-3);
    let mut plus = params.to_vec();
    let mut minus = params.to_vec();
    plus[param] += h;
    minus[param] -= h;
    (img_from_normalized_with(camera.model, &plus, n)
        - img_from_normalized_with(camera.model, &minus, n))
        / (2.0 * h)
}

fn state_norm(state: &State) -> f64 {
    let poses = state
        .poses
        .values()
        .map(|p| p.translation.length_squared() + 1.0)
        .sum::<f64>();
    let params = state
        .params
        .values()
        .flatten()
        .map(|p| p * p)
        .sum::<f64>();
    let points = state.points.iter().map(|p| p.length_squared()).sum::<f64>();
    (poses + params + points).sqrt()
}

/// Levenberg-Marquardt bundle adjuster.
#[derive(Debug, Clone, Default)]
pub struct BundleAdjuster {
    /// Solver options.
    pub options: BundleAdjustmentOptions,
}

impl BundleAdjuster {
    /// Create an adjuster with the given options.
    pub fn new(options: BundleAdjustmentOptions) -> Self {
        Self { options }
    }

    fn build_problem<'a>(
        &self,
        reconstruction: &'a Reconstruction,
        config: &BundleAdjustmentConfig,
    ) -> Problem<'a> {
        let mut residuals: BTreeMap<Point3DId, Vec<Residual>> = BTreeMap::new();

        for &image_id in &config.image_ids {
            let Ok(image) = reconstruction.image(image_id) else {
                continue;
            };
            if !image.is_registered() {
                continue;
            }
            for p in &image.points2d {
                if let Some(point3d_id) = p.point3d_id {
                    residuals
                        .entry(point3d_id)
                        .or_default()
                        .push(Residual { image_id, xy: p.xy });
                }
            }
        }
        // observations of variable points outside the image set
        let outside = residuals
            .keys()
            .copied()
            .filter(|id| !config.constant_points.contains(id))
            .chain(config.variable_points.iter().copied())
            .collect::<BTreeSet<_>>();
        for point3d_id in outside {
            let Ok(point) = reconstruction.point3d(point3d_id) else {
                continue;
            };
            for obs in &point.track {
                if config.image_ids.contains(&obs.image_id) {
                    continue;
                }
                if let Ok(image) = reconstruction.image(obs.image_id) {
                    if let Some(p) = image.points2d.get(obs.point2d_idx as usize) {
                        residuals.entry(point3d_id).or_default().push(Residual {
                            image_id: obs.image_id,
                            xy: p.xy,
                        });
                    }
                }
            }
        }

        let mut camera_of = BTreeMap::new();
        let mut groups = Vec::with_capacity(residuals.len());
        for (point3d_id, list) in residuals {
            let Ok(point) = reconstruction.point3d(point3d_id) else {
                continue;
            };
            // drop residuals that cannot be evaluated at the start
            let mut kept = Vec::with_capacity(list.len());
            for res in list {
                let Ok(image) = reconstruction.image(res.image_id) else {
                    continue;
                };
                let visible = reconstruction
                    .camera(image.camera_id)
                    .is_ok_and(|c| c.project(image.pose.transform_point(point.xyz)).is_some());
                if visible {
                    camera_of.insert(res.image_id, image.camera_id);
                    kept.push(res);
                }
            }
            let list = kept;
            if list.is_empty() {
                continue;
            }
            groups.push(PointResiduals {
                point3d_id,
                variable: !config.constant_points.contains(&point3d_id),
                residuals: list,
            });
        }

        let mut layout = Layout::default();
        for &image_id in &config.image_ids {
            if config.constant_poses.contains(&image_id) || !camera_of.contains_key(&image_id) {
                continue;
            }
            let fixed_axis = config.constant_translation_axis.get(&image_id).map(|a| a + 3);
            let cols = (0..6)
                .filter(|&local| Some(local) != fixed_axis)
                .map(|local| {
                    layout.num_params += 1;
                    (local, layout.num_params - 1)
                })
                .collect();
            layout.poses.insert(image_id, cols);
        }
        let variable_cameras = config
            .image_ids
            .iter()
            .filter_map(|id| camera_of.get(id))
            .copied()
            .filter(|id| !config.constant_cameras.contains(id))
            .collect::<BTreeSet<_>>();
        for camera_id in variable_cameras {
            let Ok(camera) = reconstruction.camera(camera_id) else {
                continue;
            };
            let idxs = camera.refinable_param_idxs(
                self.options.refine_focal_length,
                self.options.refine_extra_params,
            );
            if idxs.is_empty() {
                continue;
            }
            let cols = idxs
                .into_iter()
                .map(|param| {
                    layout.num_params += 1;
                    (param, layout.num_params - 1)
                })
                .collect();
            layout.cameras.insert(camera_id, cols);
        }

        Problem {
            reconstruction,
            camera_of,
            groups,
            layout,
            loss: self.options.loss,
        }
    }

    /// Adjust the reconstruction in place.
    ///
    /// On error the reconstruction is left untouched.
    pub fn solve(
        &self,
        reconstruction: &mut Reconstruction,
        config: &BundleAdjustmentConfig,
    ) -> Result<BundleAdjustmentSummary, BundleAdjustmentError> {
        let options = &self.options;
        if !options.loss.is_valid() {
            return Err(BundleAdjustmentError::InvalidLoss(options.loss));
        }

        let (state, summary, problem_points) = {
            let problem = self.build_problem(reconstruction, config);
            let num_point_params = 3 * problem.groups.iter().filter(|g| g.variable).count();
            let num_parameters = problem.layout.num_params + num_point_params;
            if problem.groups.is_empty() || num_parameters == 0 {
                return Err(BundleAdjustmentError::EmptyProblem);
            }

            let mut state = State {
                poses: problem
                    .camera_of
                    .keys()
                    .filter_map(|id| Some((*id, reconstruction.image(*id).ok()?.pose)))
                    .collect(),
                params: reconstruction
                    .cameras()
                    .iter()
                    .map(|(id, c)| (*id, c.params().to_vec()))
                    .collect(),
                points: problem
                    .groups
                    .iter()
                    .map(|g| reconstruction.point3d(g.point3d_id).map(|p| p.xyz))
                    .collect::<Result<_, _>>()
                    .map_err(|_| BundleAdjustmentError::EmptyProblem)?,
            };

            let initial_cost = problem.cost(&state);
            if !initial_cost.is_finite() {
                return Err(BundleAdjustmentError::NumericFailure("non-finite initial cost"));
            }
            let mut cost = initial_cost;
            let mut lambda = options.initial_lambda;
            let mut num_iterations = 0;
            let mut termination = None;

            while num_iterations < options.max_iterations {
                num_iterations += 1;
                let blocks = problem
                    .linearize(&state)
                    .ok_or(BundleAdjustmentError::NumericFailure("point behind camera"))?;
                let eq = NormalEquations::assemble(&blocks, problem.layout.num_params);
                if !eq.is_finite() {
                    return Err(BundleAdjustmentError::NumericFailure("non-finite normal equations"));
                }
                if eq.gradient_max_norm() < options.gradient_tolerance {
                    termination = Some(TerminationReason::GradientConverged);
                    break;
                }

                let mut accepted = false;
                let mut solved_once = false;
                while lambda <= options.max_lambda {
                    let Some((dc, dp)) = eq.solve(lambda) else {
                        lambda *= options.lambda_factor;
                        continue;
                    };
                    solved_once = true;
                    let step_norm = (dc.iter().map(|d| d * d).sum::<f64>()
                        + dp.iter().map(|d| d.length_squared()).sum::<f64>())
                    .sqrt();
                    if step_norm
                        <= options.parameter_tolerance
                            * (state_norm(&state) + options.parameter_tolerance)
                    {
                        termination = Some(TerminationReason::ParameterConverged);
                        break;
                    }
                    let candidate = problem.apply(&state, &dc, &dp);
                    let new_cost = candidate
                        .as_ref()
                        .map_or(f64::INFINITY, |c| problem.cost(c));
                    if let (Some(candidate), true) = (candidate, new_cost < cost) {
                        let decrease = (cost - new_cost) / cost.max(f64::EPSILON);
                        debug!(
                            "bundle adjustment iteration {num_iterations}: cost {cost:.6e} -> {new_cost:.6e}, lambda {lambda:.1e}"
                        );
                        state = candidate;
                        cost = new_cost;
                        lambda = (lambda / options.lambda_factor).max(1e-12);
                        accepted = true;
                        if decrease < options.function_tolerance {
                            termination = Some(TerminationReason::FunctionConverged);
                        }
                        break;
                    }
                    lambda *= options.lambda_factor;
                }
                if termination.is_some() {
                    break;
                }
                if !accepted {
                    if !solved_once {
                        return Err(BundleAdjustmentError::NumericFailure("singular system"));
                    }
                    termination = Some(TerminationReason::LambdaMaxExceeded);
                    break;
                }
            }

            let Some(termination) = termination else {
                return Err(BundleAdjustmentError::NoConvergence {
                    iterations: num_iterations,
                    initial_cost,
                    final_cost: cost,
                });
            };
            let summary = BundleAdjustmentSummary {
                initial_cost,
                final_cost: cost,
                num_iterations,
                num_residuals: problem.num_residuals(),
                num_parameters,
                termination,
            };
            let points = problem
                .groups
                .iter()
                .map(|g| (g.point3d_id, g.variable))
                .collect::<Vec<_>>();
            let camera_ids = problem.layout.cameras.keys().copied().collect::<Vec<_>>();
            let image_ids = problem.layout.poses.keys().copied().collect::<Vec<_>>();
            (state, summary, (points, camera_ids, image_ids))
        };

        let (points, camera_ids, image_ids) = problem_points;
        for image_id in image_ids {
            if let Some(pose) = state.poses.get(&image_id) {
                reconstruction
                    .set_pose(image_id, *pose)
                    .map_err(|_| BundleAdjustmentError::EmptyProblem)?;
            }
        }
        for camera_id in camera_ids {
            if let (Some(params), Ok(camera)) =
                (state.params.get(&camera_id), reconstruction.camera_mut(camera_id))
            {
                camera
                    .set_params(params.clone())
                    .map_err(|_| BundleAdjustmentError::NumericFailure("invalid intrinsics"))?;
            }
        }
        let mut touched = Vec::with_capacity(points.len());
        for ((point3d_id, variable), xyz) in points.into_iter().zip(state.points) {
            if variable {
                reconstruction
                    .set_point_xyz(point3d_id, xyz)
                    .map_err(|_| BundleAdjustmentError::EmptyProblem)?;
            }
            touched.push(point3d_id);
        }
        reconstruction.update_point_errors(Some(&touched));

        debug!(
            "bundle adjustment: {} residuals, {} parameters, cost {:.6e} -> {:.6e} in {} iterations ({:?})",
            summary.num_residuals,
            summary.num_parameters,
            summary.initial_cost,
            summary.final_cost,
            summary.num_iterations,
            summary.termination
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModelId;
    use crate::reconstruction::Image;
    use crate::types::Observation;
    use glam::DQuat;

    fn scene_points() -> Vec<DVec3> {
        (0..40)
            .map(|i| {
                DVec3::new(
                    ((i * 37) % 61) as f64 / 10.0 - 3.0,
                    ((i * 53) % 47) as f64 / 8.0 - 3.0,
                    8.0 + ((i * 17) % 41) as f64 / 10.0,
                )
            })
            .collect()
    }

    // three images observing every point, keypoints at the exact projections
    // except for an optional offset on keypoint 0 of image 3
    fn three_view(
        camera: &Camera,
        outlier: Option<DVec2>,
    ) -> Result<Reconstruction, Box<dyn std::error::Error>> {
        let points = scene_points();
        let poses = [
            Rigid3::IDENTITY,
            Rigid3::new(DQuat::from_rotation_y(-0.05), DVec3::new(-1.0, 0.0, 0.0)),
            Rigid3::new(DQuat::from_rotation_y(0.04), DVec3::new(1.0, 0.2, 0.1)),
        ];
        let mut rec = Reconstruction::new();
        rec.add_camera(camera.clone());
        for (k, pose) in poses.iter().enumerate() {
            let id = k as ImageId + 1;
            let keypoints = points
                .iter()
                .map(|p| camera.project(pose.transform_point(*p)).ok_or("behind camera"))
                .collect::<Result<Vec<_>, _>>()?;
            let mut keypoints = keypoints;
            if let (3, Some(offset)) = (id, outlier) {
                keypoints[0] += offset;
            }
            rec.add_image(Image::new(id, format!("{id}.png"), camera.camera_id, keypoints))?;
            rec.register_image(id, *pose)?;
        }
        for (i, p) in points.iter().enumerate() {
            let track = (1..=3).map(|id| Observation::new(id, i as u32)).collect();
            rec.add_point3d(*p, track, [0; 3], None)?;
        }
        Ok(rec)
    }

    fn pinhole() -> Result<Camera, Box<dyn std::error::Error>> {
        Ok(Camera::new(
            1,
            CameraModelId::Pinhole,
            640,
            480,
            vec![500.0, 500.0, 320.0, 240.0],
        )?)
    }

    #[test]
    fn test_recovers_perturbed_points_and_pose() -> Result<(), Box<dyn std::error::Error>> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut rec = three_view(&pinhole()?, None)?;
        let truth = rec.clone();

        let ids = rec.points3d().keys().copied().collect::<Vec<_>>();
        for (k, id) in ids.iter().enumerate() {
            let xyz = rec.point3d(*id)?.xyz;
            let offset = DVec3::new(0.02, -0.015, 0.03) * if k % 2 == 0 { 1.0 } else { -1.0 };
            rec.set_point_xyz(*id, xyz + offset)?;
        }
        let pose3 = rec.image(3)?.pose;
        rec.set_pose(3, pose3.perturbed(DVec3::new(0.002, -0.001, 0.0), DVec3::new(0.01, 0.0, -0.02)))?;

        let mut config = BundleAdjustmentConfig::from_images([1, 2, 3]);
        config.fix_gauge(&rec);
        assert!(config.constant_poses.contains(&1));
        assert_eq!(config.constant_translation_axis.get(&2), Some(&0));

        let summary = BundleAdjuster::default().solve(&mut rec, &config)?;
        assert!(summary.final_cost <= summary.initial_cost);
        assert!(summary.final_cost < 1e-8);
        assert_eq!(summary.num_residuals, 120);

        // the gauge is fixed by image 1 and the x translation of image 2
        assert_eq!(rec.image(1)?.pose, truth.image(1)?.pose);
        approx::assert_relative_eq!(
            rec.image(2)?.pose.translation.x,
            truth.image(2)?.pose.translation.x,
            epsilon = 1e-12
        );
        for id in ids {
            let diff = (rec.point3d(id)?.xyz - truth.point3d(id)?.xyz).length();
            assert!(diff < 1e-4, "point {id} off by {diff}");
        }
        assert!(rec.stats().mean_reprojection_error < 1e-4);
        Ok(())
    }

    #[test]
    fn test_refines_focal_length() -> Result<(), Box<dyn std::error::Error>> {
        let camera = Camera::new(1, CameraModelId::SimpleRadial, 640, 480, vec![500.0, 320.0, 240.0, 0.0])?;
        let mut rec = three_view(&camera, None)?;
        rec.camera_mut(1)?.set_params(vec![520.0, 320.0, 240.0, 0.0])?;

        let mut config = BundleAdjustmentConfig::from_images([1, 2, 3]);
        config.fix_gauge(&rec);
        let adjuster = BundleAdjuster::new(BundleAdjustmentOptions {
            refine_focal_length: true,
            refine_extra_params: true,
            ..Default::default()
        });
        let summary = adjuster.solve(&mut rec, &config)?;
        assert!(summary.final_cost < summary.initial_cost);
        // principal point stays fixed
        let params = rec.camera(1)?.params();
        assert_eq!(params[1], 320.0);
        assert_eq!(params[2], 240.0);
        Ok(())
    }

    #[test]
    fn test_constant_everything_is_empty() -> Result<(), Box<dyn std::error::Error>> {
        let mut rec = three_view(&pinhole()?, None)?;
        let mut config = BundleAdjustmentConfig::from_images([1, 2, 3]);
        config.constant_poses.extend([1, 2, 3]);
        config.constant_points.extend(rec.points3d().keys().copied());
        let res = BundleAdjuster::default().solve(&mut rec, &config);
        assert!(matches!(res, Err(BundleAdjustmentError::EmptyProblem)));
        Ok(())
    }

    #[test]
    fn test_iteration_budget_leaves_state_untouched() -> Result<(), Box<dyn std::error::Error>> {
        let mut rec = three_view(&pinhole()?, None)?;
        let ids = rec.points3d().keys().copied().collect::<Vec<_>>();
        for id in &ids {
            let xyz = rec.point3d(*id)?.xyz;
            rec.set_point_xyz(*id, xyz + DVec3::new(0.3, -0.2, 0.5))?;
        }
        let before = rec.points3d().clone();
        let mut config = BundleAdjustmentConfig::from_images([1, 2, 3]);
        config.fix_gauge(&rec);
        let adjuster = BundleAdjuster::new(BundleAdjustmentOptions {
            max_iterations: 1,
            function_tolerance: 0.0,
            ..Default::default()
        });
        let res = adjuster.solve(&mut rec, &config);
        assert!(matches!(res, Err(BundleAdjustmentError::NoConvergence { iterations: 1, .. })));
        assert_eq!(rec.points3d(), &before);
        Ok(())
    }

    #[test]
    fn test_robust_loss_cost_never_increases() -> Result<(), Box<dyn std::error::Error>> {
        let mut rec = three_view(&pinhole()?, Some(DVec2::new(25.0, -30.0)))?;
        let mut config = BundleAdjustmentConfig::from_images([1, 2, 3]);
        config.fix_gauge(&rec);
        let adjuster = BundleAdjuster::new(BundleAdjustmentOptions {
            loss: LossFunction::Cauchy { scale: 1.0 },
            ..Default::default()
        });
        let summary = adjuster.solve(&mut rec, &config)?;
        assert!(summary.final_cost <= summary.initial_cost);
        Ok(())
    }
}
