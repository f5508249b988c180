//! Incremental reconstruction driven by an explicit state machine.
//!
//! A mapper starts `Empty`, becomes `Seeded` once a two-view model has been
//! triangulated, stays `Growing` while images can be registered, and ends
//! `Converged` when nothing else registers or `Failed` when no seed pair works.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::bundle_adjustment::{BundleAdjuster, BundleAdjustmentConfig, BundleAdjustmentOptions};
use crate::camera::Camera;
use crate::features::FeatureStore;
use crate::filter::{filter, filter_points};
use crate::geometry::{has_positive_depth, triangulate_multiview, triangulation_angle, TwoViewGeometry};
use crate::pnp::{estimate_absolute_pose, AbsolutePoseOptions};
use crate::pose::Rigid3;
use crate::reconstruction::{Image, Reconstruction, ReconstructionError};
use crate::tracks::TrackSet;
use crate::types::{CameraId, ImageId, ImageInfo, Observation, Point3DId, TrackId};
use crate::view_graph::{ImagePair, ViewGraph};

/// Error types for incremental mapping.
#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    /// No image pair satisfies the seeding criteria.
    #[error("no valid initial image pair")]
    NoInitialPair,

    /// Reconstruction state error.
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
}

/// Lifecycle of one mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapperState {
    /// Nothing reconstructed yet.
    Empty,
    /// A two-view model exists.
    Seeded,
    /// At least one image was registered after seeding.
    Growing,
    /// No further image can be registered.
    Converged,
    /// No seed pair could be reconstructed.
    Failed,
}

/// Options of the incremental mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperOptions {
    /// Minimum number of 2D-3D correspondences to attempt a registration.
    pub min_num_correspondences: usize,
    /// Minimum number of verified inliers of a seed pair.
    pub init_min_num_inliers: usize,
    /// Minimum median triangulation angle of a seed pair, in degrees.
    pub init_min_tri_angle_deg: f64,
    /// Minimum number of points surviving seeding.
    pub init_min_num_points: usize,
    /// Reprojection error threshold for observations, in pixels.
    pub max_reproj_error_px: f64,
    /// Minimum triangulation angle of a point, in degrees.
    pub min_tri_angle_deg: f64,
    /// Absolute pose estimation options.
    pub abs_pose: AbsolutePoseOptions,
    /// Failed registration attempts before an image is given up.
    pub max_registration_trials: usize,
    /// Number of images in a local bundle adjustment, including the new one.
    pub local_ba_num_images: usize,
    /// Registrations between two global bundle adjustments.
    pub global_ba_interval: usize,
    /// Bound on the number of mapper steps.
    pub max_registration_steps: usize,
    /// Wall-clock bound for the whole mapping run.
    pub max_runtime_secs: Option<f64>,
    /// Models with fewer registered images are discarded.
    pub min_model_size: usize,
    /// Start new models from unregistered images after a model converges.
    pub multiple_models: bool,
    /// Maximum number of models.
    pub max_num_models: usize,
    /// Local bundle adjustment options.
    pub local_ba: BundleAdjustmentOptions,
    /// Global bundle adjustment options.
    pub global_ba: BundleAdjustmentOptions,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            min_num_correspondences: 15,
            init_min_num_inliers: 100,
            init_min_tri_angle_deg: 4.0,
            init_min_num_points: 30,
            max_reproj_error_px: 4.0,
            min_tri_angle_deg: 1.5,
            abs_pose: AbsolutePoseOptions::default(),
            max_registration_trials: 3,
            local_ba_num_images: 6,
            global_ba_interval: 5,
            max_registration_steps: 10_000,
            max_runtime_secs: None,
            min_model_size: 2,
            multiple_models: true,
            max_num_models: 50,
            local_ba: BundleAdjustmentOptions {
                max_iterations: 25,
                ..Default::default()
            },
            global_ba: BundleAdjustmentOptions::default(),
        }
    }
}

/// Everything the mapper reads; none of it is modified.
#[derive(Debug, Clone, Copy)]
pub struct MappingInputs<'a> {
    /// Cameras by id.
    pub cameras: &'a BTreeMap<CameraId, Camera>,
    /// Image reference data by id.
    pub images: &'a BTreeMap<ImageId, ImageInfo>,
    /// Keypoints of the images.
    pub features: &'a FeatureStore,
    /// Verified image pairs.
    pub view_graph: &'a ViewGraph,
    /// Correspondence tracks.
    pub tracks: &'a TrackSet,
}

/// Ranked models of a mapping run.
#[derive(Debug, Clone, Default)]
pub struct MappingReport {
    /// Models sorted by registered images, then points, largest first.
    pub models: Vec<Reconstruction>,
    /// Whether a budget ended the run early.
    pub partial: bool,
}

/// Grows a single model.
pub struct IncrementalMapper<'a> {
    inputs: MappingInputs<'a>,
    options: MapperOptions,
    reconstruction: Reconstruction,
    state: MapperState,
    // registered in earlier models
    excluded: BTreeSet<ImageId>,
    // given up for this run
    failed: BTreeSet<ImageId>,
    // waiting for another registration before being retried
    deferred: BTreeSet<ImageId>,
    num_trials: BTreeMap<ImageId, usize>,
    track_points: HashMap<TrackId, Point3DId>,
    num_steps: usize,
    registrations_since_global_ba: usize,
    started: Instant,
    partial: bool,
}

impl<'a> IncrementalMapper<'a> {
    /// Create a mapper; images in `excluded` are never used.
    pub fn new(
        inputs: MappingInputs<'a>,
        options: MapperOptions,
        excluded: BTreeSet<ImageId>,
    ) -> Self {
        Self {
            reconstruction: empty_reconstruction(&inputs),
            inputs,
            options,
            state: MapperState::Empty,
            excluded,
            failed: BTreeSet::new(),
            deferred: BTreeSet::new(),
            num_trials: BTreeMap::new(),
            track_points: HashMap::new(),
            num_steps: 0,
            registrations_since_global_ba: 0,
            started: Instant::now(),
            partial: false,
        }
    }

    fn with_start(mut self, started: Instant) -> Self {
        self.started = started;
        self
    }

    /// Current state.
    pub fn state(&self) -> MapperState {
        self.state
    }

    /// The model built so far.
    pub fn reconstruction(&self) -> &Reconstruction {
        &self.reconstruction
    }

    /// Consume the mapper, returning its model.
    pub fn into_reconstruction(self) -> Reconstruction {
        self.reconstruction
    }

    /// Whether a budget ended the run.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Images given up during this run.
    pub fn failed_images(&self) -> &BTreeSet<ImageId> {
        &self.failed
    }

    fn budget_exhausted(&self) -> bool {
        if self.num_steps >= self.options.max_registration_steps {
            return true;
        }
        self.options
            .max_runtime_secs
            .is_some_and(|secs| self.started.elapsed() >= Duration::from_secs_f64(secs.max(0.0)))
    }

    /// Advance the state machine by one transition.
    pub fn step(&mut self) -> MapperState {
        self.state = match self.state {
            MapperState::Empty => self.seed(),
            MapperState::Seeded | MapperState::Growing => {
                if self.budget_exhausted() {
                    warn!("mapping budget exhausted after {} steps", self.num_steps);
                    self.partial = true;
                    self.finish()
                } else {
                    self.num_steps += 1;
                    self.register_next()
                }
            }
            done => done,
        };
        self.state
    }

    /// Step until the mapper converges or fails.
    pub fn run(&mut self) -> MapperState {
        while !matches!(self.state, MapperState::Converged | MapperState::Failed) {
            self.step();
        }
        self.state
    }

    fn is_available(&self, image_id: ImageId) -> bool {
        !self.excluded.contains(&image_id)
            && !self.failed.contains(&image_id)
            && self.inputs.images.contains_key(&image_id)
            && self.inputs.features.contains(image_id)
    }

    /// Try seed pairs in decreasing inlier order.
    pub fn seed(&mut self) -> MapperState {
        let view_graph = self.inputs.view_graph;
        for (pair, geometry) in view_graph.calibrated_pairs_by_inliers() {
            if !self.is_available(pair.image_id1) || !self.is_available(pair.image_id2) {
                continue;
            }
            if geometry.num_inliers() < self.options.init_min_num_inliers
                || geometry.tri_angle_deg < self.options.init_min_tri_angle_deg
            {
                continue;
            }
            match self.try_seed(pair, geometry) {
                Ok(true) => {
                    info!(
                        "seeded with images ({}, {}): {} points",
                        pair.image_id1,
                        pair.image_id2,
                        self.reconstruction.num_points3d()
                    );
                    return MapperState::Seeded;
                }
                Ok(false) => {}
                Err(err) => warn!("seeding with ({}, {}) failed: {err}", pair.image_id1, pair.image_id2),
            }
            self.reconstruction = empty_reconstruction(&self.inputs);
            self.track_points.clear();
        }
        info!("no valid seed pair");
        MapperState::Failed
    }

    fn try_seed(&mut self, pair: ImagePair, geometry: &TwoViewGeometry) -> Result<bool, MapperError> {
        let Some(relative_pose) = geometry.relative_pose else {
            return Ok(false);
        };
        self.reconstruction.register_image(pair.image_id1, Rigid3::IDENTITY)?;
        self.reconstruction.register_image(pair.image_id2, relative_pose)?;

        let tracks = self.inputs.tracks;
        for &(_, track_id) in tracks.image_observations(pair.image_id1) {
            let Some(track) = tracks.get(track_id) else {
                continue;
            };
            if track.point2d_idx_in(pair.image_id2).is_some() {
                self.triangulate_track(track_id)?;
            }
        }
        debug!("seed ({}, {}): {} points before adjustment", pair.image_id1, pair.image_id2, self.reconstruction.num_points3d());
        if self.reconstruction.num_points3d() < self.options.init_min_num_points {
            return Ok(false);
        }

        self.global_adjustment();
        if self.reconstruction.num_points3d() < self.options.init_min_num_points {
            return Ok(false);
        }
        Ok(true)
    }

    fn color(&self, track: &[Observation]) -> [u8; 3] {
        let values = track
            .iter()
            .filter_map(|obs| {
                let features = self.inputs.features.get(obs.image_id)?;
                features.keypoints.get(obs.point2d_idx as usize).map(|k| k.intensity as u32)
            })
            .collect::<Vec<_>>();
        if values.is_empty() {
            return [0; 3];
        }
        let gray = (values.iter().sum::<u32>() / values.len() as u32) as u8;
        [gray; 3]
    }

    // Point of a track if it still exists.
    fn track_point(&self, track_id: TrackId) -> Option<Point3DId> {
        let point3d_id = *self.track_points.get(&track_id)?;
        self.reconstruction
            .point3d(point3d_id)
            .is_ok_and(|p| p.track_id == Some(track_id))
            .then_some(point3d_id)
    }

    /// Triangulate a track from its observations in registered images.
    ///
    /// Returns the new point, or `None` when the track has no valid point yet.
    fn triangulate_track(&mut self, track_id: TrackId) -> Result<Option<Point3DId>, MapperError> {
        if self.track_point(track_id).is_some() {
            return Ok(None);
        }
        let Some(track) = self.inputs.tracks.get(track_id) else {
            return Ok(None);
        };
        let mut candidates = Vec::new();
        for obs in &track.observations {
            if !self.reconstruction.is_registered(obs.image_id) {
                continue;
            }
            let Ok(image) = self.reconstruction.image(obs.image_id) else {
                continue;
            };
            let Some(point2d) = image.points2d.get(obs.point2d_idx as usize) else {
                continue;
            };
            if point2d.point3d_id.is_some() {
                continue;
            }
            let camera = self.reconstruction.camera(image.camera_id)?;
            candidates.push((*obs, image.pose, camera.normalized_from_img(point2d.xy)));
        }
        if candidates.len() < 2 {
            return Ok(None);
        }

        let views = candidates.iter().map(|(_, pose, x)| (*pose, *x)).collect::<Vec<_>>();
        let Some(xyz) = triangulate_multiview(&views) else {
            return Ok(None);
        };
        let inliers = candidates
            .iter()
            .filter(|(obs, pose, _)| {
                has_positive_depth(pose, xyz)
                    && self
                        .reconstruction
                        .reprojection_error(xyz, obs)
                        .is_some_and(|e| e <= self.options.max_reproj_error_px)
            })
            .collect::<Vec<_>>();
        if inliers.len() < 2 {
            return Ok(None);
        }
        let min_angle = self.options.min_tri_angle_deg.to_radians();
        let mut max_angle = 0.0f64;
        for (i, (_, p1, _)) in inliers.iter().enumerate() {
            for (_, p2, _) in &inliers[i + 1..] {
                max_angle = max_angle.max(triangulation_angle(p1.center(), p2.center(), xyz));
            }
        }
        if max_angle < min_angle {
            return Ok(None);
        }

        let observations = inliers.iter().map(|(obs, _, _)| *obs).collect::<Vec<_>>();
        let color = self.color(&observations);
        let point3d_id = self
            .reconstruction
            .add_point3d(xyz, observations, color, Some(track_id))?;
        self.track_points.insert(track_id, point3d_id);
        Ok(Some(point3d_id))
    }

    // Add free observations of the track in registered images that reproject well.
    fn complete_track(&mut self, track_id: TrackId, point3d_id: Point3DId) -> Result<usize, MapperError> {
        let Some(track) = self.inputs.tracks.get(track_id) else {
            return Ok(0);
        };
        let xyz = self.reconstruction.point3d(point3d_id)?.xyz;
        let mut num_added = 0;
        for obs in &track.observations {
            if !self.reconstruction.is_registered(obs.image_id) {
                continue;
            }
            let point = self.reconstruction.point3d(point3d_id)?;
            if point.track.iter().any(|o| o.image_id == obs.image_id) {
                continue;
            }
            let free = self
                .reconstruction
                .image(obs.image_id)?
                .points2d
                .get(obs.point2d_idx as usize)
                .is_some_and(|p| p.point3d_id.is_none());
            let good = self
                .reconstruction
                .reprojection_error(xyz, obs)
                .is_some_and(|e| e <= self.options.max_reproj_error_px);
            if free && good {
                self.reconstruction.add_observation(point3d_id, *obs)?;
                num_added += 1;
            }
        }
        Ok(num_added)
    }

    // Triangulated points visible in an unregistered image, by keypoint.
    fn correspondences(&self, image_id: ImageId) -> Vec<(u32, TrackId, Point3DId)> {
        self.inputs
            .tracks
            .image_observations(image_id)
            .iter()
            .filter_map(|&(idx, track_id)| Some((idx, track_id, self.track_point(track_id)?)))
            .collect()
    }

    /// Unregistered images ordered by number of triangulated correspondences.
    pub fn next_images(&self) -> Vec<(ImageId, usize)> {
        let mut candidates = self
            .inputs
            .images
            .keys()
            .copied()
            .filter(|&id| {
                self.is_available(id)
                    && !self.deferred.contains(&id)
                    && !self.reconstruction.is_registered(id)
            })
            .map(|id| (id, self.correspondences(id).len()))
            .filter(|&(_, n)| n >= self.options.min_num_correspondences)
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        candidates
    }

    /// Register the best candidate image, or finish when none registers.
    pub fn register_next(&mut self) -> MapperState {
        let candidates = self.next_images();
        for (image_id, num_correspondences) in candidates {
            match self.try_register(image_id) {
                Ok(true) => {
                    info!(
                        "registered image {image_id} ({num_correspondences} correspondences), {} images, {} points",
                        self.reconstruction.num_registered_images(),
                        self.reconstruction.num_points3d()
                    );
                    self.deferred.clear();
                    self.after_registration(image_id);
                    return MapperState::Growing;
                }
                Ok(false) => {}
                Err(err) => warn!("registration of image {image_id} failed: {err}"),
            }
            let trials = self.num_trials.entry(image_id).or_default();
            *trials += 1;
            if *trials >= self.options.max_registration_trials {
                debug!("giving up image {image_id} after {trials} trials");
                self.failed.insert(image_id);
            } else {
                self.deferred.insert(image_id);
            }
        }
        // a full pass registered nothing
        if !self.deferred.is_empty() {
            debug!("giving up {} deferred images", self.deferred.len());
            self.failed.append(&mut self.deferred);
        }
        self.finish()
    }

    fn try_register(&mut self, image_id: ImageId) -> Result<bool, MapperError> {
        let correspondences = self.correspondences(image_id);
        let camera = self.reconstruction.image_camera(image_id)?.clone();
        let image = self.reconstruction.image(image_id)?;
        let mut world = Vec::with_capacity(correspondences.len());
        let mut pixels = Vec::with_capacity(correspondences.len());
        for &(idx, _, point3d_id) in &correspondences {
            let Some(p) = image.points2d.get(idx as usize) else {
                continue;
            };
            world.push(self.reconstruction.point3d(point3d_id)?.xyz);
            pixels.push(p.xy);
        }
        if world.len() != correspondences.len() {
            return Ok(false);
        }

        let report = match estimate_absolute_pose(&camera, &world, &pixels, &self.options.abs_pose) {
            Ok(report) => report,
            Err(err) => {
                debug!("image {image_id}: pose estimation failed: {err}");
                return Ok(false);
            }
        };
        if report.num_inliers < self.options.min_num_correspondences {
            debug!("image {image_id}: only {} pose inliers", report.num_inliers);
            return Ok(false);
        }

        let num_new = self.register_with_pose(image_id, report.pose, &correspondences, &report.inliers)?;
        debug!("image {image_id}: {} pose inliers, {num_new} new points", report.num_inliers);
        Ok(true)
    }

    // Register the image and attach its observations; the registration is
    // undone when any of it fails.
    fn register_with_pose(
        &mut self,
        image_id: ImageId,
        pose: Rigid3,
        correspondences: &[(u32, TrackId, Point3DId)],
        inliers: &[bool],
    ) -> Result<usize, MapperError> {
        self.reconstruction.register_image(image_id, pose)?;
        match self.attach_observations(image_id, correspondences, inliers) {
            Ok(num_new) => Ok(num_new),
            Err(err) => {
                self.reconstruction.deregister_image(image_id)?;
                Err(err)
            }
        }
    }

    fn attach_observations(
        &mut self,
        image_id: ImageId,
        correspondences: &[(u32, TrackId, Point3DId)],
        inliers: &[bool],
    ) -> Result<usize, MapperError> {
        for (&(idx, track_id, point3d_id), &inlier) in correspondences.iter().zip(inliers) {
            if !inlier {
                continue;
            }
            let obs = Observation::new(image_id, idx);
            let good = self
                .reconstruction
                .reprojection_error(self.reconstruction.point3d(point3d_id)?.xyz, &obs)
                .is_some_and(|e| e <= self.options.max_reproj_error_px);
            let already = self
                .reconstruction
                .point3d(point3d_id)?
                .track
                .iter()
                .any(|o| o.image_id == image_id);
            if good && !already {
                self.reconstruction.add_observation(point3d_id, obs)?;
                self.complete_track(track_id, point3d_id)?;
            }
        }

        let tracks = self.inputs.tracks;
        let mut num_new = 0;
        for &(_, track_id) in tracks.image_observations(image_id) {
            if self.triangulate_track(track_id)?.is_some() {
                num_new += 1;
            }
        }
        Ok(num_new)
    }

    // Images sharing the most points with `image_id`, including itself.
    fn local_images(&self, image_id: ImageId) -> BTreeSet<ImageId> {
        let mut shared: BTreeMap<ImageId, usize> = BTreeMap::new();
        if let Ok(image) = self.reconstruction.image(image_id) {
            for point3d_id in image.points2d.iter().filter_map(|p| p.point3d_id) {
                if let Ok(point) = self.reconstruction.point3d(point3d_id) {
                    for obs in point.track.iter().filter(|o| o.image_id != image_id) {
                        *shared.entry(obs.image_id).or_default() += 1;
                    }
                }
            }
        }
        let mut ranked = shared.into_iter().collect::<Vec<_>>();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        std::iter::once(image_id)
            .chain(
                ranked
                    .into_iter()
                    .take(self.options.local_ba_num_images.saturating_sub(1))
                    .map(|(id, _)| id),
            )
            .collect()
    }

    fn after_registration(&mut self, image_id: ImageId) {
        let local = self.local_images(image_id);
        let mut config = BundleAdjustmentConfig::from_images(local.iter().copied());
        config.fix_gauge(&self.reconstruction);
        let adjuster = BundleAdjuster::new(self.options.local_ba.clone());
        if let Err(err) = adjuster.solve(&mut self.reconstruction, &config) {
            warn!("local bundle adjustment around image {image_id} failed: {err}");
        }

        let points = local
            .iter()
            .filter_map(|id| self.reconstruction.image(*id).ok())
            .flat_map(|image| image.points2d.iter().filter_map(|p| p.point3d_id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        filter_points(
            &mut self.reconstruction,
            &points,
            self.options.max_reproj_error_px,
            self.options.min_tri_angle_deg,
        );

        self.registrations_since_global_ba += 1;
        if self.registrations_since_global_ba >= self.options.global_ba_interval {
            self.global_adjustment();
        }
    }

    fn global_adjustment(&mut self) {
        self.registrations_since_global_ba = 0;
        if self.reconstruction.num_registered_images() < 2 {
            return;
        }
        let mut config =
            BundleAdjustmentConfig::from_images(self.reconstruction.registered_image_ids().iter().copied());
        config.fix_gauge(&self.reconstruction);
        let adjuster = BundleAdjuster::new(self.options.global_ba.clone());
        match adjuster.solve(&mut self.reconstruction, &config) {
            Ok(summary) => debug!(
                "global bundle adjustment: cost {:.4e} -> {:.4e}",
                summary.initial_cost, summary.final_cost
            ),
            Err(err) => warn!("global bundle adjustment failed: {err}"),
        }
        let removed = filter(
            &mut self.reconstruction,
            self.options.max_reproj_error_px,
            self.options.min_tri_angle_deg,
        );
        debug!("global filter removed {removed} observations");
    }

    /// Final global adjustment; the mapper is converged afterwards.
    pub fn finish(&mut self) -> MapperState {
        self.global_adjustment();
        let stats = self.reconstruction.stats();
        info!(
            "model converged: {} images, {} points, mean track length {:.2}, mean error {:.3} px",
            stats.num_registered_images,
            stats.num_points3d,
            stats.mean_track_length,
            stats.mean_reprojection_error
        );
        MapperState::Converged
    }
}

fn empty_reconstruction(inputs: &MappingInputs<'_>) -> Reconstruction {
    let mut reconstruction = Reconstruction::new();
    for camera in inputs.cameras.values() {
        reconstruction.add_camera(camera.clone());
    }
    for info in inputs.images.values() {
        let Some(features) = inputs.features.get(info.image_id) else {
            continue;
        };
        let image = Image::new(info.image_id, info.name.clone(), info.camera_id, features.positions());
        if let Err(err) = reconstruction.add_image(image) {
            warn!("skipping image {}: {err}", info.image_id);
        }
    }
    reconstruction
}

/// Reconstruct all models reachable from the inputs.
///
/// Each model is seeded from images not registered in any earlier model.
/// Fails only when not a single model could be seeded.
pub fn reconstruct(inputs: MappingInputs<'_>, options: &MapperOptions) -> Result<MappingReport, MapperError> {
    let started = Instant::now();
    let mut excluded = BTreeSet::new();
    let mut report = MappingReport::default();
    let mut num_seeded = 0;

    while num_seeded < options.max_num_models.max(1) {
        let mut mapper = IncrementalMapper::new(inputs, options.clone(), excluded.clone()).with_start(started);
        if mapper.run() == MapperState::Failed {
            break;
        }
        num_seeded += 1;
        let partial = mapper.is_partial();
        let model = mapper.into_reconstruction();
        let registered = model.registered_image_ids().to_vec();
        excluded.extend(registered.iter().copied());
        if registered.len() >= options.min_model_size {
            report.models.push(model);
        } else {
            debug!("discarding model with {} images", registered.len());
        }
        if partial {
            report.partial = true;
            break;
        }
        if !options.multiple_models {
            break;
        }
    }

    if num_seeded == 0 {
        return Err(MapperError::NoInitialPair);
    }
    report.models.sort_by(|a, b| {
        b.num_registered_images()
            .cmp(&a.num_registered_images())
            .then(b.num_points3d().cmp(&a.num_points3d()))
    });
    info!("mapping produced {} models", report.models.len());
    Ok(report)
}
