use std::collections::{BTreeMap, BTreeSet};

use glam::{DVec2, DVec3};

use crate::camera::Camera;
use crate::pose::Rigid3;
use crate::types::{CameraId, ImageId, Observation, Point3DId, TrackId};

/// Error types for reconstruction state changes.
#[derive(Debug, thiserror::Error)]
pub enum ReconstructionError {
    /// The camera is not part of the reconstruction.
    #[error("unknown camera {0}")]
    UnknownCamera(CameraId),

    /// The image is not part of the reconstruction.
    #[error("unknown image {0}")]
    UnknownImage(ImageId),

    /// The 3D point does not exist.
    #[error("unknown 3D point {0}")]
    UnknownPoint3D(Point3DId),

    /// The keypoint index is out of range for the image.
    #[error("image {image_id} has no keypoint {point2d_idx}")]
    InvalidPoint2D {
        /// Image id.
        image_id: ImageId,
        /// Keypoint index.
        point2d_idx: u32,
    },

    /// The keypoint already observes a 3D point.
    #[error("keypoint {point2d_idx} of image {image_id} already observes a 3D point")]
    Point2DAlreadyAssigned {
        /// Image id.
        image_id: ImageId,
        /// Keypoint index.
        point2d_idx: u32,
    },

    /// The 3D point already has an observation in the image.
    #[error("3D point already observed in image {0}")]
    DuplicateImageInTrack(ImageId),

    /// An image with the same id already exists.
    #[error("image {0} already exists")]
    DuplicateImage(ImageId),

    /// The image is not registered.
    #[error("image {0} is not registered")]
    ImageNotRegistered(ImageId),

    /// A 3D point needs at least two observations.
    #[error("a 3D point needs at least two observations, got {0}")]
    TooFewObservations(usize),
}

/// A keypoint of an image inside a reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point2D {
    /// Pixel position.
    pub xy: DVec2,
    /// The 3D point observed by this keypoint.
    pub point3d_id: Option<Point3DId>,
}

/// An image with its pose and keypoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Image id.
    pub image_id: ImageId,
    /// File name relative to the image directory.
    pub name: String,
    /// Camera of the image.
    pub camera_id: CameraId,
    /// World to camera pose; meaningful only when registered.
    pub pose: Rigid3,
    /// Keypoints with their 3D point assignment.
    pub points2d: Vec<Point2D>,
    registered: bool,
}

impl Image {
    /// Create an unregistered image from keypoint positions.
    pub fn new(
        image_id: ImageId,
        name: impl Into<String>,
        camera_id: CameraId,
        keypoints: impl IntoIterator<Item = DVec2>,
    ) -> Self {
        Self {
            image_id,
            name: name.into(),
            camera_id,
            pose: Rigid3::IDENTITY,
            points2d: keypoints
                .into_iter()
                .map(|xy| Point2D {
                    xy,
                    point3d_id: None,
                })
                .collect(),
            registered: false,
        }
    }

    /// Whether the image has a pose in the reconstruction.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Number of keypoints observing a 3D point.
    pub fn num_points3d(&self) -> usize {
        self.points2d.iter().filter(|p| p.point3d_id.is_some()).count()
    }
}

/// A triangulated scene point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point3D {
    /// Position in world coordinates.
    pub xyz: DVec3,
    /// RGB color.
    pub color: [u8; 3],
    /// Mean reprojection error in pixels over the track.
    pub error: f64,
    /// Observations, sorted by image id.
    pub track: Vec<Observation>,
    /// Correspondence track the point was triangulated from.
    pub track_id: Option<TrackId>,
}

/// Summary statistics of a reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReconstructionStats {
    /// Number of cameras.
    pub num_cameras: usize,
    /// Number of registered images.
    pub num_registered_images: usize,
    /// Number of 3D points.
    pub num_points3d: usize,
    /// Total number of observations.
    pub num_observations: usize,
    /// Mean number of observations per 3D point.
    pub mean_track_length: f64,
    /// Mean reprojection error in pixels.
    pub mean_reprojection_error: f64,
}

/// Registered images, cameras and 3D points of one model.
#[derive(Debug, Clone, Default)]
pub struct Reconstruction {
    cameras: BTreeMap<CameraId, Camera>,
    images: BTreeMap<ImageId, Image>,
    points3d: BTreeMap<Point3DId, Point3D>,
    registration_order: Vec<ImageId>,
    next_point3d_id: Point3DId,
}

impl Reconstruction {
    /// Create an empty reconstruction.
    pub fn new() -> Self {
        Self {
            next_point3d_id: 1,
            ..Default::default()
        }
    }

    /// Assemble a reconstruction from loaded parts, validating cross references.
    ///
    /// Images listed in `registration_order` are marked registered, and the
    /// keypoint assignments of the images are rebuilt from the point tracks.
    pub fn from_parts(
        cameras: impl IntoIterator<Item = Camera>,
        images: impl IntoIterator<Item = Image>,
        points3d: impl IntoIterator<Item = (Point3DId, Point3D)>,
        registration_order: Vec<ImageId>,
    ) -> Result<Self, ReconstructionError> {
        let mut rec = Self::new();
        for camera in cameras {
            rec.add_camera(camera);
        }
        for image in images {
            rec.add_image(image)?;
        }
        for image_id in registration_order {
            let pose = rec.image(image_id)?.pose;
            rec.register_image(image_id, pose)?;
        }
        for image in rec.images.values_mut() {
            for p in image.points2d.iter_mut() {
                p.point3d_id = None;
            }
        }
        for (id, mut point) in points3d {
            point.track.sort();
            rec.validate_track(&point.track)?;
            for obs in &point.track {
                rec.point2d_mut(obs)?.point3d_id = Some(id);
            }
            rec.next_point3d_id = rec.next_point3d_id.max(id + 1);
            rec.points3d.insert(id, point);
        }
        Ok(rec)
    }

    /// Add or replace a camera.
    pub fn add_camera(&mut self, camera: Camera) {
        self.cameras.insert(camera.camera_id, camera);
    }

    /// Add an unregistered image; its camera must already exist.
    pub fn add_image(&mut self, mut image: Image) -> Result<(), ReconstructionError> {
        if !self.cameras.contains_key(&image.camera_id) {
            return Err(ReconstructionError::UnknownCamera(image.camera_id));
        }
        if self.images.contains_key(&image.image_id) {
            return Err(ReconstructionError::DuplicateImage(image.image_id));
        }
        image.registered = false;
        self.images.insert(image.image_id, image);
        Ok(())
    }

    /// Camera by id.
    pub fn camera(&self, camera_id: CameraId) -> Result<&Camera, ReconstructionError> {
        self.cameras
            .get(&camera_id)
            .ok_or(ReconstructionError::UnknownCamera(camera_id))
    }

    pub(crate) fn camera_mut(&mut self, camera_id: CameraId) -> Result<&mut Camera, ReconstructionError> {
        self.cameras
            .get_mut(&camera_id)
            .ok_or(ReconstructionError::UnknownCamera(camera_id))
    }

    /// All cameras.
    pub fn cameras(&self) -> &BTreeMap<CameraId, Camera> {
        &self.cameras
    }

    /// Image by id.
    pub fn image(&self, image_id: ImageId) -> Result<&Image, ReconstructionError> {
        self.images
            .get(&image_id)
            .ok_or(ReconstructionError::UnknownImage(image_id))
    }

    /// All images, registered or not.
    pub fn images(&self) -> &BTreeMap<ImageId, Image> {
        &self.images
    }

    /// Camera of an image.
    pub fn image_camera(&self, image_id: ImageId) -> Result<&Camera, ReconstructionError> {
        self.camera(self.image(image_id)?.camera_id)
    }

    /// 3D point by id.
    pub fn point3d(&self, point3d_id: Point3DId) -> Result<&Point3D, ReconstructionError> {
        self.points3d
            .get(&point3d_id)
            .ok_or(ReconstructionError::UnknownPoint3D(point3d_id))
    }

    /// All 3D points.
    pub fn points3d(&self) -> &BTreeMap<Point3DId, Point3D> {
        &self.points3d
    }

    /// Number of 3D points.
    pub fn num_points3d(&self) -> usize {
        self.points3d.len()
    }

    /// Registered images in registration order.
    pub fn registered_image_ids(&self) -> &[ImageId] {
        &self.registration_order
    }

    /// Number of registered images.
    pub fn num_registered_images(&self) -> usize {
        self.registration_order.len()
    }

    /// Whether the image is registered.
    pub fn is_registered(&self, image_id: ImageId) -> bool {
        self.images.get(&image_id).is_some_and(Image::is_registered)
    }

    /// Register an image with a pose, or update the pose of a registered image.
    pub fn register_image(&mut self, image_id: ImageId, pose: Rigid3) -> Result<(), ReconstructionError> {
        let image = self
            .images
            .get_mut(&image_id)
            .ok_or(ReconstructionError::UnknownImage(image_id))?;
        image.pose = pose;
        if !image.registered {
            image.registered = true;
            self.registration_order.push(image_id);
        }
        Ok(())
    }

    /// Deregister an image, deleting all of its observations.
    pub fn deregister_image(&mut self, image_id: ImageId) -> Result<(), ReconstructionError> {
        let observations = self
            .image(image_id)?
            .points2d
            .iter()
            .enumerate()
            .filter(|(_, p)| p.point3d_id.is_some())
            .map(|(i, _)| Observation::new(image_id, i as u32))
            .collect::<Vec<_>>();
        for obs in observations {
            self.delete_observation(&obs)?;
        }
        if let Some(image) = self.images.get_mut(&image_id) {
            image.registered = false;
        }
        self.registration_order.retain(|&id| id != image_id);
        Ok(())
    }

    pub(crate) fn set_pose(&mut self, image_id: ImageId, pose: Rigid3) -> Result<(), ReconstructionError> {
        let image = self
            .images
            .get_mut(&image_id)
            .ok_or(ReconstructionError::UnknownImage(image_id))?;
        image.pose = pose;
        Ok(())
    }

    pub(crate) fn set_point_xyz(&mut self, point3d_id: Point3DId, xyz: DVec3) -> Result<(), ReconstructionError> {
        self.points3d
            .get_mut(&point3d_id)
            .ok_or(ReconstructionError::UnknownPoint3D(point3d_id))?
            .xyz = xyz;
        Ok(())
    }

    fn point2d(&self, obs: &Observation) -> Result<&Point2D, ReconstructionError> {
        self.image(obs.image_id)?
            .points2d
            .get(obs.point2d_idx as usize)
            .ok_or(ReconstructionError::InvalidPoint2D {
                image_id: obs.image_id,
                point2d_idx: obs.point2d_idx,
            })
    }

    fn point2d_mut(&mut self, obs: &Observation) -> Result<&mut Point2D, ReconstructionError> {
        self.images
            .get_mut(&obs.image_id)
            .ok_or(ReconstructionError::UnknownImage(obs.image_id))?
            .points2d
            .get_mut(obs.point2d_idx as usize)
            .ok_or(ReconstructionError::InvalidPoint2D {
                image_id: obs.image_id,
                point2d_idx: obs.point2d_idx,
            })
    }

    fn validate_observation(&self, obs: &Observation) -> Result<(), ReconstructionError> {
        if !self.image(obs.image_id)?.registered {
            return Err(ReconstructionError::ImageNotRegistered(obs.image_id));
        }
        if self.point2d(obs)?.point3d_id.is_some() {
            return Err(ReconstructionError::Point2DAlreadyAssigned {
                image_id: obs.image_id,
                point2d_idx: obs.point2d_idx,
            });
        }
        Ok(())
    }

    fn validate_track(&self, track: &[Observation]) -> Result<(), ReconstructionError> {
        if track.len() < 2 {
            return Err(ReconstructionError::TooFewObservations(track.len()));
        }
        let mut seen = BTreeSet::new();
        for obs in track {
            if !seen.insert(obs.image_id) {
                return Err(ReconstructionError::DuplicateImageInTrack(obs.image_id));
            }
            self.validate_observation(obs)?;
        }
        Ok(())
    }

    /// Add a 3D point observed by at least two registered images.
    ///
    /// Every observation must reference a distinct registered image and a free keypoint.
    pub fn add_point3d(
        &mut self,
        xyz: DVec3,
        mut track: Vec<Observation>,
        color: [u8; 3],
        track_id: Option<TrackId>,
    ) -> Result<Point3DId, ReconstructionError> {
        track.sort();
        self.validate_track(&track)?;
        let id = self.next_point3d_id;
        self.next_point3d_id += 1;
        for obs in &track {
            self.point2d_mut(obs)?.point3d_id = Some(id);
        }
        let mut point = Point3D {
            xyz,
            color,
            error: 0.0,
            track,
            track_id,
        };
        point.error = self.mean_error_of(&point);
        self.points3d.insert(id, point);
        Ok(id)
    }

    /// Add an observation to an existing 3D point.
    pub fn add_observation(
        &mut self,
        point3d_id: Point3DId,
        obs: Observation,
    ) -> Result<(), ReconstructionError> {
        let point = self.point3d(point3d_id)?;
        if point.track.iter().any(|o| o.image_id == obs.image_id) {
            return Err(ReconstructionError::DuplicateImageInTrack(obs.image_id));
        }
        self.validate_observation(&obs)?;
        self.point2d_mut(&obs)?.point3d_id = Some(point3d_id);
        if let Some(point) = self.points3d.get_mut(&point3d_id) {
            let pos = point.track.partition_point(|o| *o < obs);
            point.track.insert(pos, obs);
        }
        Ok(())
    }

    /// Remove an observation; the point is deleted when fewer than two remain.
    ///
    /// Returns `true` when the point was deleted.
    pub fn delete_observation(&mut self, obs: &Observation) -> Result<bool, ReconstructionError> {
        let Some(point3d_id) = self.point2d(obs)?.point3d_id else {
            return Ok(false);
        };
        let remaining = {
            let point = self
                .points3d
                .get_mut(&point3d_id)
                .ok_or(ReconstructionError::UnknownPoint3D(point3d_id))?;
            point.track.retain(|o| o != obs);
            point.track.len()
        };
        self.point2d_mut(obs)?.point3d_id = None;
        if remaining < 2 {
            self.delete_point3d(point3d_id)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Delete a 3D point and clear all keypoint assignments to it.
    pub fn delete_point3d(&mut self, point3d_id: Point3DId) -> Result<(), ReconstructionError> {
        let point = self
            .points3d
            .remove(&point3d_id)
            .ok_or(ReconstructionError::UnknownPoint3D(point3d_id))?;
        for obs in &point.track {
            if let Ok(p) = self.point2d_mut(obs) {
                p.point3d_id = None;
            }
        }
        Ok(())
    }

    /// Pixel reprojection error of a world point in an image, `None` if behind the camera.
    pub fn reprojection_error(&self, xyz: DVec3, obs: &Observation) -> Option<f64> {
        let image = self.images.get(&obs.image_id)?;
        let camera = self.cameras.get(&image.camera_id)?;
        let xy = image.points2d.get(obs.point2d_idx as usize)?.xy;
        let projected = camera.project(image.pose.transform_point(xyz))?;
        Some((projected - xy).length())
    }

    fn mean_error_of(&self, point: &Point3D) -> f64 {
        let errors = point
            .track
            .iter()
            .filter_map(|obs| self.reprojection_error(point.xyz, obs))
            .collect::<Vec<_>>();
        if errors.is_empty() {
            return 0.0;
        }
        errors.iter().sum::<f64>() / errors.len() as f64
    }

    /// Recompute the mean reprojection error of the given points, or of all points.
    pub fn update_point_errors(&mut self, point3d_ids: Option<&[Point3DId]>) {
        let ids = match point3d_ids {
            Some(ids) => ids.to_vec(),
            None => self.points3d.keys().copied().collect(),
        };
        for id in ids {
            let Some(point) = self.points3d.get(&id) else {
                continue;
            };
            let error = self.mean_error_of(point);
            if let Some(point) = self.points3d.get_mut(&id) {
                point.error = error;
            }
        }
    }

    /// Summary statistics.
    pub fn stats(&self) -> ReconstructionStats {
        let num_points3d = self.points3d.len();
        let num_observations = self.points3d.values().map(|p| p.track.len()).sum::<usize>();
        let (mean_track_length, mean_reprojection_error) = if num_points3d > 0 {
            (
                num_observations as f64 / num_points3d as f64,
                self.points3d.values().map(|p| p.error).sum::<f64>() / num_points3d as f64,
            )
        } else {
            (0.0, 0.0)
        };
        ReconstructionStats {
            num_cameras: self.cameras.len(),
            num_registered_images: self.registration_order.len(),
            num_points3d,
            num_observations,
            mean_track_length,
            mean_reprojection_error,
        }
    }
}
