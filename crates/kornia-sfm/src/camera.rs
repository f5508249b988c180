//! Camera intrinsic models.
//!
//! Models follow the COLMAP naming and parameter ordering so that exported
//! models can be consumed by downstream dense reconstruction tools.

use std::path::Path;

use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::types::CameraId;

/// Error types for camera models.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// The parameter vector does not match the arity of the model.
    #[error("camera model {model} expects {expected} parameters, got {actual}")]
    InvalidNumParams {
        /// Model name.
        model: &'static str,
        /// Number of parameters the model declares.
        expected: usize,
        /// Number of parameters provided.
        actual: usize,
    },

    /// The model name is not a known COLMAP camera model.
    #[error("unknown camera model: {0}")]
    UnknownModel(String),

    /// The model is a known COLMAP model but is not implemented.
    #[error("unsupported camera model: {0}")]
    UnsupportedModel(String),

    /// Width or height is zero.
    #[error("invalid image size {width}x{height}")]
    InvalidSize {
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
    },

    /// A focal length is not strictly positive or a parameter is not finite.
    #[error("invalid camera parameters: {0:?}")]
    InvalidParams(Vec<f64>),

    /// Failed to read the camera description.
    #[error("failed to read camera description")]
    Io(#[from] std::io::Error),

    /// Failed to parse the camera description.
    #[error("failed to parse camera description: {0}")]
    Json(#[from] serde_json::Error),
}

/// Supported intrinsic camera models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraModelId {
    /// `f, cx, cy`
    #[serde(rename = "SIMPLE_PINHOLE")]
    SimplePinhole,
    /// `fx, fy, cx, cy`
    #[serde(rename = "PINHOLE")]
    Pinhole,
    /// `f, cx, cy, k`
    #[serde(rename = "SIMPLE_RADIAL")]
    SimpleRadial,
    /// `f, cx, cy, k1, k2`
    #[serde(rename = "RADIAL")]
    Radial,
    /// `fx, fy, cx, cy, k1, k2, p1, p2`
    #[serde(rename = "OPENCV")]
    OpenCV,
}

/// Model names that COLMAP knows about but that are not implemented here.
const UNSUPPORTED_MODELS: [&str; 6] = [
    "OPENCV_FISHEYE",
    "FULL_OPENCV",
    "FOV",
    "SIMPLE_RADIAL_FISHEYE",
    "RADIAL_FISHEYE",
    "THIN_PRISM_FISHEYE",
];

impl CameraModelId {
    /// All implemented models.
    pub const ALL: [CameraModelId; 5] = [
        CameraModelId::SimplePinhole,
        CameraModelId::Pinhole,
        CameraModelId::SimpleRadial,
        CameraModelId::Radial,
        CameraModelId::OpenCV,
    ];

    /// Number of parameters the model declares.
    pub fn num_params(&self) -> usize {
        match self {
            CameraModelId::SimplePinhole => 3,
            CameraModelId::Pinhole => 4,
            CameraModelId::SimpleRadial => 4,
            CameraModelId::Radial => 5,
            CameraModelId::OpenCV => 8,
        }
    }

    /// COLMAP model name.
    pub fn name(&self) -> &'static str {
        match self {
            CameraModelId::SimplePinhole => "SIMPLE_PINHOLE",
            CameraModelId::Pinhole => "PINHOLE",
            CameraModelId::SimpleRadial => "SIMPLE_RADIAL",
            CameraModelId::Radial => "RADIAL",
            CameraModelId::OpenCV => "OPENCV",
        }
    }

    /// COLMAP numeric model id.
    pub fn colmap_id(&self) -> i32 {
        match self {
            CameraModelId::SimplePinhole => 0,
            CameraModelId::Pinhole => 1,
            CameraModelId::SimpleRadial => 2,
            CameraModelId::Radial => 3,
            CameraModelId::OpenCV => 4,
        }
    }

    /// Inverse of [`CameraModelId::colmap_id`].
    pub fn from_colmap_id(id: i32) -> Result<Self, CameraError> {
        Self::ALL
            .into_iter()
            .find(|m| m.colmap_id() == id)
            .ok_or_else(|| CameraError::UnknownModel(id.to_string()))
    }

    /// Parse a COLMAP model name.
    pub fn from_name(name: &str) -> Result<Self, CameraError> {
        let upper = name.trim().to_ascii_uppercase();
        if let Some(model) = Self::ALL.into_iter().find(|m| m.name() == upper) {
            return Ok(model);
        }
        if UNSUPPORTED_MODELS.contains(&upper.as_str()) {
            return Err(CameraError::UnsupportedModel(upper));
        }
        Err(CameraError::UnknownModel(name.to_string()))
    }

    /// Indices of the focal length parameters.
    pub fn focal_length_idxs(&self) -> &'static [usize] {
        match self {
            CameraModelId::SimplePinhole | CameraModelId::SimpleRadial | CameraModelId::Radial => {
                &[0]
            }
            CameraModelId::Pinhole | CameraModelId::OpenCV => &[0, 1],
        }
    }

    /// Indices of the principal point parameters.
    pub fn principal_point_idxs(&self) -> &'static [usize] {
        match self {
            CameraModelId::SimplePinhole | CameraModelId::SimpleRadial | CameraModelId::Radial => {
                &[1, 2]
            }
            CameraModelId::Pinhole | CameraModelId::OpenCV => &[2, 3],
        }
    }

    /// Indices of the distortion parameters.
    pub fn extra_params_idxs(&self) -> &'static [usize] {
        match self {
            CameraModelId::SimplePinhole | CameraModelId::Pinhole => &[],
            CameraModelId::SimpleRadial => &[3],
            CameraModelId::Radial => &[3, 4],
            CameraModelId::OpenCV => &[4, 5, 6, 7],
        }
    }

    /// Whether the model has distortion terms.
    pub fn has_distortion(&self) -> bool {
        !self.extra_params_idxs().is_empty()
    }
}

impl std::fmt::Display for CameraModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Camera intrinsics shared by one or more images.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    /// Camera id.
    pub camera_id: CameraId,
    /// Intrinsic model.
    pub model: CameraModelId,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    params: Vec<f64>,
}

impl Camera {
    /// Create a camera, validating the parameter arity against the model.
    pub fn new(
        camera_id: CameraId,
        model: CameraModelId,
        width: u32,
        height: u32,
        params: Vec<f64>,
    ) -> Result<Self, CameraError> {
        if width == 0 || height == 0 {
            return Err(CameraError::InvalidSize { width, height });
        }
        validate_params(model, &params)?;
        Ok(Self {
            camera_id,
            model,
            width,
            height,
            params,
        })
    }

    /// Create a camera with a focal length of 1.2 times the larger image side,
    /// the principal point at the image center and zero distortion.
    pub fn with_default_params(
        camera_id: CameraId,
        model: CameraModelId,
        width: u32,
        height: u32,
    ) -> Result<Self, CameraError> {
        let focal = 1.2 * width.max(height) as f64;
        let mut params = vec![0.0; model.num_params()];
        for &i in model.focal_length_idxs() {
            params[i] = focal;
        }
        let pp = model.principal_point_idxs();
        params[pp[0]] = width as f64 / 2.0;
        params[pp[1]] = height as f64 / 2.0;
        Self::new(camera_id, model, width, height, params)
    }

    /// The parameter vector in COLMAP order.
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Replace the parameter vector, validating its arity.
    pub fn set_params(&mut self, params: Vec<f64>) -> Result<(), CameraError> {
        validate_params(self.model, &params)?;
        self.params = params;
        Ok(())
    }

    /// Focal lengths along x and y.
    pub fn focal(&self) -> (f64, f64) {
        focal(self.model, &self.params)
    }

    /// Mean focal length, used to convert pixel thresholds to normalized units.
    pub fn mean_focal_length(&self) -> f64 {
        let (fx, fy) = self.focal();
        0.5 * (fx + fy)
    }

    /// Principal point in pixels.
    pub fn principal_point(&self) -> DVec2 {
        let pp = self.model.principal_point_idxs();
        DVec2::new(self.params[pp[0]], self.params[pp[1]])
    }

    /// The pinhole calibration matrix, ignoring distortion.
    pub fn calibration_matrix(&self) -> DMat3 {
        let (fx, fy) = self.focal();
        let c = self.principal_point();
        DMat3::from_cols(
            DVec3::new(fx, 0.0, 0.0),
            DVec3::new(0.0, fy, 0.0),
            DVec3::new(c.x, c.y, 1.0),
        )
    }

    /// Convert a pixel threshold to the normalized image plane.
    pub fn threshold_to_normalized(&self, threshold_px: f64) -> f64 {
        threshold_px / self.mean_focal_length()
    }

    /// Project a point expressed in the camera frame to pixels.
    ///
    /// Returns `None` for points at or behind the camera center.
    pub fn project(&self, point_cam: DVec3) -> Option<DVec2> {
        if point_cam.z <= f64::EPSILON {
            return None;
        }
        let n = DVec2::new(point_cam.x / point_cam.z, point_cam.y / point_cam.z);
        Some(self.img_from_normalized(n))
    }

    /// Map a point on the normalized image plane to pixels, applying distortion.
    pub fn img_from_normalized(&self, n: DVec2) -> DVec2 {
        img_from_normalized_with(self.model, &self.params, n)
    }

    /// Map a pixel to the normalized (undistorted) image plane.
    pub fn normalized_from_img(&self, uv: DVec2) -> DVec2 {
        let (fx, fy) = self.focal();
        let c = self.principal_point();
        let distorted = DVec2::new((uv.x - c.x) / fx, (uv.y - c.y) / fy);
        if !self.model.has_distortion() {
            return distorted;
        }
        undistort(self.model, &self.params, distorted)
    }

    /// Jacobian of [`Camera::img_from_normalized`] with respect to the normalized point.
    ///
    /// Returned as the two columns `d uv / d x` and `d uv / d y`.
    pub fn normalized_jacobian(&self, n: DVec2) -> [DVec2; 2] {
        let (fx, fy) = self.focal();
        if !self.model.has_distortion() {
            return [DVec2::new(fx, 0.0), DVec2::new(0.0, fy)];
        }
        let jd = distortion_jacobian(self.model, &self.params, n);
        [
            DVec2::new(fx * jd[0].x, fy * jd[0].y),
            DVec2::new(fx * jd[1].x, fy * jd[1].y),
        ]
    }

    /// Indices of the parameters that bundle adjustment may refine.
    pub fn refinable_param_idxs(&self, refine_focal: bool, refine_extra: bool) -> Vec<usize> {
        let mut idxs = Vec::new();
        if refine_focal {
            idxs.extend_from_slice(self.model.focal_length_idxs());
        }
        if refine_extra {
            idxs.extend_from_slice(self.model.extra_params_idxs());
        }
        idxs
    }
}

/// Project a normalized point to pixels with an explicit parameter vector.
///
/// Used by the bundle adjuster to differentiate with respect to intrinsics.
pub fn img_from_normalized_with(model: CameraModelId, params: &[f64], n: DVec2) -> DVec2 {
    let (fx, fy) = focal(model, params);
    let pp = model.principal_point_idxs();
    let d = distort(model, params, n);
    DVec2::new(fx * d.x + params[pp[0]], fy * d.y + params[pp[1]])
}

fn focal(model: CameraModelId, params: &[f64]) -> (f64, f64) {
    let idx = model.focal_length_idxs();
    match idx {
        [f] => (params[*f], params[*f]),
        [fx, fy] => (params[*fx], params[*fy]),
        _ => (1.0, 1.0),
    }
}

fn validate_params(model: CameraModelId, params: &[f64]) -> Result<(), CameraError> {
    if params.len() != model.num_params() {
        return Err(CameraError::InvalidNumParams {
            model: model.name(),
            expected: model.num_params(),
            actual: params.len(),
        });
    }
    let focal_ok = model.focal_length_idxs().iter().all(|&i| params[i] > 0.0);
    if !focal_ok || params.iter().any(|p| !p.is_finite()) {
        return Err(CameraError::InvalidParams(params.to_vec()));
    }
    Ok(())
}

fn distort(model: CameraModelId, params: &[f64], n: DVec2) -> DVec2 {
    let (x, y) = (n.x, n.y);
    let r2 = x * x + y * y;
    match model {
        CameraModelId::SimplePinhole | CameraModelId::Pinhole => n,
        CameraModelId::SimpleRadial => {
            let radial = params[3] * r2;
            n * (1.0 + radial)
        }
        CameraModelId::Radial => {
            let radial = params[3] * r2 + params[4] * r2 * r2;
            n * (1.0 + radial)
        }
        CameraModelId::OpenCV => {
            let (k1, k2, p1, p2) = (params[4], params[5], params[6], params[7]);
            let radial = k1 * r2 + k2 * r2 * r2;
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            DVec2::new(x * (1.0 + radial) + dx, y * (1.0 + radial) + dy)
        }
    }
}

fn distortion_jacobian(model: CameraModelId, params: &[f64], n: DVec2) -> [DVec2; 2] {
    let h = 1e-7;
    let dx = DVec2::new(h, 0.0);
    let dy = DVec2::new(0.0, h);
    let jx = (distort(model, params, n + dx) - distort(model, params, n - dx)) / (2.0 * h);
    let jy = (distort(model, params, n + dy) - distort(model, params, n - dy)) / (2.0 * h);
    [jx, jy]
}

// Newton iterations on the distortion model.
fn undistort(model: CameraModelId, params: &[f64], distorted: DVec2) -> DVec2 {
    const MAX_ITERATIONS: usize = 100;
    const EPS: f64 = 1e-12;

    let mut x = distorted;
    for _ in 0..MAX_ITERATIONS {
        let residual = distort(model, params, x) - distorted;
        if residual.length_squared() < EPS * EPS {
            break;
        }
        let [jx, jy] = distortion_jacobian(model, params, x);
        let det = jx.x * jy.y - jy.x * jx.y;
        if det.abs() < 1e-15 {
            break;
        }
        let step = DVec2::new(
            (jy.y * residual.x - jy.x * residual.y) / det,
            (-jx.y * residual.x + jx.x * residual.y) / det,
        );
        x -= step;
        if step.length_squared() < EPS * EPS {
            break;
        }
    }
    x
}

/// Camera description as consumed from a JSON file.
///
/// `params` may be omitted, in which case the defaults of
/// [`Camera::with_default_params`] are used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSpec {
    /// COLMAP model name, e.g. `"PINHOLE"`.
    pub model: String,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Parameter vector in COLMAP order.
    #[serde(default)]
    pub params: Option<Vec<f64>>,
}

impl CameraSpec {
    /// Read a camera description from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        let file = std::fs::File::open(path)?;
        let spec = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(spec)
    }

    /// Parse a camera description from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, CameraError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Build and validate a camera with the given id.
    pub fn to_camera(&self, camera_id: CameraId) -> Result<Camera, CameraError> {
        let model = CameraModelId::from_name(&self.model)?;
        match &self.params {
            Some(params) => Camera::new(camera_id, model, self.width, self.height, params.clone()),
            None => Camera::with_default_params(camera_id, model, self.width, self.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_param_arity_is_validated() {
        for model in CameraModelId::ALL {
            let n = model.num_params();
            let ok = Camera::new(1, model, 640, 480, vec![100.0; n]);
            assert!(ok.is_ok(), "{model} should accept {n} params");

            let short = Camera::new(1, model, 640, 480, vec![100.0; n - 1]);
            assert!(matches!(
                short,
                Err(CameraError::InvalidNumParams { expected, actual, .. })
                    if expected == n && actual == n - 1
            ));

            let long = Camera::new(1, model, 640, 480, vec![100.0; n + 1]);
            assert!(matches!(long, Err(CameraError::InvalidNumParams { .. })));
        }
    }

    #[test]
    fn test_model_names() -> Result<(), CameraError> {
        for model in CameraModelId::ALL {
            assert_eq!(CameraModelId::from_name(model.name())?, model);
            assert_eq!(CameraModelId::from_colmap_id(model.colmap_id())?, model);
        }
        assert!(matches!(
            CameraModelId::from_name("FOV"),
            Err(CameraError::UnsupportedModel(_))
        ));
        assert!(matches!(
            CameraModelId::from_name("FISH"),
            Err(CameraError::UnknownModel(_))
        ));
        Ok(())
    }

    #[test]
    fn test_default_params() -> Result<(), CameraError> {
        let cam = Camera::with_default_params(1, CameraModelId::SimpleRadial, 640, 480)?;
        assert_eq!(cam.params(), &[768.0, 320.0, 240.0, 0.0]);
        let cam = Camera::with_default_params(1, CameraModelId::Pinhole, 640, 480)?;
        assert_eq!(cam.params(), &[768.0, 768.0, 320.0, 240.0]);
        Ok(())
    }

    #[test]
    fn test_project_unproject_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let cameras = [
            Camera::new(1, CameraModelId::Pinhole, 640, 480, vec![500.0, 510.0, 320.0, 240.0])?,
            Camera::new(2, CameraModelId::SimpleRadial, 640, 480, vec![500.0, 320.0, 240.0, -0.1])?,
            Camera::new(3, CameraModelId::Radial, 640, 480, vec![500.0, 320.0, 240.0, 0.05, 0.01])?,
            Camera::new(
                4,
                CameraModelId::OpenCV,
                640,
                480,
                vec![500.0, 505.0, 320.0, 240.0, -0.08, 0.02, 0.001, -0.002],
            )?,
        ];
        for cam in &cameras {
            for p in [
                DVec3::new(0.1, -0.2, 1.0),
                DVec3::new(-0.4, 0.3, 2.0),
                DVec3::new(0.0, 0.0, 5.0),
            ] {
                let uv = cam.project(p).ok_or("point behind camera")?;
                let n = cam.normalized_from_img(uv);
                assert_relative_eq!(n.x, p.x / p.z, epsilon = 1e-9);
                assert_relative_eq!(n.y, p.y / p.z, epsilon = 1e-9);
            }
        }
        Ok(())
    }

    #[test]
    fn test_project_behind_camera() -> Result<(), CameraError> {
        let cam = Camera::with_default_params(1, CameraModelId::SimplePinhole, 100, 100)?;
        assert!(cam.project(DVec3::new(0.0, 0.0, -1.0)).is_none());
        Ok(())
    }

    #[test]
    fn test_camera_spec_json() -> Result<(), CameraError> {
        let spec = CameraSpec::from_json_str(
            r#"{"model": "PINHOLE", "width": 1920, "height": 1080, "params": [1500, 1500, 960, 540]}"#,
        )?;
        let cam = spec.to_camera(7)?;
        assert_eq!(cam.camera_id, 7);
        assert_eq!(cam.model, CameraModelId::Pinhole);
        assert_eq!(cam.principal_point(), DVec2::new(960.0, 540.0));

        let spec = CameraSpec::from_json_str(r#"{"model": "SIMPLE_RADIAL", "width": 100, "height": 50}"#)?;
        let cam = spec.to_camera(1)?;
        assert_eq!(cam.params().len(), 4);

        let bad = CameraSpec::from_json_str(
            r#"{"model": "PINHOLE", "width": 100, "height": 50, "params": [1, 2, 3]}"#,
        )?;
        assert!(matches!(bad.to_camera(1), Err(CameraError::InvalidNumParams { .. })));
        Ok(())
    }
}
