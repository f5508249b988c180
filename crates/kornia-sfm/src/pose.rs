use glam::{DMat3, DQuat, DVec3};

/// A rigid transformation mapping world coordinates to camera coordinates.
///
/// `x_cam = rotation * x_world + translation`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rigid3 {
    /// Unit quaternion rotation.
    pub rotation: DQuat,
    /// Translation.
    pub translation: DVec3,
}

impl Default for Rigid3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Rigid3 {
    /// The identity transformation.
    pub const IDENTITY: Self = Self {
        rotation: DQuat::IDENTITY,
        translation: DVec3::ZERO,
    };

    /// Create a transformation from a rotation and a translation.
    pub fn new(rotation: DQuat, translation: DVec3) -> Self {
        Self {
            rotation: rotation.normalize(),
            translation,
        }
    }

    /// Create a transformation from a rotation matrix and a translation.
    pub fn from_matrix(rotation: &DMat3, translation: DVec3) -> Self {
        Self::new(DQuat::from_mat3(rotation), translation)
    }

    /// Create a transformation from COLMAP `(qw, qx, qy, qz)` and `(tx, ty, tz)`.
    pub fn from_colmap(q: [f64; 4], t: [f64; 3]) -> Self {
        Self::new(
            DQuat::from_xyzw(q[1], q[2], q[3], q[0]),
            DVec3::from_array(t),
        )
    }

    /// COLMAP `(qw, qx, qy, qz)` quaternion.
    pub fn colmap_quaternion(&self) -> [f64; 4] {
        let q = self.rotation;
        [q.w, q.x, q.y, q.z]
    }

    /// Rotation as a matrix.
    pub fn rotation_matrix(&self) -> DMat3 {
        DMat3::from_quat(self.rotation)
    }

    /// Apply the transformation to a point.
    #[inline]
    pub fn transform_point(&self, p: DVec3) -> DVec3 {
        self.rotation * p + self.translation
    }

    /// The inverse transformation.
    pub fn inverse(&self) -> Self {
        let r_inv = self.rotation.inverse();
        Self {
            rotation: r_inv,
            translation: -(r_inv * self.translation),
        }
    }

    /// Compose two transformations: `self * other` applies `other` first.
    pub fn compose(&self, other: &Rigid3) -> Self {
        Self::new(
            self.rotation * other.rotation,
            self.rotation * other.translation + self.translation,
        )
    }

    /// Position of the camera center in world coordinates.
    pub fn center(&self) -> DVec3 {
        -(self.rotation.inverse() * self.translation)
    }

    /// Apply a left perturbation `(w, v)`: `R' = exp(w) R`, `t' = t + v`.
    pub fn perturbed(&self, w: DVec3, v: DVec3) -> Self {
        Self::new(DQuat::from_scaled_axis(w) * self.rotation, self.translation + v)
    }

    /// Angular distance between the rotations of two transformations, in radians.
    pub fn rotation_angle_to(&self, other: &Rigid3) -> f64 {
        let q = (self.rotation.inverse() * other.rotation).normalize();
        2.0 * q.w.abs().min(1.0).acos()
    }
}

/// Skew-symmetric cross-product matrix of `v`.
pub fn skew(v: DVec3) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(0.0, v.z, -v.y),
        DVec3::new(-v.z, 0.0, v.x),
        DVec3::new(v.y, -v.x, 0.0),
    )
}
