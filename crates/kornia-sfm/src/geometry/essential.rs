use glam::{DMat3, DVec2, DVec3};

use super::ransac::Estimator;
use super::triangulation::{has_positive_depth, triangulate_point};
use crate::linalg::{smallest_right_singular_vector, svd3};
use crate::pose::{skew, Rigid3};

/// Hartley normalization: translate to the centroid and scale to a mean distance of sqrt(2).
pub(crate) fn normalize_points(points: &[DVec2]) -> (Vec<DVec2>, DMat3) {
    let n = points.len().max(1) as f64;
    let mean = points.iter().copied().sum::<DVec2>() / n;
    let mean_dist = points.iter().map(|p| (*p - mean).length()).sum::<f64>() / n;
    let scale = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let normalized = points.iter().map(|p| (*p - mean) * scale).collect();
    let t = DMat3::from_cols(
        DVec3::new(scale, 0.0, 0.0),
        DVec3::new(0.0, scale, 0.0),
        DVec3::new(-scale * mean.x, -scale * mean.y, 1.0),
    );
    (normalized, t)
}

// row-major 9-vector into a matrix
pub(crate) fn mat3_from_rows(e: &[f64; 9]) -> DMat3 {
    DMat3::from_cols_array(e).transpose()
}

/// Estimate an essential matrix from at least eight normalized correspondences.
///
/// Uses the normalized 8-point algorithm followed by the projection onto the
/// essential manifold (two equal singular values, one zero). Returns `None`
/// for fewer than eight points or a degenerate configuration.
pub fn essential_8point(x1: &[DVec2], x2: &[DVec2]) -> Option<DMat3> {
    if x1.len() != x2.len() || x1.len() < 8 {
        return None;
    }
    let (x1n, t1) = normalize_points(x1);
    let (x2n, t2) = normalize_points(x2);

    let rows = x1n
        .iter()
        .zip(x2n.iter())
        .map(|(a, b)| {
            [
                b.x * a.x,
                b.x * a.y,
                b.x,
                b.y * a.x,
                b.y * a.y,
                b.y,
                a.x,
                a.y,
                1.0,
            ]
        })
        .collect::<Vec<_>>();

    let e = mat3_from_rows(&smallest_right_singular_vector(&rows));
    let e = t2.transpose() * e * t1;
    let e = enforce_essential_constraints(&e);
    let norm = e.to_cols_array().iter().map(|v| v * v).sum::<f64>().sqrt();
    if !norm.is_finite() || norm < f64::EPSILON {
        return None;
    }
    Some(e * (1.0 / norm))
}

/// Enforce the (1, 1, 0) singular value constraint on an essential matrix.
pub fn enforce_essential_constraints(e: &DMat3) -> DMat3 {
    let (u, _, v) = svd3(e);
    u * DMat3::from_diagonal(DVec3::new(1.0, 1.0, 0.0)) * v.transpose()
}

/// Squared Sampson distance of a correspondence under an epipolar matrix.
pub fn sampson_distance(e: &DMat3, x1: DVec2, x2: DVec2) -> f64 {
    let p1 = x1.extend(1.0);
    let p2 = x2.extend(1.0);
    let ex1 = *e * p1;
    let etx2 = e.transpose() * p2;
    let num = p2.dot(ex1);
    let den = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if den <= f64::EPSILON {
        return f64::INFINITY;
    }
    num * num / den
}

/// Build an essential matrix from a relative pose: `E = [t]x R`.
pub fn essential_from_pose(pose: &Rigid3) -> DMat3 {
    skew(pose.translation) * pose.rotation_matrix()
}

/// Fundamental matrix from an essential matrix and the two calibration matrices.
///
/// `F = K2^-T E K1^-1`
pub fn fundamental_from_essential(e: &DMat3, k1: &DMat3, k2: &DMat3) -> DMat3 {
    k2.inverse().transpose() * *e * k1.inverse()
}

/// Decompose an essential matrix into the four candidate `(R, t)` solutions.
///
/// The translation is a unit vector.
pub fn decompose_essential(e: &DMat3) -> [(DMat3, DVec3); 4] {
    let (mut u, _, mut v) = svd3(e);
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v.determinant() < 0.0 {
        v = -v;
    }
    let w = DMat3::from_cols(
        DVec3::new(0.0, 1.0, 0.0),
        DVec3::new(-1.0, 0.0, 0.0),
        DVec3::Z,
    );
    let r1 = u * w * v.transpose();
    let r2 = u * w.transpose() * v.transpose();
    let t = u.z_axis.normalize_or_zero();
    [(r1, t), (r1, -t), (r2, t), (r2, -t)]
}

/// Recover the relative pose of the second camera from an essential matrix.
///
/// Each of the four decompositions triangulates the correspondences and the one
/// with the most points in front of both cameras wins. Returns the pose of
/// the second camera relative to the first and the triangulated points (in the
/// first camera frame) for the correspondences that passed the cheirality check.
pub fn pose_from_essential(
    e: &DMat3,
    x1: &[DVec2],
    x2: &[DVec2],
) -> Option<(Rigid3, Vec<Option<DVec3>>)> {
    let first = Rigid3::IDENTITY;
    let mut best: Option<(usize, Rigid3, Vec<Option<DVec3>>)> = None;

    for (r, t) in decompose_essential(e) {
        let pose = Rigid3::from_matrix(&r, t);
        let points = x1
            .iter()
            .zip(x2.iter())
            .map(|(&a, &b)| {
                let p = triangulate_point(&first, &pose, a, b)?;
                (has_positive_depth(&first, p) && has_positive_depth(&pose, p)).then_some(p)
            })
            .collect::<Vec<_>>();
        let count = points.iter().filter(|p| p.is_some()).count();
        if best.as_ref().is_none_or(|(c, _, _)| count > *c) {
            best = Some((count, pose, points));
        }
    }

    match best {
        Some((count, pose, points)) if count > 0 => Some((pose, points)),
        _ => None,
    }
}

/// RANSAC estimator of essential matrices on normalized correspondences.
pub struct EssentialEstimator;

impl Estimator for EssentialEstimator {
    type Datum = (DVec2, DVec2);
    type Model = DMat3;
    const SAMPLE_SIZE: usize = 8;

    fn estimate(&self, data: &[Self::Datum]) -> Vec<DMat3> {
        let (x1, x2): (Vec<_>, Vec<_>) = data.iter().copied().unzip();
        essential_8point(&x1, &x2).into_iter().collect()
    }

    fn residual(&self, model: &DMat3, datum: &Self::Datum) -> f64 {
        sampson_distance(model, datum.0, datum.1)
    }
}
