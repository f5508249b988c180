use glam::{DVec2, DVec3};

use crate::linalg::smallest_right_singular_vector;
use crate::pose::Rigid3;

fn projection_rows(pose: &Rigid3) -> [[f64; 4]; 3] {
    let r = pose.rotation_matrix();
    let t = pose.translation;
    let row = |i: usize| {
        let ri = r.row(i);
        [ri.x, ri.y, ri.z, t[i]]
    };
    [row(0), row(1), row(2)]
}

fn dlt_rows(pose: &Rigid3, x: DVec2) -> [[f64; 4]; 2] {
    let p = projection_rows(pose);
    let mut out = [[0.0; 4]; 2];
    for j in 0..4 {
        out[0][j] = x.x * p[2][j] - p[0][j];
        out[1][j] = x.y * p[2][j] - p[1][j];
    }
    out
}

/// Triangulate a point from two views with the linear DLT method.
///
/// `x1` and `x2` are normalized image coordinates. Returns `None` for points
/// at infinity.
pub fn triangulate_point(pose1: &Rigid3, pose2: &Rigid3, x1: DVec2, x2: DVec2) -> Option<DVec3> {
    triangulate_multiview(&[(*pose1, x1), (*pose2, x2)])
}

/// Triangulate a point from two or more views with the linear DLT method.
pub fn triangulate_multiview(views: &[(Rigid3, DVec2)]) -> Option<DVec3> {
    if views.len() < 2 {
        return None;
    }
    let rows = views
        .iter()
        .flat_map(|(pose, x)| dlt_rows(pose, *x))
        .collect::<Vec<_>>();
    let xh = smallest_right_singular_vector(&rows);
    if xh[3].abs() < 1e-12 {
        return None;
    }
    let p = DVec3::new(xh[0] / xh[3], xh[1] / xh[3], xh[2] / xh[3]);
    p.is_finite().then_some(p)
}

/// Angle in radians between the rays from two camera centers to a point.
pub fn triangulation_angle(center1: DVec3, center2: DVec3, point: DVec3) -> f64 {
    let r1 = point - center1;
    let r2 = point - center2;
    let denom = r1.length() * r2.length();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (r1.dot(r2) / denom).clamp(-1.0, 1.0).acos()
}

/// Whether the point lies in front of the camera.
#[inline]
pub fn has_positive_depth(pose: &Rigid3, point: DVec3) -> bool {
    pose.transform_point(point).z > f64::EPSILON
}
