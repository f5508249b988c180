//! Outlier filtering of 3D points and their observations.

use glam::DVec3;
use log::debug;

use crate::geometry::triangulation_angle;
use crate::reconstruction::Reconstruction;
use crate::types::{Observation, Point3DId};

/// Filter all points of a reconstruction.
///
/// Removes observations with a reprojection error above `max_reproj_error_px`
/// or a negative depth, points left with fewer than two observations, and
/// points whose largest triangulation angle is below `min_tri_angle_deg`.
/// Returns the number of removed observations.
pub fn filter(reconstruction: &mut Reconstruction, max_reproj_error_px: f64, min_tri_angle_deg: f64) -> usize {
    let ids = reconstruction.points3d().keys().copied().collect::<Vec<_>>();
    filter_points(reconstruction, &ids, max_reproj_error_px, min_tri_angle_deg)
}

/// Filter the given points only, see [`filter`].
pub fn filter_points(
    reconstruction: &mut Reconstruction,
    point3d_ids: &[Point3DId],
    max_reproj_error_px: f64,
    min_tri_angle_deg: f64,
) -> usize {
    let min_tri_angle = min_tri_angle_deg.to_radians();
    let mut num_removed = 0;
    let mut kept = Vec::with_capacity(point3d_ids.len());

    for &point3d_id in point3d_ids {
        let Ok(point) = reconstruction.point3d(point3d_id) else {
            continue;
        };
        let xyz = point.xyz;
        let outliers = point
            .track
            .iter()
            .filter(|obs| !is_inlier(reconstruction, xyz, obs, max_reproj_error_px))
            .copied()
            .collect::<Vec<_>>();
        let mut deleted = false;
        for obs in &outliers {
            match reconstruction.delete_observation(obs) {
                Ok(point_deleted) => {
                    num_removed += 1;
                    if point_deleted {
                        // the remaining observation went with the point
                        num_removed += 1;
                        deleted = true;
                        break;
                    }
                }
                Err(err) => debug!("cannot delete observation {obs:?}: {err}"),
            }
        }
        if deleted {
            continue;
        }

        if max_triangulation_angle(reconstruction, point3d_id) < min_tri_angle {
            let track_len = reconstruction
                .point3d(point3d_id)
                .map_or(0, |p| p.track.len());
            if reconstruction.delete_point3d(point3d_id).is_ok() {
                num_removed += track_len;
            }
            continue;
        }
        kept.push(point3d_id);
    }

    reconstruction.update_point_errors(Some(&kept));
    if num_removed > 0 {
        debug!("filtered {num_removed} observations over {} points", point3d_ids.len());
    }
    num_removed
}

fn is_inlier(reconstruction: &Reconstruction, xyz: DVec3, obs: &Observation, max_error: f64) -> bool {
    let Ok(image) = reconstruction.image(obs.image_id) else {
        return false;
    };
    if image.pose.transform_point(xyz).z <= f64::EPSILON {
        return false;
    }
    reconstruction
        .reprojection_error(xyz, obs)
        .is_some_and(|e| e <= max_error)
}

/// Largest triangulation angle of a point over all pairs of observing images, in radians.
pub fn max_triangulation_angle(reconstruction: &Reconstruction, point3d_id: Point3DId) -> f64 {
    let Ok(point) = reconstruction.point3d(point3d_id) else {
        return 0.0;
    };
    let centers = point
        .track
        .iter()
        .filter_map(|obs| reconstruction.image(obs.image_id).ok())
        .map(|image| image.pose.center())
        .collect::<Vec<_>>();
    let mut best = 0.0f64;
    for (i, c1) in centers.iter().enumerate() {
        for c2 in &centers[i + 1..] {
            best = best.max(triangulation_angle(*c1, *c2, point.xyz));
        }
    }
    best
}
