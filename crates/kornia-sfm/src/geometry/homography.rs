use glam::{DMat3, DVec2};

use super::essential::{mat3_from_rows, normalize_points};
use super::ransac::Estimator;
use crate::linalg::smallest_right_singular_vector;

/// Estimate a homography `x2 ~ H x1` from four or more correspondences.
///
/// Normalized direct linear transform. The result is scaled so that `H[2][2] = 1`
/// when possible. Returns `None` for degenerate input.
pub fn homography_dlt(x1: &[DVec2], x2: &[DVec2]) -> Option<DMat3> {
    if x1.len() != x2.len() || x1.len() < 4 {
        return None;
    }
    let (x1n, t1) = normalize_points(x1);
    let (x2n, t2) = normalize_points(x2);

    let mut rows = Vec::with_capacity(2 * x1n.len());
    for (a, b) in x1n.iter().zip(x2n.iter()) {
        rows.push([a.x, a.y, 1.0, 0.0, 0.0, 0.0, -b.x * a.x, -b.x * a.y, -b.x]);
        rows.push([0.0, 0.0, 0.0, a.x, a.y, 1.0, -b.y * a.x, -b.y * a.y, -b.y]);
    }

    let h = mat3_from_rows(&smallest_right_singular_vector(&rows));
    let h = t2.inverse() * h * t1;
    if h.determinant().abs() < 1e-12 {
        return None;
    }
    let h = if h.z_axis.z.abs() > 1e-12 {
        h * (1.0 / h.z_axis.z)
    } else {
        h
    };
    h.is_finite().then_some(h)
}

/// Squared transfer error `|x2 - H x1|^2`.
pub fn transfer_error(h: &DMat3, x1: DVec2, x2: DVec2) -> f64 {
    let p = *h * x1.extend(1.0);
    if p.z.abs() < 1e-12 {
        return f64::INFINITY;
    }
    (p.truncate() / p.z - x2).length_squared()
}

/// RANSAC estimator of homographies.
pub struct HomographyEstimator;

impl Estimator for HomographyEstimator {
    type Datum = (DVec2, DVec2);
    type Model = DMat3;
    const SAMPLE_SIZE: usize = 4;

    fn estimate(&self, data: &[Self::Datum]) -> Vec<DMat3> {
        let (x1, x2): (Vec<_>, Vec<_>) = data.iter().copied().unzip();
        homography_dlt(&x1, &x2).into_iter().collect()
    }

    fn residual(&self, model: &DMat3, datum: &Self::Datum) -> f64 {
        transfer_error(model, datum.0, datum.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::DVec3;

    #[test]
    fn test_homography_identity() -> Result<(), Box<dyn std::error::Error>> {
        let x = [
            DVec2::new(0.0, 0.0),
            DVec2::new(1.0, 0.0),
            DVec2::new(0.0, 1.0),
            DVec2::new(1.0, 1.0),
        ];
        let h = homography_dlt(&x, &x).ok_or("degenerate")?;
        for (a, b) in h.to_cols_array().iter().zip(DMat3::IDENTITY.to_cols_array().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_homography_projective() -> Result<(), Box<dyn std::error::Error>> {
        let h_true = DMat3::from_cols(
            DVec3::new(1.1, 0.05, 0.001),
            DVec3::new(-0.1, 0.95, 0.002),
            DVec3::new(3.0, -2.0, 1.0),
        );
        let x1 = (0..12)
            .map(|i| DVec2::new((i % 4) as f64 * 10.0, (i / 4) as f64 * 15.0 + (i % 3) as f64))
            .collect::<Vec<_>>();
        let x2 = x1
            .iter()
            .map(|p| {
                let q = h_true * p.extend(1.0);
                q.truncate() / q.z
            })
            .collect::<Vec<_>>();
        let h = homography_dlt(&x1, &x2).ok_or("degenerate")?;
        for (a, b) in x1.iter().zip(x2.iter()) {
            assert!(transfer_error(&h, *a, *b) < 1e-8);
        }
        Ok(())
    }
}
