//! Efficient Perspective-n-Point (EPnP) solver
//! Paper: [Lepetit et al., IJCV 2009](https://www.tugraz.at/fileadmin/user_upload/Institute/ICG/Images/team_lepetit/publications/lepetit_ijcv08.pdf)
//!
//! Works on normalized image coordinates, so distortion is handled by the
//! caller when unprojecting keypoints.

use faer::Mat;
use glam::{DMat3, DVec2, DVec3};

use super::{check_lengths, PnPError};
use crate::linalg::{least_squares, nearest_rotation, outer, solve_spd, svd3};
use crate::pose::Rigid3;

const CP_PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// Solve Perspective-n-Point with EPnP.
///
/// # Arguments
///
/// * `points_world` - 3-D coordinates in the world frame, at least four.
/// * `points_normalized` - Corresponding normalized image coordinates.
///
/// # Returns
///
/// The world to camera pose minimizing the normalized reprojection error among
/// the three EPnP approximations refined with Gauss-Newton.
pub fn solve_epnp(points_world: &[DVec3], points_normalized: &[DVec2]) -> Result<Rigid3, PnPError> {
    check_lengths(points_world.len(), points_normalized.len(), 4)?;

    let cw = select_control_points(points_world);
    let alphas = compute_barycentric(points_world, &cw);

    // MtM of the 2N x 12 design matrix
    let mut mtm = Mat::<f64>::zeros(12, 12);
    for (a, x) in alphas.iter().zip(points_normalized.iter()) {
        let mut rx = [0.0; 12];
        let mut ry = [0.0; 12];
        for j in 0..4 {
            rx[3 * j] = a[j];
            rx[3 * j + 2] = -a[j] * x.x;
            ry[3 * j + 1] = a[j];
            ry[3 * j + 2] = -a[j] * x.y;
        }
        for r in [rx, ry] {
            for i in 0..12 {
                if r[i] == 0.0 {
                    continue;
                }
                for j in 0..12 {
                    mtm.write(i, j, mtm.read(i, j) + r[i] * r[j]);
                }
            }
        }
    }

    let svd = mtm.svd();
    let v = svd.v();
    // null[k] is the right singular vector of the k-th smallest singular value
    let null: [[DVec3; 4]; 4] = std::array::from_fn(|k| {
        let col = 11 - k;
        std::array::from_fn(|c| {
            DVec3::new(
                v.read(3 * c, col),
                v.read(3 * c + 1, col),
                v.read(3 * c + 2, col),
            )
        })
    });

    let l = build_l6x10(&null);
    let rho = rho_ctrlpts(&cw);

    let candidates = [
        approximate_betas(&l, &rho, &[0, 1, 3, 6]),
        approximate_betas(&l, &rho, &[0, 1, 2]),
        approximate_betas(&l, &rho, &[0, 1, 2, 3, 4]),
    ];

    let mut best: Option<(f64, Rigid3)> = None;
    for betas in candidates.into_iter().flatten() {
        let betas = gauss_newton(betas, &null, &rho);
        let Some(pose) = pose_from_betas(&betas, &null, &alphas, points_world) else {
            continue;
        };
        let err = mean_sq_error(points_world, points_normalized, &pose);
        if best.as_ref().is_none_or(|(e, _)| err < *e) {
            best = Some((err, pose));
        }
    }

    best.map(|(_, pose)| pose).ok_or(PnPError::Degenerate)
}

fn select_control_points(points_world: &[DVec3]) -> [DVec3; 4] {
    let n = points_world.len() as f64;
    let c = points_world.iter().copied().sum::<DVec3>() / n;
    let cov = points_world
        .iter()
        .fold(DMat3::ZERO, |acc, p| acc + outer(*p - c, *p - c))
        * (1.0 / n);
    let (_, s, v) = svd3(&cov);
    [
        c,
        c + v.x_axis * s.x.sqrt(),
        c + v.y_axis * s.y.sqrt(),
        c + v.z_axis * s.z.sqrt(),
    ]
}

fn compute_barycentric(points_world: &[DVec3], cw: &[DVec3; 4]) -> Vec<[f64; 4]> {
    let b = DMat3::from_cols(cw[1] - cw[0], cw[2] - cw[0], cw[3] - cw[0]);
    let b_inv = if b.determinant().abs() > 1e-12 {
        b.inverse()
    } else {
        // Moore-Penrose pseudo-inverse for planar point sets
        let (u, s, v) = svd3(&b);
        let inv = |x: f64| if x.abs() > 1e-12 { 1.0 / x } else { 0.0 };
        v * DMat3::from_diagonal(DVec3::new(inv(s.x), inv(s.y), inv(s.z))) * u.transpose()
    };
    points_world
        .iter()
        .map(|p| {
            let l = b_inv * (*p - cw[0]);
            [1.0 - (l.x + l.y + l.z), l.x, l.y, l.z]
        })
        .collect()
}

fn build_l6x10(null: &[[DVec3; 4]; 4]) -> [[f64; 10]; 6] {
    let mut l = [[0.0; 10]; 6];
    for (row, &(a, b)) in l.iter_mut().zip(CP_PAIRS.iter()) {
        let d: [DVec3; 4] = std::array::from_fn(|k| null[k][a] - null[k][b]);
        *row = [
            d[0].dot(d[0]),
            2.0 * d[0].dot(d[1]),
            d[1].dot(d[1]),
            2.0 * d[0].dot(d[2]),
            2.0 * d[1].dot(d[2]),
            d[2].dot(d[2]),
            2.0 * d[0].dot(d[3]),
            2.0 * d[1].dot(d[3]),
            2.0 * d[2].dot(d[3]),
            d[3].dot(d[3]),
        ];
    }
    l
}

fn rho_ctrlpts(cw: &[DVec3; 4]) -> [f64; 6] {
    CP_PAIRS.map(|(i, j)| cw[i].distance_squared(cw[j]))
}

/// Initial betas from a column subset of `L`.
///
/// The subsets select `(b00, b01, b02, b03)`, `(b00, b01, b11)` and
/// `(b00, b01, b11, b02, b12)` of the ten quadratic terms.
fn approximate_betas(l: &[[f64; 10]; 6], rho: &[f64; 6], cols: &[usize]) -> Option<[f64; 4]> {
    let a = Mat::from_fn(6, cols.len(), |i, j| l[i][cols[j]]);
    let x = least_squares(a, rho);
    if x.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut beta = [0.0; 4];
    match cols.len() {
        4 => {
            if x[0].abs() < f64::EPSILON {
                return None;
            }
            let b0 = x[0].abs().sqrt();
            beta = [b0, x[1] / b0, x[2] / b0, x[3] / b0];
            if x[0] < 0.0 {
                beta.iter_mut().for_each(|b| *b = -*b);
            }
        }
        3 => {
            beta[0] = x[0].abs().sqrt();
            beta[1] = if x[0] * x[2] < 0.0 { 0.0 } else { x[2].abs().sqrt() };
            if x[1] < 0.0 {
                beta[0] = -beta[0];
            }
        }
        5 => {
            if x[0].abs() < f64::EPSILON {
                return None;
            }
            beta[0] = x[0].abs().sqrt();
            beta[1] = if x[0] * x[2] < 0.0 { 0.0 } else { x[2].abs().sqrt() };
            if x[1] < 0.0 {
                beta[0] = -beta[0];
            }
            beta[2] = x[3] / beta[0];
        }
        _ => return None,
    }
    Some(beta)
}

fn control_points_camera(betas: &[f64; 4], null: &[[DVec3; 4]; 4]) -> [DVec3; 4] {
    std::array::from_fn(|c| (0..4).map(|k| null[k][c] * betas[k]).sum())
}

fn gauss_newton(mut betas: [f64; 4], null: &[[DVec3; 4]; 4], rho: &[f64; 6]) -> [f64; 4] {
    for _ in 0..5 {
        let cc = control_points_camera(&betas, null);
        let mut jtj = Mat::<f64>::zeros(4, 4);
        let mut jtr = [0.0; 4];
        for (r, &(a, b)) in CP_PAIRS.iter().enumerate() {
            let diff = cc[a] - cc[b];
            let res = diff.length_squared() - rho[r];
            let jac: [f64; 4] = std::array::from_fn(|k| 2.0 * diff.dot(null[k][a] - null[k][b]));
            for i in 0..4 {
                jtr[i] += jac[i] * res;
                for j in 0..4 {
                    jtj.write(i, j, jtj.read(i, j) + jac[i] * jac[j]);
                }
            }
        }
        for i in 0..4 {
            jtj.write(i, i, jtj.read(i, i) + 1e-12);
        }
        let Some(delta) = solve_spd(&jtj, &jtr) else {
            break;
        };
        for (b, d) in betas.iter_mut().zip(delta.iter()) {
            *b -= d;
        }
        if delta.iter().map(|d| d * d).sum::<f64>() < 1e-20 {
            break;
        }
    }
    betas
}

fn pose_from_betas(
    betas: &[f64; 4],
    null: &[[DVec3; 4]; 4],
    alphas: &[[f64; 4]],
    points_world: &[DVec3],
) -> Option<Rigid3> {
    let cc = control_points_camera(betas, null);
    let mut points_cam = alphas
        .iter()
        .map(|a| (0..4).map(|j| cc[j] * a[j]).sum::<DVec3>())
        .collect::<Vec<_>>();

    if points_cam.iter().map(|p| p.z).sum::<f64>() < 0.0 {
        points_cam.iter_mut().for_each(|p| *p = -*p);
    }

    let n = points_world.len() as f64;
    let mw = points_world.iter().copied().sum::<DVec3>() / n;
    let mc = points_cam.iter().copied().sum::<DVec3>() / n;
    let cov = points_cam
        .iter()
        .zip(points_world.iter())
        .fold(DMat3::ZERO, |acc, (pc, pw)| acc + outer(*pc - mc, *pw - mw));
    let r = nearest_rotation(&cov);
    let t = mc - r * mw;
    let pose = Rigid3::from_matrix(&r, t);
    (pose.translation.is_finite() && pose.rotation.is_finite()).then_some(pose)
}

fn mean_sq_error(points_world: &[DVec3], points_normalized: &[DVec2], pose: &Rigid3) -> f64 {
    let sum = points_world
        .iter()
        .zip(points_normalized.iter())
        .map(|(pw, x)| {
            let pc = pose.transform_point(*pw);
            if pc.z <= f64::EPSILON {
                return f64::INFINITY;
            }
            (pc.truncate() / pc.z - *x).length_squared()
        })
        .sum::<f64>();
    sum / points_world.len() as f64
}
