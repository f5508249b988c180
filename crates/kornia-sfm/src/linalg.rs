//! Small dense linear algebra helpers on top of `faer` and `glam`.

use faer::prelude::{SpSolver, SpSolverLstsq};
use faer::Mat;
use glam::{DMat3, DVec3};

/// Convert a glam matrix to a faer matrix.
pub(crate) fn mat3_to_faer(m: &DMat3) -> Mat<f64> {
    let cols = m.to_cols_array_2d();
    Mat::from_fn(3, 3, |i, j| cols[j][i])
}

/// Singular value decomposition `m = u * diag(s) * v^T` with `s` sorted descending.
pub(crate) fn svd3(m: &DMat3) -> (DMat3, DVec3, DMat3) {
    let svd = mat3_to_faer(m).svd();
    let (u, s, v) = (svd.u(), svd.s_diagonal(), svd.v());
    let col = |a: faer::MatRef<'_, f64>, j: usize| DVec3::new(a.read(0, j), a.read(1, j), a.read(2, j));
    (
        DMat3::from_cols(col(u, 0), col(u, 1), col(u, 2)),
        DVec3::new(s.read(0), s.read(1), s.read(2)),
        DMat3::from_cols(col(v, 0), col(v, 1), col(v, 2)),
    )
}

/// Closest rotation matrix in the Frobenius sense.
pub(crate) fn nearest_rotation(m: &DMat3) -> DMat3 {
    let (u, _, v) = svd3(m);
    let d = (u * v.transpose()).determinant().signum();
    u * DMat3::from_diagonal(DVec3::new(1.0, 1.0, d)) * v.transpose()
}

/// Unit vector minimizing `|A x|` for the stacked rows of `A`.
///
/// Computed from the normal matrix `A^T A`, which keeps the decomposition at
/// `N x N` regardless of the number of rows.
pub(crate) fn smallest_right_singular_vector<const N: usize>(rows: &[[f64; N]]) -> [f64; N] {
    let mut ata = Mat::<f64>::zeros(N, N);
    for row in rows {
        for i in 0..N {
            for j in i..N {
                ata.write(i, j, ata.read(i, j) + row[i] * row[j]);
            }
        }
    }
    for i in 0..N {
        for j in 0..i {
            ata.write(i, j, ata.read(j, i));
        }
    }
    let svd = ata.svd();
    let v = svd.v();
    let mut out = [0.0; N];
    for (i, o) in out.iter_mut().enumerate() {
        *o = v.read(i, N - 1);
    }
    out
}

/// Solve the symmetric positive definite system `a x = b` with a Cholesky factorization.
///
/// Returns `None` when the matrix is not positive definite or the solution is not finite.
pub(crate) fn solve_spd(a: &Mat<f64>, b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    let llt = a.cholesky(faer::Side::Lower).ok()?;
    let rhs = Mat::from_fn(n, 1, |i, _| b[i]);
    let x = llt.solve(&rhs);
    let out = (0..n).map(|i| x.read(i, 0)).collect::<Vec<_>>();
    out.iter().all(|v| v.is_finite()).then_some(out)
}

/// Least squares solution of `a x = b` via QR.
pub(crate) fn least_squares(a: Mat<f64>, b: &[f64]) -> Vec<f64> {
    let rhs = Mat::from_fn(b.len(), 1, |i, _| b[i]);
    let x = a.qr().solve_lstsq(rhs);
    (0..x.nrows()).map(|i| x.read(i, 0)).collect()
}

/// Outer product `a b^T`.
pub(crate) fn outer(a: DVec3, b: DVec3) -> DMat3 {
    DMat3::from_cols(a * b.x, a * b.y, a * b.z)
}
