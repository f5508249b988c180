//! Normal equations of the camera/point bipartite problem and their Schur complement solve.
//!
//! The parameters are split into a camera side (poses and intrinsics, indexed
//! densely) and 3x3 point blocks. The point blocks are eliminated and the
//! reduced camera system is factorized with a dense Cholesky decomposition.

use std::collections::BTreeMap;

use faer::Mat;
use glam::{DMat3, DVec2, DVec3};

use crate::linalg::{outer, solve_spd};

/// Weighted Jacobian and residual of one observation.
#[derive(Debug, Clone, Default)]
pub(crate) struct ObservationBlock {
    /// Camera side columns: reduced system index and `d(u, v) / d param`.
    pub cols: Vec<(usize, DVec2)>,
    /// Rows `d u / d X` and `d v / d X`.
    pub jp: [DVec3; 2],
    /// Residual `projected - observed`.
    pub residual: DVec2,
}

/// All observations of one point.
#[derive(Debug, Clone, Default)]
pub(crate) struct PointBlock {
    /// Whether the point position is optimized.
    pub variable: bool,
    pub observations: Vec<ObservationBlock>,
}

#[derive(Debug, Clone)]
pub(crate) struct PointSystem {
    d: DMat3,
    gp: DVec3,
    // rows of E = J_c^T J_p, keyed by camera side index
    e: Vec<(usize, DVec3)>,
}

/// Normal equations `H = J^T J`, `g = J^T r`.
#[derive(Debug, Clone)]
pub(crate) struct NormalEquations {
    a: Mat<f64>,
    gc: Vec<f64>,
    points: Vec<Option<PointSystem>>,
}

impl NormalEquations {
    /// Accumulate the normal equations of the linearized point blocks.
    pub fn assemble(blocks: &[PointBlock], num_params: usize) -> Self {
        let mut a = Mat::<f64>::zeros(num_params, num_params);
        let mut gc = vec![0.0; num_params];
        let mut points = Vec::with_capacity(blocks.len());

        for block in blocks {
            let mut d = DMat3::ZERO;
            let mut gp = DVec3::ZERO;
            let mut e: BTreeMap<usize, DVec3> = BTreeMap::new();
            for obs in &block.observations {
                let r = obs.residual;
                for &(i, ci) in &obs.cols {
                    gc[i] += ci.dot(r);
                    for &(j, cj) in &obs.cols {
                        a.write(i, j, a.read(i, j) + ci.dot(cj));
                    }
                }
                if block.variable {
                    let [ju, jv] = obs.jp;
                    d += outer(ju, ju) + outer(jv, jv);
                    gp += ju * r.x + jv * r.y;
                    for &(i, ci) in &obs.cols {
                        *e.entry(i).or_insert(DVec3::ZERO) += ju * ci.x + jv * ci.y;
                    }
                }
            }
            points.push(block.variable.then(|| PointSystem {
                d,
                gp,
                e: e.into_iter().collect(),
            }));
        }
        Self { a, gc, points }
    }

    /// Max-norm of the gradient `J^T r`.
    pub fn gradient_max_norm(&self) -> f64 {
        let camera = self.gc.iter().fold(0.0f64, |m, g| m.max(g.abs()));
        self.points
            .iter()
            .flatten()
            .fold(camera, |m, p| m.max(p.gp.abs().max_element()))
    }

    /// Whether all entries are finite.
    pub fn is_finite(&self) -> bool {
        self.gc.iter().all(|g| g.is_finite())
            && self
                .points
                .iter()
                .flatten()
                .all(|p| p.d.is_finite() && p.gp.is_finite())
    }

    /// Solve `(H + lambda diag(H)) delta = -g`.
    ///
    /// Returns the camera side step and one point step per block (zero for
    /// constant points), or `None` if the damped system is singular.
    pub fn solve(&self, lambda: f64) -> Option<(Vec<f64>, Vec<DVec3>)> {
        let n = self.gc.len();
        let mut s = self.a.clone();
        for i in 0..n {
            let d = self.a.read(i, i);
            s.write(i, i, d + lambda * d.max(1e-12));
        }
        let mut rhs = self.gc.iter().map(|g| -g).collect::<Vec<_>>();

        let mut inverses = Vec::with_capacity(self.points.len());
        for point in &self.points {
            let Some(p) = point else {
                inverses.push(None);
                continue;
            };
            let damping = DVec3::new(p.d.x_axis.x, p.d.y_axis.y, p.d.z_axis.z).max(DVec3::splat(1e-12));
            let damped = p.d + DMat3::from_diagonal(damping * lambda);
            let det = damped.determinant();
            if !det.is_finite() || det.abs() < 1e-18 {
                return None;
            }
            let d_inv = damped.inverse();
            let d_inv_gp = d_inv * p.gp;
            for &(i, ei) in &p.e {
                rhs[i] += ei.dot(d_inv_gp);
                let d_inv_ei = d_inv * ei;
                for &(j, ej) in &p.e {
                    s.write(j, i, s.read(j, i) - ej.dot(d_inv_ei));
                }
            }
            inverses.push(Some(d_inv));
        }

        let dc = if n > 0 { solve_spd(&s, &rhs)? } else { Vec::new() };

        let dp = self
            .points
            .iter()
            .zip(inverses)
            .map(|(point, d_inv)| match (point, d_inv) {
                (Some(p), Some(d_inv)) => {
                    let et_dc = p
                        .e
                        .iter()
                        .fold(DVec3::ZERO, |acc, &(i, ei)| acc + ei * dc[i]);
                    d_inv * (-p.gp - et_dc)
                }
                _ => DVec3::ZERO,
            })
            .collect::<Vec<_>>();

        dp.iter().all(|p| p.is_finite()).then_some((dc, dp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_blocks(rng: &mut StdRng, num_params: usize) -> Vec<PointBlock> {
        let mut uniform = move || -> f64 { rng.random_range(-1.0..1.0) };
        let mut blocks = Vec::new();
        for k in 0..6 {
            let mut observations = Vec::new();
            for _ in 0..3 {
                let mut cols = Vec::new();
                for i in 0..num_params {
                    if uniform() < 0.4 {
                        cols.push((i, DVec2::new(uniform(), uniform())));
                    }
                }
                observations.push(ObservationBlock {
                    cols,
                    jp: [
                        DVec3::new(uniform(), uniform(), uniform()),
                        DVec3::new(uniform(), uniform(), uniform()),
                    ],
                    residual: DVec2::new(uniform(), uniform()),
                });
            }
            blocks.push(PointBlock {
                variable: k != 5,
                observations,
            });
        }
        blocks
    }

    #[test]
    fn test_schur_matches_dense_solve() -> Result<(), Box<dyn std::error::Error>> {
        let mut rng = StdRng::seed_from_u64(3);
        let num_params = 4;
        let blocks = random_blocks(&mut rng, num_params);
        let lambda = 1e-2;

        // dense system over [camera params, variable points]
        let variable = blocks.iter().filter(|b| b.variable).count();
        let dim = num_params + 3 * variable;
        let mut h = Mat::<f64>::zeros(dim, dim);
        let mut g = vec![0.0; dim];
        let mut offset = num_params;
        for block in &blocks {
            for obs in &block.observations {
                let mut rows = [vec![0.0; dim], vec![0.0; dim]];
                for &(i, c) in &obs.cols {
                    rows[0][i] = c.x;
                    rows[1][i] = c.y;
                }
                if block.variable {
                    for k in 0..3 {
                        rows[0][offset + k] = obs.jp[0][k];
                        rows[1][offset + k] = obs.jp[1][k];
                    }
                }
                for (row, r) in rows.iter().zip([obs.residual.x, obs.residual.y]) {
                    for i in 0..dim {
                        g[i] += row[i] * r;
                        for j in 0..dim {
                            h.write(i, j, h.read(i, j) + row[i] * row[j]);
                        }
                    }
                }
            }
            if block.variable {
                offset += 3;
            }
        }
        let mut damped = h.clone();
        for i in 0..dim {
            damped.write(i, i, h.read(i, i) * (1.0 + lambda));
        }
        let rhs = g.iter().map(|v| -v).collect::<Vec<_>>();
        let dense = solve_spd(&damped, &rhs).ok_or("dense solve failed")?;

        let eq = NormalEquations::assemble(&blocks, num_params);
        let (dc, dp) = eq.solve(lambda).ok_or("schur solve failed")?;
        for i in 0..num_params {
            approx::assert_relative_eq!(dc[i], dense[i], epsilon = 1e-8);
        }
        let mut offset = num_params;
        for (block, step) in blocks.iter().zip(&dp) {
            if block.variable {
                for k in 0..3 {
                    approx::assert_relative_eq!(step[k], dense[offset + k], epsilon = 1e-8);
                }
                offset += 3;
            } else {
                assert_eq!(*step, DVec3::ZERO);
            }
        }
        Ok(())
    }

    #[test]
    fn test_points_only_system() -> Result<(), Box<dyn std::error::Error>> {
        let block = PointBlock {
            variable: true,
            observations: vec![
                ObservationBlock {
                    cols: Vec::new(),
                    jp: [DVec3::X, DVec3::Y],
                    residual: DVec2::new(1.0, -2.0),
                },
                ObservationBlock {
                    cols: Vec::new(),
                    jp: [DVec3::Z, DVec3::X],
                    residual: DVec2::new(0.5, 0.0),
                },
            ],
        };
        let eq = NormalEquations::assemble(&[block], 0);
        let (dc, dp) = eq.solve(0.0).ok_or("solve failed")?;
        assert!(dc.is_empty());
        // x is shared by two residuals, y and z by one each
        approx::assert_relative_eq!(dp[0].x, -0.5, epsilon = 1e-9);
        approx::assert_relative_eq!(dp[0].y, 2.0, epsilon = 1e-9);
        approx::assert_relative_eq!(dp[0].z, -0.5, epsilon = 1e-9);
        Ok(())
    }
}
