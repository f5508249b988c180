//! Robust loss functions applied to squared reprojection errors.

use serde::{Deserialize, Serialize};

/// Robust loss `rho(s)` over a squared residual norm `s`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum LossFunction {
    /// Plain least squares, `rho(s) = s`.
    #[default]
    Trivial,
    /// Quadratic up to `scale` pixels, linear beyond.
    Huber {
        /// Residual norm where the loss becomes linear.
        scale: f64,
    },
    /// `rho(s) = c^2 log(1 + s / c^2)`.
    Cauchy {
        /// Residual norm of the soft cutoff.
        scale: f64,
    },
}

impl LossFunction {
    /// Loss value for a squared residual norm.
    pub fn rho(&self, squared_norm: f64) -> f64 {
        match *self {
            LossFunction::Trivial => squared_norm,
            LossFunction::Huber { scale } => {
                let b = scale * scale;
                if squared_norm <= b {
                    squared_norm
                } else {
                    2.0 * scale * squared_norm.sqrt() - b
                }
            }
            LossFunction::Cauchy { scale } => {
                let b = scale * scale;
                b * (squared_norm / b).ln_1p()
            }
        }
    }

    /// Derivative `rho'(s)`, used as the IRLS weight of a residual.
    pub fn weight(&self, squared_norm: f64) -> f64 {
        match *self {
            LossFunction::Trivial => 1.0,
            LossFunction::Huber { scale } => {
                if squared_norm <= scale * scale {
                    1.0
                } else {
                    scale / squared_norm.sqrt()
                }
            }
            LossFunction::Cauchy { scale } => 1.0 / (1.0 + squared_norm / (scale * scale)),
        }
    }

    /// Whether the loss parameters are usable.
    pub fn is_valid(&self) -> bool {
        match *self {
            LossFunction::Trivial => true,
            LossFunction::Huber { scale } | LossFunction::Cauchy { scale } => {
                scale.is_finite() && scale > 0.0
            }
        }
    }
}
