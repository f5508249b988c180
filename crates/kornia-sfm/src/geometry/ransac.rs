//! Generic random sample consensus.

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

/// A minimal-sample model estimator usable inside [`ransac`].
pub trait Estimator {
    /// A single correspondence.
    type Datum: Copy;
    /// The estimated model.
    type Model: Clone;

    /// Number of data required by the minimal solver.
    const SAMPLE_SIZE: usize;

    /// Estimate zero or more models from at least `SAMPLE_SIZE` data.
    fn estimate(&self, data: &[Self::Datum]) -> Vec<Self::Model>;

    /// Squared residual of a datum under a model.
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> f64;
}

/// Parameters for RANSAC model estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacOptions {
    /// Inlier threshold on the (non-squared) residual.
    pub max_error: f64,
    /// Desired probability of drawing at least one outlier-free sample.
    pub confidence: f64,
    /// Minimum number of iterations.
    pub min_iterations: usize,
    /// Maximum number of iterations.
    pub max_iterations: usize,
    /// Optional RNG seed for deterministic runs.
    pub random_seed: Option<u64>,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_error: 4.0,
            confidence: 0.999,
            min_iterations: 50,
            max_iterations: 2000,
            random_seed: Some(0),
        }
    }
}

/// Result of a RANSAC model fit.
#[derive(Clone, Debug)]
pub struct RansacReport<M> {
    /// Estimated model.
    pub model: M,
    /// Per-datum inlier mask.
    pub inliers: Vec<bool>,
    /// Total inlier count.
    pub num_inliers: usize,
    /// Truncated squared error sum (lower is better).
    pub score: f64,
    /// Number of sampling iterations performed.
    pub num_trials: usize,
}

impl<M> RansacReport<M> {
    /// Ratio of inliers over all data.
    pub fn inlier_ratio(&self) -> f64 {
        if self.inliers.is_empty() {
            return 0.0;
        }
        self.num_inliers as f64 / self.inliers.len() as f64
    }
}

/// Number of iterations required to reach `confidence` with the given inlier ratio.
pub fn required_iterations(inlier_ratio: f64, sample_size: usize, confidence: f64) -> usize {
    let p_good = inlier_ratio.powi(sample_size as i32);
    if p_good >= 1.0 - f64::EPSILON {
        return 1;
    }
    if p_good <= f64::EPSILON {
        return usize::MAX;
    }
    let num = (1.0 - confidence).max(f64::EPSILON).ln();
    let denom = (1.0 - p_good).ln();
    (num / denom).ceil().max(1.0) as usize
}

struct Evaluation {
    inliers: Vec<bool>,
    num_inliers: usize,
    score: f64,
}

fn evaluate<E: Estimator>(
    estimator: &E,
    model: &E::Model,
    data: &[E::Datum],
    threshold_sq: f64,
) -> Evaluation {
    let mut inliers = vec![false; data.len()];
    let mut num_inliers = 0;
    let mut score = 0.0;
    for (datum, inlier) in data.iter().zip(inliers.iter_mut()) {
        let r = estimator.residual(model, datum);
        if r <= threshold_sq {
            *inlier = true;
            num_inliers += 1;
            score += r;
        } else {
            score += threshold_sq;
        }
    }
    Evaluation {
        inliers,
        num_inliers,
        score,
    }
}

fn is_better(candidate: &Evaluation, best: Option<&Evaluation>) -> bool {
    match best {
        None => candidate.num_inliers > 0,
        Some(b) => {
            candidate.num_inliers > b.num_inliers
                || (candidate.num_inliers == b.num_inliers && candidate.score < b.score)
        }
    }
}

/// Robustly estimate a model with adaptive RANSAC and a final refit on all inliers.
///
/// Returns `None` when fewer than `E::SAMPLE_SIZE` data are given or no model
/// explains any datum.
pub fn ransac<E: Estimator>(
    estimator: &E,
    data: &[E::Datum],
    options: &RansacOptions,
) -> Option<RansacReport<E::Model>> {
    let n = data.len();
    let k = E::SAMPLE_SIZE;
    if n < k {
        return None;
    }

    let mut rng = match options.random_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => {
            let mut tr = rand::rng();
            StdRng::from_rng(&mut tr)
        }
    };

    let threshold_sq = options.max_error * options.max_error;
    let mut best: Option<(E::Model, Evaluation)> = None;
    let mut max_trials = options.max_iterations.max(1);
    let mut num_trials = 0;
    let mut sample = Vec::with_capacity(k);

    while num_trials < max_trials {
        num_trials += 1;
        sample.clear();
        for idx in rand::seq::index::sample(&mut rng, n, k).iter() {
            sample.push(data[idx]);
        }

        for model in estimator.estimate(&sample) {
            let eval = evaluate(estimator, &model, data, threshold_sq);
            if is_better(&eval, best.as_ref().map(|(_, e)| e)) {
                let ratio = eval.num_inliers as f64 / n as f64;
                max_trials = required_iterations(ratio, k, options.confidence)
                    .max(options.min_iterations)
                    .min(options.max_iterations.max(1));
                best = Some((model, eval));
            }
        }
    }

    let (mut model, mut eval) = best?;

    // refit on the consensus set
    if eval.num_inliers > k {
        let consensus = data
            .iter()
            .zip(eval.inliers.iter())
            .filter(|(_, &inl)| inl)
            .map(|(d, _)| *d)
            .collect::<Vec<_>>();
        for refined in estimator.estimate(&consensus) {
            let refined_eval = evaluate(estimator, &refined, data, threshold_sq);
            if is_better(&refined_eval, Some(&eval)) {
                model = refined;
                eval = refined_eval;
            }
        }
    }

    Some(RansacReport {
        model,
        inliers: eval.inliers,
        num_inliers: eval.num_inliers,
        score: eval.score,
        num_trials,
    })
}
