//! Robust linear regression backends.
//!
//! The expected-power model only needs `fit` and `predict`; [`HuberRegressor`] is the
//! concrete backend: standardized features, an unpenalized intercept, a small ridge
//! term on the coefficients and iteratively reweighted least squares with Huber weights.

use crate::issues::DataIssue;
use crate::stats::mad;
use nalgebra::{DMatrix, DVector};

/// Normal-distribution consistency constant for the MAD.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Fitted linear model in standardized feature space.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearFit {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    pub feature_means: Vec<f64>,
    pub feature_scales: Vec<f64>,
    /// Robust residual scale at the last iteration
    pub residual_scale: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl LinearFit {
    pub fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    pub fn predict_row(&self, row: &[f64]) -> f64 {
        self.coefficients
            .iter()
            .zip(row)
            .zip(self.feature_means.iter().zip(&self.feature_scales))
            .map(|((c, x), (m, s))| c * (x - m) / s)
            .sum::<f64>()
            + self.intercept
    }
}

pub trait RobustRegressor: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit(&self, features: &[Vec<f64>], target: &[f64]) -> Result<LinearFit, DataIssue>;

    fn predict(&self, fit: &LinearFit, features: &[Vec<f64>]) -> Vec<f64> {
        features.iter().map(|row| fit.predict_row(row)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct HuberRegressor {
    /// Residuals beyond `epsilon` robust standard deviations are down-weighted
    pub epsilon: f64,
    /// Ridge penalty on the standardized coefficients
    pub alpha: f64,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for HuberRegressor {
    fn default() -> Self {
        Self {
            epsilon: 1.35,
            alpha: 1e-4,
            max_iter: 100,
            tol: 1e-6,
        }
    }
}

impl HuberRegressor {
    pub fn new(epsilon: f64, alpha: f64) -> Self {
        Self {
            epsilon,
            alpha,
            ..Self::default()
        }
    }

    fn solve_weighted(&self, design: &[Vec<f64>], target: &[f64], weights: &[f64]) -> Option<DVector<f64>> {
        let k = design.first().map_or(0, Vec::len);
        let mut a = DMatrix::<f64>::zeros(k, k);
        let mut b = DVector::<f64>::zeros(k);

        for ((row, y), w) in design.iter().zip(target).zip(weights) {
            for i in 0..k {
                b[i] += w * row[i] * y;
                for j in i..k {
                    a[(i, j)] += w * row[i] * row[j];
                }
            }
        }
        for i in 0..k {
            for j in 0..i {
                a[(i, j)] = a[(j, i)];
            }
            // intercept stays unpenalized
            if i > 0 {
                a[(i, i)] += self.alpha;
            }
        }

        match a.clone().cholesky() {
            Some(chol) => Some(chol.solve(&b)),
            None => a.lu().solve(&b),
        }
    }
}

fn standardize(features: &[Vec<f64>], p: usize) -> (Vec<f64>, Vec<f64>) {
    let n = features.len() as f64;
    let means: Vec<f64> = (0..p)
        .map(|j| features.iter().map(|r| r[j]).sum::<f64>() / n)
        .collect();
    let scales: Vec<f64> = (0..p)
        .map(|j| {
            let var = features.iter().map(|r| (r[j] - means[j]).powi(2)).sum::<f64>() / n;
            let sd = var.sqrt();
            // constant features keep unit scale
            if sd > 1e-12 {
                sd
            } else {
                1.0
            }
        })
        .collect();
    (means, scales)
}

impl RobustRegressor for HuberRegressor {
    fn name(&self) -> &'static str {
        "huber_irls"
    }

    fn fit(&self, features: &[Vec<f64>], target: &[f64]) -> Result<LinearFit, DataIssue> {
        let n = features.len();
        if n == 0 || n != target.len() {
            return Err(DataIssue::InsufficientData(format!(
                "{} feature rows for {} targets",
                n,
                target.len()
            )));
        }
        let p = features[0].len();
        if features.iter().any(|r| r.len() != p) {
            return Err(DataIssue::FitFailed("ragged feature rows".to_string()));
        }
        if features.iter().flatten().chain(target).any(|v| !v.is_finite()) {
            return Err(DataIssue::FitFailed("non-finite training values".to_string()));
        }

        let (means, scales) = standardize(features, p);
        let design: Vec<Vec<f64>> = features
            .iter()
            .map(|r| {
                std::iter::once(1.0)
                    .chain((0..p).map(|j| (r[j] - means[j]) / scales[j]))
                    .collect()
            })
            .collect();

        let mut weights = vec![1.0; n];
        let mut beta = DVector::<f64>::zeros(p + 1);
        let mut residual_scale = 0.0;
        let mut iterations = 0;
        let mut converged = false;

        for iter in 1..=self.max_iter {
            iterations = iter;
            let next = self
                .solve_weighted(&design, target, &weights)
                .ok_or_else(|| DataIssue::FitFailed("singular weighted design matrix".to_string()))?;

            let residuals: Vec<f64> = design
                .iter()
                .zip(target)
                .map(|(row, y)| y - row.iter().zip(next.iter()).map(|(x, b)| x * b).sum::<f64>())
                .collect();

            let delta = (&next - &beta).amax();
            let size = next.amax();
            beta = next;

            residual_scale = mad(&residuals).map_or(0.0, |m| MAD_TO_SIGMA * m);
            if residual_scale <= 1e-12 {
                // (near-)exact fit, nothing left to reweight
                converged = true;
                break;
            }
            if iter > 1 && delta <= self.tol * (1.0 + size) {
                converged = true;
                break;
            }

            for (w, r) in weights.iter_mut().zip(&residuals) {
                let u = (r / residual_scale).abs();
                *w = if u <= self.epsilon { 1.0 } else { self.epsilon / u };
            }
        }

        if !converged {
            log::warn!(
                "{} did not converge after {} iterations",
                self.name(),
                iterations
            );
        }

        Ok(LinearFit {
            intercept: beta[0],
            coefficients: beta.iter().skip(1).copied().collect(),
            feature_means: means,
            feature_scales: scales,
            residual_scale,
            iterations,
            converged,
        })
    }
}
