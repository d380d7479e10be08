//! Quasi-likelihood dispersion squeezing.
//!
//! Gene-wise quasi-likelihood dispersions `s² = deviance / df` are noisy with
//! few samples. They are shrunk toward a common prior by empirical Bayes:
//! `log s²` is matched against a scaled F distribution by moments, giving a
//! prior value `s0²` and prior degrees of freedom `d0`. The posterior is
//!
//! ```text
//! s̃² = (d0 · s0² + df · s²) / (d0 + df)
//! ```
//!
//! and tests use `d0 + df` denominator degrees of freedom.
//!
//! # Reference
//!
//! Smyth GK. Linear models and empirical Bayes methods for assessing
//! differential expression in microarray experiments. SAGMB 3, 3 (2004).

use serde::{Deserialize, Serialize};
use statrs::function::gamma::digamma;

/// Variances at or below this are left out of the prior estimate.
const MIN_VARIANCE: f64 = 1e-12;

/// Prior for the gene-wise quasi-likelihood dispersions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QlPrior {
    /// Prior degrees of freedom; infinite when the observed spread is
    /// no larger than sampling noise.
    pub d0: f64,
    /// Prior dispersion.
    pub s0_sq: f64,
}

impl QlPrior {
    /// Posterior dispersion for a gene.
    pub fn posterior(&self, s_sq: f64, df: f64) -> f64 {
        if self.d0.is_infinite() {
            self.s0_sq
        } else {
            (self.d0 * self.s0_sq + df * s_sq) / (self.d0 + df)
        }
    }

    /// Total degrees of freedom for a gene's test.
    pub fn df_total(&self, df: f64) -> f64 {
        self.d0 + df
    }
}

/// Estimate the prior from gene-wise dispersions sharing `df` residual
/// degrees of freedom.
///
/// With fewer than two usable values, `d0 = 0` and no shrinkage happens.
pub fn fit_ql_prior(s_sq: &[f64], df: f64) -> QlPrior {
    let logs: Vec<f64> = s_sq
        .iter()
        .filter(|&&s| s.is_finite() && s > MIN_VARIANCE)
        .map(|s| s.ln())
        .collect();

    let n = logs.len();
    if n < 2 || df <= 0.0 {
        let s0_sq = if n == 0 {
            0.0
        } else {
            logs.iter().map(|l| l.exp()).sum::<f64>() / n as f64
        };
        return QlPrior { d0: 0.0, s0_sq };
    }

    let half_df = df / 2.0;
    let e: Vec<f64> = logs
        .iter()
        .map(|z| z - digamma(half_df) + half_df.ln())
        .collect();
    let e_mean = e.iter().sum::<f64>() / n as f64;
    let e_var = e.iter().map(|v| (v - e_mean).powi(2)).sum::<f64>() / (n - 1) as f64
        - trigamma(half_df);

    if e_var > 0.0 {
        let d0 = 2.0 * trigamma_inverse(e_var);
        let s0_sq = (e_mean + digamma(d0 / 2.0) - (d0 / 2.0).ln()).exp();
        QlPrior { d0, s0_sq }
    } else {
        QlPrior {
            d0: f64::INFINITY,
            s0_sq: e_mean.exp(),
        }
    }
}

/// Squeeze gene-wise dispersions toward their common prior.
///
/// Returns the prior and one posterior per input, in order.
pub fn squeeze_dispersions(s_sq: &[f64], df: f64) -> (QlPrior, Vec<f64>) {
    let prior = fit_ql_prior(s_sq, df);
    let posterior = s_sq.iter().map(|&s| prior.posterior(s, df)).collect();
    (prior, posterior)
}

/// Trigamma function, the derivative of digamma.
pub fn trigamma(x: f64) -> f64 {
    if x <= 0.0 || !x.is_finite() {
        return f64::NAN;
    }
    let mut z = x;
    let mut acc = 0.0;
    while z < 10.0 {
        acc += 1.0 / (z * z);
        z += 1.0;
    }
    let inv = 1.0 / z;
    let inv2 = inv * inv;
    acc + inv
        + inv2 / 2.0
        + inv * inv2 * (1.0 / 6.0 - inv2 * (1.0 / 30.0 - inv2 * (1.0 / 42.0 - inv2 / 30.0)))
}

/// Tetragamma function, the derivative of trigamma.
fn tetragamma(x: f64) -> f64 {
    let mut z = x;
    let mut acc = 0.0;
    while z < 10.0 {
        acc -= 2.0 / (z * z * z);
        z += 1.0;
    }
    let inv = 1.0 / z;
    let inv2 = inv * inv;
    acc - inv2 - inv2 * inv - inv2 * inv2 / 2.0
        + inv2 * inv2 * inv2 * (1.0 / 6.0 - inv2 * (1.0 / 6.0 - inv2 * 3.0 / 10.0))
}

/// Inverse of the trigamma function by Newton iteration.
pub fn trigamma_inverse(x: f64) -> f64 {
    if x > 1e7 {
        return 1.0 / x.sqrt();
    }
    if x < 1e-6 {
        return 1.0 / x;
    }

    let mut y = 0.5 + 1.0 / x;
    for _ in 0..50 {
        let tri = trigamma(y);
        let dif = tri * (1.0 - tri / x) / tetragamma(y);
        y += dif;
        if -dif / y < 1e-8 {
            break;
        }
    }
    y
}
