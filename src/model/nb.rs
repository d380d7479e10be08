//! Negative Binomial GLM for pseudobulk counts.
//!
//! Implements a negative binomial generalized linear model with log link and
//! per-sample offsets (log effective library sizes). The dispersion is
//! supplied by the caller and shared by every gene of a cluster; the
//! variance function is `mu + phi * mu^2`, so `phi = 0` is Poisson.

use crate::error::{PbdsError, Result};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Maximum iterations for IRLS convergence.
const MAX_ITER: usize = 25;

/// Convergence tolerance on the relative deviance change.
const TOL: f64 = 1e-8;

/// Minimum value for mean to avoid log(0).
const MIN_MU: f64 = 1e-10;

/// Step-halving attempts when the deviance increases.
const MAX_HALVING: usize = 10;

/// Dispersions below this are treated as Poisson.
const POISSON_DISP: f64 = 1e-10;

/// Results from fitting a negative binomial model to a single gene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbFitSingle {
    pub gene_id: String,
    /// Estimated coefficients (natural log scale).
    pub coefficients: Vec<f64>,
    /// Residual deviance.
    pub deviance: f64,
    /// Number of iterations to convergence.
    pub iterations: usize,
    /// Whether the fit converged.
    pub converged: bool,
    /// NB dispersion the gene was fitted with.
    pub dispersion: f64,
    /// Fitted values (predicted means).
    #[serde(skip)]
    pub fitted_values: Vec<f64>,
    /// `(X'WX)^-1` at the final iterate.
    #[serde(skip)]
    pub covariance: Option<DMatrix<f64>>,
}

impl NbFitSingle {
    /// Variance of the linear combination `c'beta`.
    pub fn contrast_variance(&self, contrast: &DVector<f64>) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        if cov.nrows() != contrast.len() {
            return None;
        }
        Some((contrast.transpose() * cov * contrast)[(0, 0)])
    }

    /// Estimate of `c'beta`.
    pub fn contrast_estimate(&self, contrast: &DVector<f64>) -> f64 {
        self.coefficients
            .iter()
            .zip(contrast.iter())
            .map(|(b, c)| b * c)
            .sum()
    }
}

/// Results from fitting negative binomial models to all genes of a cluster.
#[derive(Debug, Clone)]
pub struct NbFit {
    pub fits: Vec<NbFitSingle>,
    pub n_samples: usize,
    pub df_residual: usize,
}

impl NbFit {
    /// Get the fit for a specific gene by ID.
    pub fn get_gene(&self, gene_id: &str) -> Option<&NbFitSingle> {
        self.fits.iter().find(|f| f.gene_id == gene_id)
    }

    pub fn n_genes(&self) -> usize {
        self.fits.len()
    }

    /// Residual deviances, in gene order.
    pub fn deviances(&self) -> Vec<f64> {
        self.fits.iter().map(|f| f.deviance).collect()
    }

    /// Check if all fits converged.
    pub fn all_converged(&self) -> bool {
        self.fits.iter().all(|f| f.converged)
    }

    /// Count how many fits converged.
    pub fn n_converged(&self) -> usize {
        self.fits.iter().filter(|f| f.converged).count()
    }
}

/// Fit a negative binomial GLM to every gene with a shared dispersion.
///
/// Uses Iteratively Reweighted Least Squares (IRLS) with a log link,
/// deviance-based convergence and step-halving.
///
/// # Arguments
/// * `counts` - Count matrix (genes × samples)
/// * `gene_ids` - One identifier per row of `counts`
/// * `design` - Design matrix (samples × coefficients)
/// * `offsets` - Log effective library size per sample
/// * `dispersion` - Shared NB dispersion `phi`
///
/// # Returns
/// NbFit containing results for all genes.
pub fn model_nb(
    counts: &DMatrix<f64>,
    gene_ids: &[String],
    design: &DMatrix<f64>,
    offsets: &DVector<f64>,
    dispersion: f64,
) -> Result<NbFit> {
    model_nb_genewise(
        counts,
        gene_ids,
        design,
        offsets,
        &vec![dispersion; counts.nrows()],
    )
}

/// Fit a negative binomial GLM to every gene, each with its own dispersion.
///
/// `dispersions` holds one value per row of `counts`.
pub fn model_nb_genewise(
    counts: &DMatrix<f64>,
    gene_ids: &[String],
    design: &DMatrix<f64>,
    offsets: &DVector<f64>,
    dispersions: &[f64],
) -> Result<NbFit> {
    let n_samples = counts.ncols();
    let n_coef = design.ncols();

    if design.nrows() != n_samples {
        return Err(PbdsError::DimensionMismatch {
            expected: n_samples,
            actual: design.nrows(),
        });
    }
    if offsets.len() != n_samples {
        return Err(PbdsError::DimensionMismatch {
            expected: n_samples,
            actual: offsets.len(),
        });
    }
    if gene_ids.len() != counts.nrows() {
        return Err(PbdsError::DimensionMismatch {
            expected: counts.nrows(),
            actual: gene_ids.len(),
        });
    }
    if dispersions.len() != counts.nrows() {
        return Err(PbdsError::DimensionMismatch {
            expected: counts.nrows(),
            actual: dispersions.len(),
        });
    }
    if let Some(bad) = dispersions.iter().find(|d| !d.is_finite() || **d < 0.0) {
        return Err(PbdsError::InvalidParameter(format!(
            "Dispersion must be a non-negative number, got {}",
            bad
        )));
    }

    let df_residual = n_samples.saturating_sub(n_coef);

    let fits: Vec<NbFitSingle> = (0..counts.nrows())
        .into_par_iter()
        .map(|i| {
            let y: Vec<f64> = counts.row(i).iter().copied().collect();
            fit_single_nb(&y, &gene_ids[i], design, offsets, dispersions[i])
        })
        .collect();

    Ok(NbFit {
        fits,
        n_samples,
        df_residual,
    })
}

/// Fit negative binomial model to a single gene using IRLS.
pub fn fit_single_nb(
    y: &[f64],
    gene_id: &str,
    x: &DMatrix<f64>,
    offsets: &DVector<f64>,
    dispersion: f64,
) -> NbFitSingle {
    let n_samples = y.len();
    let n_coef = x.ncols();
    let y_vec = DVector::from_column_slice(y);

    let failed = |beta: &DVector<f64>, iterations: usize| NbFitSingle {
        gene_id: gene_id.to_string(),
        coefficients: beta.iter().copied().collect(),
        deviance: f64::NAN,
        iterations,
        converged: false,
        dispersion,
        fitted_values: vec![f64::NAN; n_samples],
        covariance: None,
    };

    // Start from least squares on log(y + 0.1) - offset
    let z0 = DVector::from_iterator(
        n_samples,
        (0..n_samples).map(|i| (y[i] + 0.1).ln() - offsets[i]),
    );
    let ones = DVector::from_element(n_samples, 1.0);
    let mut beta = match weighted_solve(x, &ones, &z0) {
        Some(b) => b,
        None => return failed(&DVector::zeros(n_coef), 0),
    };

    let mut mu = compute_mu(x, &beta, offsets);
    let mut deviance = nb_deviance(&y_vec, &mu, dispersion);

    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..MAX_ITER {
        iterations = iter + 1;

        // Working weights W = mu / (1 + phi * mu), response z = eta - offset + (y - mu) / mu
        let w = DVector::from_iterator(
            n_samples,
            mu.iter().map(|&m| m / (1.0 + dispersion * m)),
        );
        let eta = x * &beta;
        let z = DVector::from_iterator(
            n_samples,
            (0..n_samples).map(|i| eta[i] + (y_vec[i] - mu[i]) / mu[i]),
        );

        let Some(mut beta_new) = weighted_solve(x, &w, &z) else {
            return failed(&beta, iterations);
        };

        let mut mu_new = compute_mu(x, &beta_new, offsets);
        let mut dev_new = nb_deviance(&y_vec, &mu_new, dispersion);

        let mut halvings = 0;
        while !(dev_new.is_finite() && dev_new <= deviance * (1.0 + 1e-12) + 1e-12)
            && halvings < MAX_HALVING
        {
            beta_new = (&beta + &beta_new) * 0.5;
            mu_new = compute_mu(x, &beta_new, offsets);
            dev_new = nb_deviance(&y_vec, &mu_new, dispersion);
            halvings += 1;
        }

        let change = (deviance - dev_new).abs() / (dev_new.abs() + 0.1);
        beta = beta_new;
        mu = mu_new;
        deviance = dev_new;

        if change < TOL {
            converged = true;
            break;
        }
    }

    let w_final = DVector::from_iterator(
        n_samples,
        mu.iter().map(|&m| m / (1.0 + dispersion * m)),
    );
    let covariance = weighted_cross_product(x, &w_final).try_inverse();

    NbFitSingle {
        gene_id: gene_id.to_string(),
        coefficients: beta.iter().copied().collect(),
        deviance,
        iterations,
        converged,
        dispersion,
        fitted_values: mu.iter().copied().collect(),
        covariance,
    }
}

/// `X'WX` for a diagonal weight vector.
fn weighted_cross_product(x: &DMatrix<f64>, w: &DVector<f64>) -> DMatrix<f64> {
    let mut xw = x.clone();
    for (i, mut row) in xw.row_iter_mut().enumerate() {
        row *= w[i];
    }
    x.transpose() * xw
}

/// Solve the weighted normal equations `(X'WX) b = X'Wz`.
fn weighted_solve(x: &DMatrix<f64>, w: &DVector<f64>, z: &DVector<f64>) -> Option<DVector<f64>> {
    let xtwx = weighted_cross_product(x, w);
    let wz = w.component_mul(z);
    let xtwz = x.transpose() * wz;

    match xtwx.clone().cholesky() {
        Some(chol) => Some(chol.solve(&xtwz)),
        None => xtwx.try_inverse().map(|inv| inv * xtwz),
    }
}

/// Compute mu = exp(X * beta + offset).
fn compute_mu(x: &DMatrix<f64>, beta: &DVector<f64>, offsets: &DVector<f64>) -> DVector<f64> {
    let eta = x * beta + offsets;
    DVector::from_iterator(eta.len(), eta.iter().map(|e| e.exp().max(MIN_MU)))
}

/// Unit deviance of one observation.
///
/// `2 [y log(y/mu) - (y + 1/phi) log((1 + phi y) / (1 + phi mu))]`, with the
/// Poisson form `2 [y log(y/mu) - (y - mu)]` when `phi` is zero.
pub fn nb_unit_deviance(y: f64, mu: f64, dispersion: f64) -> f64 {
    let m = mu.max(MIN_MU);
    let y_log = if y > 0.0 { y * (y / m).ln() } else { 0.0 };

    let dev = if dispersion < POISSON_DISP {
        2.0 * (y_log - (y - m))
    } else {
        let r = 1.0 / dispersion;
        2.0 * (y_log - (y + r) * ((dispersion * y).ln_1p() - (dispersion * m).ln_1p()))
    };
    dev.max(0.0)
}

/// Total deviance of a fit.
pub fn nb_deviance(y: &DVector<f64>, mu: &DVector<f64>, dispersion: f64) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| nb_unit_deviance(yi, mi, dispersion))
        .sum()
}
