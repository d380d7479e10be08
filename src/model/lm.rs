//! Linear model fitting via OLS.
//!
//! Used for pseudobulk matrices of averaged log-expression, where counts
//! models do not apply.

use crate::error::{PbdsError, Result};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Results from fitting a linear model to a single gene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmFitSingle {
    pub gene_id: String,
    /// Estimated coefficients.
    pub coefficients: Vec<f64>,
    /// Standard errors of coefficients.
    pub std_errors: Vec<f64>,
    /// Residuals.
    #[serde(skip)]
    pub residuals: Vec<f64>,
    /// Residual standard error (sigma).
    pub sigma: f64,
    /// R-squared.
    pub r_squared: f64,
    /// Degrees of freedom (residual).
    pub df_residual: usize,
}

impl LmFitSingle {
    /// Estimate of `c'beta`.
    pub fn contrast_estimate(&self, contrast: &DVector<f64>) -> f64 {
        self.coefficients
            .iter()
            .zip(contrast.iter())
            .map(|(b, c)| b * c)
            .sum()
    }
}

/// Results from fitting linear models to all genes.
#[derive(Debug, Clone)]
pub struct LmFit {
    pub fits: Vec<LmFitSingle>,
    /// `(X'X)^-1`, shared by every gene.
    pub xtx_inv: DMatrix<f64>,
    pub n_samples: usize,
}

impl LmFit {
    /// Get the fit for a specific gene by ID.
    pub fn get_gene(&self, gene_id: &str) -> Option<&LmFitSingle> {
        self.fits.iter().find(|f| f.gene_id == gene_id)
    }

    pub fn n_genes(&self) -> usize {
        self.fits.len()
    }

    /// Unscaled variance `c'(X'X)^-1 c` of a contrast.
    pub fn contrast_unscaled_variance(&self, contrast: &DVector<f64>) -> f64 {
        (contrast.transpose() * &self.xtx_inv * contrast)[(0, 0)]
    }
}

/// Fit linear models to every row of `data`.
///
/// # Arguments
/// * `data` - Expression matrix (genes × samples)
/// * `gene_ids` - One identifier per row
/// * `design` - Design matrix (samples × coefficients)
///
/// # Returns
/// LmFit containing results for all genes.
pub fn model_lm(data: &DMatrix<f64>, gene_ids: &[String], design: &DMatrix<f64>) -> Result<LmFit> {
    let n_samples = data.ncols();
    let n_coef = design.ncols();

    if design.nrows() != n_samples {
        return Err(PbdsError::DimensionMismatch {
            expected: n_samples,
            actual: design.nrows(),
        });
    }
    if gene_ids.len() != data.nrows() {
        return Err(PbdsError::DimensionMismatch {
            expected: data.nrows(),
            actual: gene_ids.len(),
        });
    }

    let df_residual = n_samples.saturating_sub(n_coef);
    if df_residual == 0 {
        return Err(PbdsError::Numerical(
            "Model is saturated (n_samples <= n_coefficients)".to_string(),
        ));
    }

    let xtx = design.transpose() * design;
    let xtx_inv = xtx.try_inverse().ok_or_else(|| {
        PbdsError::Numerical("Design matrix is singular (X'X not invertible)".to_string())
    })?;

    let fits: Vec<LmFitSingle> = (0..data.nrows())
        .into_par_iter()
        .map(|i| {
            let y: Vec<f64> = data.row(i).iter().copied().collect();
            fit_single_gene(&y, &gene_ids[i], design, &xtx_inv, df_residual)
        })
        .collect();

    Ok(LmFit {
        fits,
        xtx_inv,
        n_samples,
    })
}

/// Fit a single gene using pre-computed (X'X)^-1.
fn fit_single_gene(
    y: &[f64],
    gene_id: &str,
    x: &DMatrix<f64>,
    xtx_inv: &DMatrix<f64>,
    df_residual: usize,
) -> LmFitSingle {
    let y_vec = DVector::from_column_slice(y);

    let beta = xtx_inv * (x.transpose() * &y_vec);
    let residuals_vec = &y_vec - x * &beta;
    let rss: f64 = residuals_vec.iter().map(|e| e * e).sum();
    let sigma = (rss / df_residual as f64).sqrt();

    let std_errors: Vec<f64> = (0..x.ncols())
        .map(|j| sigma * xtx_inv[(j, j)].sqrt())
        .collect();

    let y_mean = y_vec.mean();
    let tss: f64 = y.iter().map(|yi| (yi - y_mean).powi(2)).sum();
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };

    LmFitSingle {
        gene_id: gene_id.to_string(),
        coefficients: beta.iter().copied().collect(),
        std_errors,
        residuals: residuals_vec.iter().copied().collect(),
        sigma,
        r_squared,
        df_residual,
    }
}
