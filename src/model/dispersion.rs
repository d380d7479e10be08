//! Negative binomial dispersion for a cluster.
//!
//! The common dispersion is shared by all genes of a cluster. It is chosen
//! so that the pooled Pearson statistic of the gene-wise fits equals its
//! expected value, the total residual degrees of freedom. Fits and the
//! moment equation alternate for a fixed number of passes, starting from a
//! Poisson fit.
//!
//! Gene-wise (tagwise) dispersions maximise each gene's Cox-Reid adjusted
//! profile likelihood plus `prior_df / df_residual` times the cluster's
//! average likelihood, which shrinks them toward the common value.

use crate::error::{PbdsError, Result};
use crate::model::nb::model_nb;
use nalgebra::{DMatrix, DVector};
use statrs::function::gamma::ln_gamma;
use tracing::debug;

/// Lower bound on the estimate (near-Poisson).
pub const MIN_DISPERSION: f64 = 1e-6;

/// Upper bound on the estimate.
pub const MAX_DISPERSION: f64 = 10.0;

/// Fit / moment-match alternations.
const PASSES: usize = 2;

/// Bisection iterations.
const MAX_BISECT: usize = 100;

/// Default prior degrees of freedom for gene-wise shrinkage.
pub const TAGWISE_PRIOR_DF: f64 = 10.0;

/// Grid points for the gene-wise search.
const GRID_POINTS: usize = 21;

/// Half-width of the gene-wise grid, in `log2` units around the common value.
const GRID_SPAN_LOG2: f64 = 10.0;

/// Estimate a common dispersion by Pearson moment matching.
///
/// # Arguments
/// * `counts` - Count matrix (genes × samples)
/// * `design` - Design matrix (samples × coefficients)
/// * `offsets` - Log effective library size per sample
///
/// # Returns
/// The dispersion, clamped to `[MIN_DISPERSION, MAX_DISPERSION]`.
pub fn estimate_common_dispersion(
    counts: &DMatrix<f64>,
    design: &DMatrix<f64>,
    offsets: &DVector<f64>,
) -> Result<f64> {
    let n_samples = counts.ncols();
    let df_residual = n_samples.saturating_sub(design.ncols());
    if df_residual == 0 {
        return Err(PbdsError::InvalidParameter(
            "Dispersion needs residual degrees of freedom (n_samples > n_coefficients)"
                .to_string(),
        ));
    }
    if counts.nrows() == 0 {
        return Err(PbdsError::InvalidParameter(
            "Dispersion needs at least one gene".to_string(),
        ));
    }

    let gene_ids: Vec<String> = (0..counts.nrows()).map(|i| i.to_string()).collect();
    let mut dispersion = 0.0;

    for pass in 0..PASSES {
        let fit = model_nb(counts, &gene_ids, design, offsets, dispersion)?;

        let mut pairs: Vec<(f64, f64)> = Vec::new();
        let mut n_used = 0usize;
        for (i, gene_fit) in fit.fits.iter().enumerate() {
            if !gene_fit.deviance.is_finite() {
                continue;
            }
            n_used += 1;
            pairs.extend(
                counts
                    .row(i)
                    .iter()
                    .zip(&gene_fit.fitted_values)
                    .map(|(&y, &mu)| (y, mu)),
            );
        }

        if n_used == 0 {
            return Err(PbdsError::Numerical(
                "No gene could be fitted while estimating dispersion".to_string(),
            ));
        }

        let target = (n_used * df_residual) as f64;
        dispersion = solve_pearson(&pairs, target);
        debug!(pass, genes = n_used, dispersion, "Common dispersion update");
    }

    Ok(dispersion)
}

/// Estimate gene-wise dispersions shrunk toward a common value.
///
/// For each dispersion on a log-spaced grid around `common`, every gene is
/// fitted and its adjusted profile likelihood evaluated. Each gene takes the
/// maximiser of its own likelihood plus `prior_df / df_residual` times the
/// mean likelihood over genes, refined by a parabola through the grid
/// neighbours. Genes that could not be fitted keep `common`.
///
/// # Arguments
/// * `counts` - Count matrix (genes × samples)
/// * `design` - Design matrix (samples × coefficients)
/// * `offsets` - Log effective library size per sample
/// * `common` - Common dispersion the estimates shrink toward
/// * `prior_df` - Weight of the common likelihood, in degrees of freedom
pub fn estimate_tagwise_dispersion(
    counts: &DMatrix<f64>,
    design: &DMatrix<f64>,
    offsets: &DVector<f64>,
    common: f64,
    prior_df: f64,
) -> Result<Vec<f64>> {
    let n_genes = counts.nrows();
    let df_residual = counts.ncols().saturating_sub(design.ncols());
    if df_residual == 0 {
        return Err(PbdsError::InvalidParameter(
            "Dispersion needs residual degrees of freedom (n_samples > n_coefficients)"
                .to_string(),
        ));
    }
    if !common.is_finite() || common < 0.0 {
        return Err(PbdsError::InvalidParameter(format!(
            "Common dispersion must be a non-negative number, got {}",
            common
        )));
    }
    if !prior_df.is_finite() || prior_df < 0.0 {
        return Err(PbdsError::InvalidParameter(format!(
            "prior_df must be a non-negative number, got {}",
            prior_df
        )));
    }

    let center = common.clamp(MIN_DISPERSION, MAX_DISPERSION).ln();
    let span = GRID_SPAN_LOG2 * std::f64::consts::LN_2;
    let lo = (center - span).max(MIN_DISPERSION.ln());
    let hi = (center + span).min(MAX_DISPERSION.ln());
    let step = (hi - lo) / (GRID_POINTS - 1) as f64;
    let grid: Vec<f64> = (0..GRID_POINTS).map(|k| lo + step * k as f64).collect();

    let gene_ids: Vec<String> = (0..n_genes).map(|i| i.to_string()).collect();

    // apl[k][g]: adjusted profile likelihood of gene g at grid point k
    let mut apl: Vec<Vec<f64>> = Vec::with_capacity(GRID_POINTS);
    for &log_phi in &grid {
        let phi = log_phi.exp();
        let fit = model_nb(counts, &gene_ids, design, offsets, phi)?;
        let row = fit
            .fits
            .iter()
            .enumerate()
            .map(|(g, gene_fit)| {
                let y: Vec<f64> = counts.row(g).iter().copied().collect();
                adjusted_profile_ll(&y, &gene_fit.fitted_values, design, phi)
            })
            .collect();
        apl.push(row);
    }

    let prior_n = prior_df / df_residual as f64;
    let prior_ll: Vec<f64> = apl
        .iter()
        .map(|row| {
            let finite: Vec<f64> = row.iter().copied().filter(|l| l.is_finite()).collect();
            if finite.is_empty() {
                0.0
            } else {
                finite.iter().sum::<f64>() / finite.len() as f64
            }
        })
        .collect();

    let dispersions: Vec<f64> = (0..n_genes)
        .map(|g| {
            let weighted: Vec<f64> = (0..GRID_POINTS)
                .map(|k| apl[k][g] + prior_n * prior_ll[k])
                .collect();
            maximise_on_grid(&grid, &weighted)
                .map(|log_phi| log_phi.exp().clamp(MIN_DISPERSION, MAX_DISPERSION))
                .unwrap_or(common)
        })
        .collect();

    debug!(
        genes = n_genes,
        common,
        prior_df,
        "Gene-wise dispersions estimated"
    );
    Ok(dispersions)
}

/// Grid maximiser refined by the vertex of the parabola through its neighbours.
///
/// Returns `None` when no grid value is finite.
fn maximise_on_grid(grid: &[f64], values: &[f64]) -> Option<f64> {
    let (best, _) = values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))?;

    if best == 0 || best + 1 == values.len() {
        return Some(grid[best]);
    }
    let (l0, l1, l2) = (values[best - 1], values[best], values[best + 1]);
    let curvature = l0 - 2.0 * l1 + l2;
    if !(l0.is_finite() && l2.is_finite()) || curvature >= 0.0 {
        return Some(grid[best]);
    }
    let h = grid[best + 1] - grid[best];
    let shift = (0.5 * h * (l0 - l2) / curvature).clamp(-h, h);
    Some(grid[best] + shift)
}

/// Cox-Reid adjusted profile log-likelihood of one gene at dispersion `phi`.
///
/// Terms constant in `phi` are dropped. NaN when the fit failed or `X'WX`
/// is not positive definite.
fn adjusted_profile_ll(y: &[f64], mu: &[f64], design: &DMatrix<f64>, phi: f64) -> f64 {
    if mu.iter().any(|m| !m.is_finite()) {
        return f64::NAN;
    }
    let r = 1.0 / phi;
    let ll: f64 = y
        .iter()
        .zip(mu)
        .map(|(&y, &mu)| {
            let log1p_phi_mu = (phi * mu).ln_1p();
            ln_gamma(y + r) - ln_gamma(r) + y * ((phi * mu).ln() - log1p_phi_mu)
                - r * log1p_phi_mu
        })
        .sum();

    let n_coef = design.ncols();
    let mut xtwx = DMatrix::<f64>::zeros(n_coef, n_coef);
    for (i, row) in design.row_iter().enumerate() {
        let w = mu[i] / (1.0 + phi * mu[i]);
        xtwx += row.transpose() * row * w;
    }
    match xtwx.cholesky() {
        Some(chol) => {
            let log_det: f64 = chol.l().diagonal().iter().map(|d| 2.0 * d.ln()).sum();
            ll - 0.5 * log_det
        }
        None => f64::NAN,
    }
}

/// Pooled Pearson statistic at a given dispersion with the means held fixed.
fn pearson_at(pairs: &[(f64, f64)], dispersion: f64) -> f64 {
    pairs
        .iter()
        .map(|&(y, mu)| {
            let resid = y - mu;
            resid * resid / (mu * (1.0 + dispersion * mu))
        })
        .sum()
}

/// Bisection on the decreasing function `pearson(phi) - target`.
fn solve_pearson(pairs: &[(f64, f64)], target: f64) -> f64 {
    if pearson_at(pairs, MIN_DISPERSION) <= target {
        return MIN_DISPERSION;
    }
    if pearson_at(pairs, MAX_DISPERSION) >= target {
        return MAX_DISPERSION;
    }

    let (mut lo, mut hi) = (MIN_DISPERSION, MAX_DISPERSION);
    for _ in 0..MAX_BISECT {
        let mid = 0.5 * (lo + hi);
        if pearson_at(pairs, mid) > target {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-10 * hi {
            break;
        }
    }
    0.5 * (lo + hi)
}
