//! Trimmed Mean of M-values (TMM) normalization.
//!
//! TMM is a normalization method from edgeR that calculates scaling factors
//! to account for compositional differences between samples. Unlike simple
//! library size normalization, TMM is robust to asymmetric differential
//! expression where a subset of genes dominate expression changes.
//!
//! # Algorithm
//!
//! 1. Select a reference sample (by default, the one with upper quartile
//!    closest to the mean upper quartile)
//! 2. For each sample, calculate M-values (log-ratios) and A-values
//!    (average expression) for each gene
//! 3. Trim extreme values (default: 30% for M, 5% for A)
//! 4. Calculate the precision-weighted mean of M-values as the factor
//! 5. Rescale the factors to a geometric mean of one
//!
//! # Reference
//!
//! Robinson MD, Oshlack A. A scaling normalization method for differential
//! expression analysis of RNA-seq data. Genome Biology 11, R25 (2010).

use crate::data::PseudobulkMatrix;
use crate::error::{PbdsError, Result};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Configuration for TMM normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmmConfig {
    /// Fraction of M-values to trim from each tail (default: 0.30).
    pub trim_m: f64,
    /// Fraction of A-values to trim from each tail (default: 0.05).
    pub trim_a: f64,
    /// Minimum count in both samples for a gene to enter the calculation.
    pub min_count: f64,
    /// Reference sample index (None = auto-select).
    pub reference_sample: Option<usize>,
}

impl Default for TmmConfig {
    fn default() -> Self {
        Self {
            trim_m: 0.30,
            trim_a: 0.05,
            min_count: 1.0,
            reference_sample: None,
        }
    }
}

/// TMM scaling factors for the samples of one pseudobulk matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TmmFactors {
    pub sample_ids: Vec<String>,
    /// Column totals.
    pub library_sizes: Vec<f64>,
    /// Scaling factors, geometric mean one.
    pub norm_factors: Vec<f64>,
    /// `library_size * norm_factor`.
    pub effective_lib_sizes: Vec<f64>,
    /// Index of the reference sample used.
    pub reference_sample: usize,
}

impl TmmFactors {
    /// GLM offsets: natural log of the effective library sizes.
    pub fn offsets(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.effective_lib_sizes.len(),
            self.effective_lib_sizes.iter().map(|l| l.ln()),
        )
    }

    /// Counts per million on the effective library sizes.
    ///
    /// With `log = true`, `log2((count + prior) / (lib + 2 * prior) * 1e6)`.
    pub fn cpm(&self, counts: &DMatrix<f64>, log: bool, prior_count: f64) -> DMatrix<f64> {
        let mut out = counts.clone();
        for (j, mut col) in out.column_iter_mut().enumerate() {
            let lib = self.effective_lib_sizes[j];
            for v in col.iter_mut() {
                *v = if log {
                    ((*v + prior_count) / (lib + 2.0 * prior_count) * 1e6).log2()
                } else {
                    *v / lib * 1e6
                };
            }
        }
        out
    }
}

/// TMM factors with default parameters.
///
/// # Example
/// ```ignore
/// let tmm = norm_tmm(&pseudobulk)?;
/// let offsets = tmm.offsets();
/// ```
pub fn norm_tmm(matrix: &PseudobulkMatrix) -> Result<TmmFactors> {
    norm_tmm_with_config(matrix, &TmmConfig::default())
}

/// TMM factors with custom configuration.
pub fn norm_tmm_with_config(matrix: &PseudobulkMatrix, config: &TmmConfig) -> Result<TmmFactors> {
    let counts = matrix.data();
    let n_genes = counts.nrows();
    let n_samples = counts.ncols();

    if n_genes == 0 || n_samples == 0 {
        return Err(PbdsError::InvalidParameter(
            "Cannot apply TMM to empty matrix".to_string(),
        ));
    }

    if config.trim_m < 0.0 || config.trim_m >= 0.5 {
        return Err(PbdsError::InvalidParameter(
            "trim_m must be in [0, 0.5)".to_string(),
        ));
    }

    if config.trim_a < 0.0 || config.trim_a >= 0.5 {
        return Err(PbdsError::InvalidParameter(
            "trim_a must be in [0, 0.5)".to_string(),
        ));
    }

    let library_sizes = matrix.col_sums();

    for (j, &lib_size) in library_sizes.iter().enumerate() {
        if lib_size <= 0.0 {
            return Err(PbdsError::Numerical(format!(
                "Sample {} has zero total counts",
                matrix.sample_ids()[j]
            )));
        }
    }

    let ref_idx = config
        .reference_sample
        .unwrap_or_else(|| select_reference_sample(counts, &library_sizes));

    if ref_idx >= n_samples {
        return Err(PbdsError::InvalidParameter(format!(
            "Reference sample index {} out of bounds (n_samples = {})",
            ref_idx, n_samples
        )));
    }

    let raw_factors: Vec<f64> = (0..n_samples)
        .into_par_iter()
        .map(|j| {
            if j == ref_idx {
                1.0
            } else {
                calculate_tmm_factor(
                    counts,
                    j,
                    ref_idx,
                    library_sizes[j],
                    library_sizes[ref_idx],
                    config,
                )
            }
        })
        .collect();

    let log_mean = raw_factors.iter().map(|f| f.ln()).sum::<f64>() / n_samples as f64;
    let scale = log_mean.exp();
    let norm_factors: Vec<f64> = raw_factors.iter().map(|f| f / scale).collect();

    let effective_lib_sizes: Vec<f64> = library_sizes
        .iter()
        .zip(&norm_factors)
        .map(|(&lib, &factor)| lib * factor)
        .collect();

    Ok(TmmFactors {
        sample_ids: matrix.sample_ids().to_vec(),
        library_sizes,
        norm_factors,
        effective_lib_sizes,
        reference_sample: ref_idx,
    })
}

/// Select reference sample as the one with upper quartile closest to mean.
fn select_reference_sample(counts: &DMatrix<f64>, library_sizes: &[f64]) -> usize {
    let upper_quartiles: Vec<f64> = counts
        .column_iter()
        .zip(library_sizes)
        .map(|(col, &lib_size)| {
            let mut proportions: Vec<f64> = col
                .iter()
                .map(|&c| c / lib_size)
                .filter(|&p| p > 0.0)
                .collect();

            if proportions.is_empty() {
                return 0.0;
            }

            proportions.sort_by(|a, b| a.total_cmp(b));
            let q75_idx = (proportions.len() as f64 * 0.75) as usize;
            proportions[q75_idx.min(proportions.len() - 1)]
        })
        .collect();

    let mean_uq: f64 = upper_quartiles.iter().sum::<f64>() / upper_quartiles.len() as f64;

    upper_quartiles
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - mean_uq).abs().total_cmp(&(*b - mean_uq).abs()))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Calculate TMM factor for a sample relative to reference.
fn calculate_tmm_factor(
    counts: &DMatrix<f64>,
    sample_idx: usize,
    ref_idx: usize,
    sample_lib: f64,
    ref_lib: f64,
    config: &TmmConfig,
) -> f64 {
    // (M, A, weight) for genes present in both samples
    let mut ma_values: Vec<(f64, f64, f64)> = Vec::new();

    for i in 0..counts.nrows() {
        let count_s = counts[(i, sample_idx)];
        let count_r = counts[(i, ref_idx)];

        if count_s < config.min_count || count_r < config.min_count || count_s <= 0.0 || count_r <= 0.0 {
            continue;
        }

        let prop_s = count_s / sample_lib;
        let prop_r = count_r / ref_lib;

        let m = (prop_s / prop_r).log2();
        let a = 0.5 * (prop_s * prop_r).log2();

        // Var(M) ≈ (N-Y)/NY + (N'-Y')/N'Y'
        let var_m = (sample_lib - count_s) / (sample_lib * count_s)
            + (ref_lib - count_r) / (ref_lib * count_r);
        let weight = if var_m > 0.0 { 1.0 / var_m } else { 0.0 };

        if m.is_finite() && a.is_finite() && weight > 0.0 {
            ma_values.push((m, a, weight));
        }
    }

    if ma_values.is_empty() {
        return 1.0;
    }

    ma_values.sort_by(|a, b| a.0.total_cmp(&b.0));

    let n = ma_values.len();
    let trim_m_count = (n as f64 * config.trim_m) as usize;

    let mut m_trimmed: Vec<(f64, f64, f64)> = if 2 * trim_m_count < n {
        ma_values[trim_m_count..(n - trim_m_count)].to_vec()
    } else {
        ma_values
    };

    m_trimmed.sort_by(|a, b| a.1.total_cmp(&b.1));

    let n = m_trimmed.len();
    let trim_a_count = (n as f64 * config.trim_a) as usize;

    let final_values: &[(f64, f64, f64)] = if 2 * trim_a_count < n {
        &m_trimmed[trim_a_count..(n - trim_a_count)]
    } else {
        &m_trimmed
    };

    let sum_weighted_m: f64 = final_values.iter().map(|(m, _, w)| m * w).sum();
    let sum_weights: f64 = final_values.iter().map(|(_, _, w)| w).sum();

    if sum_weights <= 0.0 {
        return 1.0;
    }

    2.0_f64.powf(sum_weighted_m / sum_weights)
}

/// Average log2 counts per million of each gene across samples.
///
/// Uses a prior count of 0.5 per observation and effective library sizes
/// shifted by one, so genes with zero counts still get a finite value.
pub fn average_log_cpm(counts: &DMatrix<f64>, effective_lib_sizes: &[f64]) -> Vec<f64> {
    counts
        .row_iter()
        .map(|row| {
            let mean_cpm = row
                .iter()
                .zip(effective_lib_sizes)
                .map(|(&y, &lib)| (y + 0.5) / (lib + 1.0) * 1e6)
                .sum::<f64>()
                / effective_lib_sizes.len() as f64;
            mean_cpm.log2()
        })
        .collect()
}
