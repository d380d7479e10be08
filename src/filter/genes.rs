//! Gene filtering for pseudobulk matrices.

use crate::data::PseudobulkMatrix;
use crate::error::{PbdsError, Result};
use rayon::prelude::*;

/// Filter genes by total count across the cluster's samples.
///
/// Genes whose total is zero are always removed, whatever `min_total` is,
/// since they cannot be fitted.
///
/// # Arguments
/// * `matrix` - The pseudobulk matrix to filter
/// * `min_total` - Minimum total count
///
/// # Returns
/// A new matrix containing only genes meeting the threshold, or
/// `InsufficientData` for the cluster when no gene does.
pub fn filter_total_count(matrix: &PseudobulkMatrix, min_total: f64) -> Result<PseudobulkMatrix> {
    if !min_total.is_finite() || min_total < 0.0 {
        return Err(PbdsError::InvalidParameter(
            "min_total must be a non-negative number".to_string(),
        ));
    }

    let row_sums = matrix.row_sums();

    let keep_indices: Vec<usize> = (0..matrix.n_genes())
        .into_par_iter()
        .filter(|&row| row_sums[row] > 0.0 && row_sums[row] >= min_total)
        .collect();

    if keep_indices.is_empty() {
        return Err(PbdsError::insufficient(
            matrix.cluster_id(),
            format!("no gene has a non-zero total count of at least {}", min_total),
        ));
    }

    matrix.subset_genes(&keep_indices)
}
