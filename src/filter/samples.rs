//! Sample filtering for pseudobulk matrices.

use crate::data::PseudobulkMatrix;
use crate::error::{PbdsError, Result};

/// Drop samples built from fewer than `min_cells` cells or with a zero total.
///
/// Zero-total columns carry no information and break library-size
/// normalization, so they are removed regardless of `min_cells`.
///
/// # Returns
/// A new matrix with the surviving samples in their original order, or
/// `InsufficientData` for the cluster when none survive.
pub fn filter_samples(matrix: &PseudobulkMatrix, min_cells: usize) -> Result<PseudobulkMatrix> {
    let col_sums = matrix.col_sums();

    let keep_indices: Vec<usize> = matrix
        .n_cells()
        .iter()
        .zip(&col_sums)
        .enumerate()
        .filter(|(_, (&cells, &total))| cells >= min_cells && total > 0.0)
        .map(|(j, _)| j)
        .collect();

    if keep_indices.is_empty() {
        return Err(PbdsError::insufficient(
            matrix.cluster_id(),
            format!("no sample has at least {} cells and a non-zero total", min_cells),
        ));
    }

    if keep_indices.len() == matrix.n_samples() {
        return Ok(matrix.clone());
    }

    matrix.subset_samples(&keep_indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::AggregateFn;
    use nalgebra::DMatrix;

    fn create_matrix() -> PseudobulkMatrix {
        // s2 has a zero total, s3 only two cells
        let data = DMatrix::from_row_slice(2, 3, &[4.0, 0.0, 7.0, 1.0, 0.0, 2.0]);
        PseudobulkMatrix::new(
            "NK",
            data,
            vec!["g0".into(), "g1".into()],
            vec!["s1".into(), "s2".into(), "s3".into()],
            vec![20, 15, 2],
            AggregateFn::Sum,
        )
        .unwrap()
    }

    #[test]
    fn test_zero_library_dropped() {
        let filtered = filter_samples(&create_matrix(), 1).unwrap();
        assert_eq!(filtered.sample_ids(), &["s1", "s3"]);
        assert_eq!(filtered.n_cells(), &[20, 2]);
    }

    #[test]
    fn test_min_cells() {
        let filtered = filter_samples(&create_matrix(), 10).unwrap();
        assert_eq!(filtered.sample_ids(), &["s1"]);
    }

    #[test]
    fn test_none_left() {
        assert!(matches!(
            filter_samples(&create_matrix(), 100),
            Err(PbdsError::InsufficientData { .. })
        ));
    }
}
