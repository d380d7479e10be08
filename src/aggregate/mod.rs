//! Pseudobulk aggregation of single cells by (cluster, sample).
//!
//! Cells are first partitioned by the pair of labels, then each partition is
//! reduced gene by gene. Partitions are keyed in sorted maps and the members
//! of each partition are visited in cell-identifier order, so the output does
//! not depend on the order in which cells were supplied.
//!
//! Missing (cluster, sample) pairs get no column: a cluster's matrix only
//! holds the samples that contributed at least one cell to it.

use crate::data::{AggregateFn, CellSet, PseudobulkMatrix, PseudobulkSet};
use crate::error::{PbdsError, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Cell indices per sample, for one cluster.
type ClusterGroups<'a> = BTreeMap<&'a str, Vec<usize>>;

/// Aggregate cells into one pseudobulk matrix per cluster.
///
/// With [`AggregateFn::Sum`] raw counts are summed; with
/// [`AggregateFn::Mean`] log-expression is averaged, which requires every
/// cell to carry log-expression. An empty cell set yields an empty result.
///
/// # Example
/// ```ignore
/// let pseudobulk = aggregate_pseudobulk(&cells, AggregateFn::Sum)?;
/// for (cluster, matrix) in pseudobulk.iter() {
///     println!("{}: {} samples", cluster, matrix.n_samples());
/// }
/// ```
pub fn aggregate_pseudobulk(cells: &CellSet, aggregate: AggregateFn) -> Result<PseudobulkSet> {
    if cells.is_empty() {
        debug!("No cells supplied, returning empty pseudobulk set");
        return Ok(PseudobulkSet::default());
    }

    if aggregate == AggregateFn::Mean && !cells.has_logcounts() {
        return Err(PbdsError::InvalidParameter(
            "Mean aggregation requires log-expression for every cell".to_string(),
        ));
    }

    let groups = partition_cells(cells);
    let n_groups: usize = groups.values().map(|g| g.len()).sum();

    let matrices: Vec<(String, PseudobulkMatrix)> = groups
        .par_iter()
        .map(|(&cluster, samples)| {
            aggregate_cluster(cells, cluster, samples, aggregate)
                .map(|matrix| (cluster.to_string(), matrix))
        })
        .collect::<Result<_>>()?;

    info!(
        cells = cells.n_cells(),
        genes = cells.n_genes(),
        groups = n_groups,
        clusters = matrices.len(),
        aggregate = aggregate.name(),
        "Aggregated cells into pseudobulk"
    );

    Ok(PseudobulkSet::new(matrices.into_iter().collect()))
}

/// Partition cell indices by cluster, then sample. Members are sorted by cell id.
fn partition_cells(cells: &CellSet) -> BTreeMap<&str, ClusterGroups<'_>> {
    let mut groups: BTreeMap<&str, ClusterGroups<'_>> = BTreeMap::new();
    for cell in 0..cells.n_cells() {
        groups
            .entry(cells.cluster_of(cell))
            .or_default()
            .entry(cells.sample_of(cell))
            .or_default()
            .push(cell);
    }
    for samples in groups.values_mut() {
        for members in samples.values_mut() {
            members.sort_by(|&a, &b| cells.cell_id(a).cmp(cells.cell_id(b)));
        }
    }
    groups
}

fn aggregate_cluster(
    cells: &CellSet,
    cluster: &str,
    samples: &ClusterGroups<'_>,
    aggregate: AggregateFn,
) -> Result<PseudobulkMatrix> {
    let n_genes = cells.n_genes();
    let mut data = DMatrix::zeros(n_genes, samples.len());
    let mut sample_ids = Vec::with_capacity(samples.len());
    let mut n_cells = Vec::with_capacity(samples.len());

    for (col, (&sample, members)) in samples.iter().enumerate() {
        let column = match aggregate {
            AggregateFn::Sum => sum_counts(cells, members),
            AggregateFn::Mean => mean_logcounts(cells, members),
        };
        for (gene, value) in column.into_iter().enumerate() {
            data[(gene, col)] = value;
        }
        sample_ids.push(sample.to_string());
        n_cells.push(members.len());
    }

    debug!(cluster, samples = sample_ids.len(), "Built pseudobulk matrix");

    PseudobulkMatrix::new(
        cluster,
        data,
        cells.gene_ids().to_vec(),
        sample_ids,
        n_cells,
        aggregate,
    )
}

/// Integer sum of raw counts per gene.
fn sum_counts(cells: &CellSet, members: &[usize]) -> Vec<f64> {
    let mut totals = vec![0u64; cells.n_genes()];
    for &cell in members {
        if let Some(row) = cells.counts_row(cell) {
            for (gene, &value) in row.iter() {
                totals[gene] += value;
            }
        }
    }
    totals.into_iter().map(|v| v as f64).collect()
}

/// Mean of log-expression per gene, accumulated in member order.
fn mean_logcounts(cells: &CellSet, members: &[usize]) -> Vec<f64> {
    let mut totals = vec![0.0; cells.n_genes()];
    for &cell in members {
        if let Some(row) = cells.logcounts_row(cell) {
            for (gene, &value) in row.iter() {
                totals[gene] += value;
            }
        }
    }
    let n = members.len() as f64;
    totals.into_iter().map(|v| v / n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CellRecord;
    use approx::assert_relative_eq;

    fn genes() -> Vec<String> {
        vec!["CD3E".into(), "ISG15".into()]
    }

    fn create_records() -> Vec<CellRecord> {
        vec![
            CellRecord::new("c1", "T", "ctrl1", vec![1, 0]),
            CellRecord::new("c2", "T", "ctrl1", vec![2, 5]),
            CellRecord::new("c3", "T", "stim1", vec![0, 9]),
            CellRecord::new("c4", "B", "stim1", vec![4, 4]),
            CellRecord::new("c5", "T", "ctrl2", vec![3, 1]),
        ]
    }

    #[test]
    fn test_sum_aggregation() {
        let cells = CellSet::new(genes(), create_records()).unwrap();
        let pb = aggregate_pseudobulk(&cells, AggregateFn::Sum).unwrap();

        assert_eq!(pb.cluster_ids(), vec!["B", "T"]);

        let t = pb.get("T").unwrap();
        assert_eq!(t.sample_ids(), &["ctrl1", "ctrl2", "stim1"]);
        assert_eq!(t.n_cells(), &[2, 1, 1]);
        assert_eq!(t.value("CD3E", "ctrl1"), Some(3.0));
        assert_eq!(t.value("ISG15", "ctrl1"), Some(5.0));
        assert_eq!(t.value("ISG15", "stim1"), Some(9.0));

        // B cells were only seen in stim1; no other columns exist.
        let b = pb.get("B").unwrap();
        assert_eq!(b.sample_ids(), &["stim1"]);
        assert_eq!(b.value("CD3E", "stim1"), Some(4.0));
    }

    #[test]
    fn test_permutation_invariance() {
        let forward = CellSet::new(genes(), create_records()).unwrap();
        let mut reversed_records = create_records();
        reversed_records.reverse();
        let reversed = CellSet::new(genes(), reversed_records).unwrap();

        let a = aggregate_pseudobulk(&forward, AggregateFn::Sum).unwrap();
        let b = aggregate_pseudobulk(&reversed, AggregateFn::Sum).unwrap();

        assert_eq!(a.cluster_ids(), b.cluster_ids());
        for (cluster, m) in a.iter() {
            let other = b.get(cluster).unwrap();
            assert_eq!(m.sample_ids(), other.sample_ids());
            assert_eq!(m.data(), other.data());
        }
    }

    #[test]
    fn test_mean_aggregation() {
        let records = vec![
            CellRecord::new("c1", "T", "s1", vec![1, 0]).with_logcounts(vec![0.5, 0.0]),
            CellRecord::new("c2", "T", "s1", vec![3, 2]).with_logcounts(vec![1.5, 1.0]),
            CellRecord::new("c3", "T", "s2", vec![0, 2]).with_logcounts(vec![0.0, 1.2]),
        ];
        let cells = CellSet::new(genes(), records).unwrap();
        let pb = aggregate_pseudobulk(&cells, AggregateFn::Mean).unwrap();

        let t = pb.get("T").unwrap();
        assert_eq!(t.aggregate(), AggregateFn::Mean);
        assert_relative_eq!(t.value("CD3E", "s1").unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(t.value("ISG15", "s1").unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(t.value("ISG15", "s2").unwrap(), 1.2, epsilon = 1e-12);
    }

    #[test]
    fn test_mean_without_logcounts() {
        let cells = CellSet::new(genes(), create_records()).unwrap();
        assert!(matches!(
            aggregate_pseudobulk(&cells, AggregateFn::Mean),
            Err(PbdsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_empty_input() {
        let cells = CellSet::empty(genes()).unwrap();
        let pb = aggregate_pseudobulk(&cells, AggregateFn::Sum).unwrap();
        assert!(pb.is_empty());

        let pb = aggregate_pseudobulk(&cells, AggregateFn::Mean).unwrap();
        assert!(pb.is_empty());
    }
}
