//! Single-cell records with sparse count storage.

use crate::error::{PbdsError, Result};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, CsVecView, TriMat};
use std::collections::{BTreeSet, HashSet};

/// One sequenced cell as delivered by the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    /// Cell identifier (barcode).
    pub cell_id: String,
    /// Previously assigned cluster (cell sub-population) label.
    pub cluster_id: String,
    /// Sample the cell was sequenced in.
    pub sample_id: String,
    /// Raw counts, one per gene.
    pub counts: Vec<u64>,
    /// Log-normalized expression, one per gene.
    pub logcounts: Option<Vec<f64>>,
}

impl CellRecord {
    /// Create a record with raw counts only.
    pub fn new(
        cell_id: impl Into<String>,
        cluster_id: impl Into<String>,
        sample_id: impl Into<String>,
        counts: Vec<u64>,
    ) -> Self {
        Self {
            cell_id: cell_id.into(),
            cluster_id: cluster_id.into(),
            sample_id: sample_id.into(),
            counts,
            logcounts: None,
        }
    }

    /// Attach log-normalized expression values.
    pub fn with_logcounts(mut self, logcounts: Vec<f64>) -> Self {
        self.logcounts = Some(logcounts);
        self
    }
}

/// An immutable collection of cells sharing one gene axis.
///
/// Counts are stored as a CSR matrix (cells × genes) since single-cell
/// count vectors are mostly zeros.
#[derive(Debug, Clone)]
pub struct CellSet {
    gene_ids: Vec<String>,
    cell_ids: Vec<String>,
    cluster_ids: Vec<String>,
    sample_ids: Vec<String>,
    counts: CsMat<u64>,
    logcounts: Option<CsMat<f64>>,
}

impl CellSet {
    /// Build a cell set from records, validating every vector against the gene axis.
    ///
    /// Log-expression is kept only when every record carries it; a mix of
    /// records with and without log-expression is rejected.
    pub fn new(gene_ids: Vec<String>, records: Vec<CellRecord>) -> Result<Self> {
        let n_genes = gene_ids.len();
        let n_cells = records.len();

        let unique_genes: HashSet<&str> = gene_ids.iter().map(String::as_str).collect();
        if unique_genes.len() != n_genes {
            return Err(PbdsError::InvalidParameter(
                "Gene identifiers must be unique".to_string(),
            ));
        }

        let n_with_log = records.iter().filter(|r| r.logcounts.is_some()).count();
        if n_with_log != 0 && n_with_log != n_cells {
            return Err(PbdsError::InvalidParameter(format!(
                "{} of {} cells carry log-expression; either all or none must",
                n_with_log, n_cells
            )));
        }
        let keep_log = n_cells > 0 && n_with_log == n_cells;

        let mut seen: HashSet<&str> = HashSet::with_capacity(n_cells);
        for record in &records {
            if !seen.insert(record.cell_id.as_str()) {
                return Err(PbdsError::InvalidParameter(format!(
                    "Duplicate cell identifier '{}'",
                    record.cell_id
                )));
            }
            if record.cluster_id.trim().is_empty() || record.sample_id.trim().is_empty() {
                return Err(PbdsError::InvalidParameter(format!(
                    "Cell '{}' has an empty cluster or sample label",
                    record.cell_id
                )));
            }
            if record.counts.len() != n_genes {
                return Err(PbdsError::DimensionMismatch {
                    expected: n_genes,
                    actual: record.counts.len(),
                });
            }
            if let Some(log) = &record.logcounts {
                if log.len() != n_genes {
                    return Err(PbdsError::DimensionMismatch {
                        expected: n_genes,
                        actual: log.len(),
                    });
                }
                if log.iter().any(|v| !v.is_finite()) {
                    return Err(PbdsError::InvalidParameter(format!(
                        "Cell '{}' has non-finite log-expression",
                        record.cell_id
                    )));
                }
            }
        }

        let mut count_tri = TriMat::new((n_cells, n_genes));
        let mut log_tri = TriMat::new((n_cells, n_genes));
        let mut cell_ids = Vec::with_capacity(n_cells);
        let mut cluster_ids = Vec::with_capacity(n_cells);
        let mut sample_ids = Vec::with_capacity(n_cells);

        for (row, record) in records.into_iter().enumerate() {
            for (gene, &value) in record.counts.iter().enumerate() {
                if value > 0 {
                    count_tri.add_triplet(row, gene, value);
                }
            }
            if keep_log {
                if let Some(log) = &record.logcounts {
                    for (gene, &value) in log.iter().enumerate() {
                        if value != 0.0 {
                            log_tri.add_triplet(row, gene, value);
                        }
                    }
                }
            }
            cell_ids.push(record.cell_id);
            cluster_ids.push(record.cluster_id);
            sample_ids.push(record.sample_id);
        }

        Ok(Self {
            gene_ids,
            cell_ids,
            cluster_ids,
            sample_ids,
            counts: count_tri.to_csr(),
            logcounts: keep_log.then(|| log_tri.to_csr()),
        })
    }

    /// A cell set with a gene axis and no cells.
    pub fn empty(gene_ids: Vec<String>) -> Result<Self> {
        Self::new(gene_ids, Vec::new())
    }

    /// Number of cells.
    #[inline]
    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    /// Number of genes.
    #[inline]
    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    /// Whether the set holds no cells.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cell_ids.is_empty()
    }

    #[inline]
    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    #[inline]
    pub fn cell_id(&self, cell: usize) -> &str {
        &self.cell_ids[cell]
    }

    #[inline]
    pub fn cluster_of(&self, cell: usize) -> &str {
        &self.cluster_ids[cell]
    }

    #[inline]
    pub fn sample_of(&self, cell: usize) -> &str {
        &self.sample_ids[cell]
    }

    /// Whether log-expression is available for every cell.
    #[inline]
    pub fn has_logcounts(&self) -> bool {
        self.logcounts.is_some()
    }

    /// Sparse raw counts of one cell.
    pub fn counts_row(&self, cell: usize) -> Option<CsVecView<'_, u64>> {
        self.counts.outer_view(cell)
    }

    /// Sparse log-expression of one cell.
    pub fn logcounts_row(&self, cell: usize) -> Option<CsVecView<'_, f64>> {
        self.logcounts.as_ref().and_then(|m| m.outer_view(cell))
    }

    /// Sorted distinct cluster labels.
    pub fn clusters(&self) -> Vec<String> {
        sorted_unique(&self.cluster_ids)
    }

    /// Sorted distinct sample labels.
    pub fn samples(&self) -> Vec<String> {
        sorted_unique(&self.sample_ids)
    }
}

fn sorted_unique(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(String::from)
        .collect()
}
