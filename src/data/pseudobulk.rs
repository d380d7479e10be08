//! Per-cluster pseudobulk matrices.

use crate::error::{PbdsError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// How cells within a (cluster, sample) group are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    /// Sum of raw counts.
    #[default]
    Sum,
    /// Mean of log-normalized expression.
    Mean,
}

impl AggregateFn {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
        }
    }
}

/// Gene × sample matrix of aggregated values for one cluster.
///
/// Columns exist only for samples that contributed at least one cell to
/// the cluster, in sorted sample order.
#[derive(Debug, Clone)]
pub struct PseudobulkMatrix {
    cluster_id: String,
    data: DMatrix<f64>,
    gene_ids: Vec<String>,
    sample_ids: Vec<String>,
    n_cells: Vec<usize>,
    aggregate: AggregateFn,
}

impl PseudobulkMatrix {
    /// Create a matrix from its parts.
    ///
    /// Fails with [`PbdsError::EmptyAggregation`] if any column was built from zero cells.
    pub fn new(
        cluster_id: impl Into<String>,
        data: DMatrix<f64>,
        gene_ids: Vec<String>,
        sample_ids: Vec<String>,
        n_cells: Vec<usize>,
        aggregate: AggregateFn,
    ) -> Result<Self> {
        let cluster_id = cluster_id.into();
        let (nrows, ncols) = data.shape();
        if nrows != gene_ids.len() {
            return Err(PbdsError::DimensionMismatch {
                expected: nrows,
                actual: gene_ids.len(),
            });
        }
        if ncols != sample_ids.len() {
            return Err(PbdsError::DimensionMismatch {
                expected: ncols,
                actual: sample_ids.len(),
            });
        }
        if ncols != n_cells.len() {
            return Err(PbdsError::DimensionMismatch {
                expected: ncols,
                actual: n_cells.len(),
            });
        }
        if let Some(j) = n_cells.iter().position(|&n| n == 0) {
            return Err(PbdsError::EmptyAggregation {
                cluster: cluster_id,
                sample: sample_ids[j].clone(),
            });
        }
        Ok(Self {
            cluster_id,
            data,
            gene_ids,
            sample_ids,
            n_cells,
            aggregate,
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Underlying matrix (genes × samples).
    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Contributing cells per column.
    pub fn n_cells(&self) -> &[usize] {
        &self.n_cells
    }

    pub fn aggregate(&self) -> AggregateFn {
        self.aggregate
    }

    #[inline]
    pub fn n_genes(&self) -> usize {
        self.data.nrows()
    }

    #[inline]
    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    #[inline]
    pub fn get(&self, gene: usize, sample: usize) -> f64 {
        self.data[(gene, sample)]
    }

    /// Value for a gene and sample by identifier.
    pub fn value(&self, gene_id: &str, sample_id: &str) -> Option<f64> {
        let g = self.gene_ids.iter().position(|id| id == gene_id)?;
        let s = self.sample_ids.iter().position(|id| id == sample_id)?;
        Some(self.data[(g, s)])
    }

    /// Column index of a sample.
    pub fn sample_index(&self, sample_id: &str) -> Option<usize> {
        self.sample_ids.iter().position(|id| id == sample_id)
    }

    /// Row sums (total per gene).
    pub fn row_sums(&self) -> Vec<f64> {
        self.data.row_iter().map(|r| r.sum()).collect()
    }

    /// Column sums (library sizes for summed counts).
    pub fn col_sums(&self) -> Vec<f64> {
        self.data.column_iter().map(|c| c.sum()).collect()
    }

    /// Keep only the given genes (by index, in the given order).
    pub fn subset_genes(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.n_genes()) {
            return Err(PbdsError::InvalidParameter(format!(
                "Gene index {} out of bounds",
                bad
            )));
        }
        let data = self.data.select_rows(indices);
        let gene_ids = indices.iter().map(|&i| self.gene_ids[i].clone()).collect();
        Self::new(
            self.cluster_id.clone(),
            data,
            gene_ids,
            self.sample_ids.clone(),
            self.n_cells.clone(),
            self.aggregate,
        )
    }

    /// Keep only the given samples (by index, in the given order).
    pub fn subset_samples(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.n_samples()) {
            return Err(PbdsError::InvalidParameter(format!(
                "Sample index {} out of bounds",
                bad
            )));
        }
        let data = self.data.select_columns(indices);
        Self::new(
            self.cluster_id.clone(),
            data,
            self.gene_ids.clone(),
            indices.iter().map(|&i| self.sample_ids[i].clone()).collect(),
            indices.iter().map(|&i| self.n_cells[i]).collect(),
            self.aggregate,
        )
    }

    /// Write the matrix to a TSV file (genes as rows).
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        write!(writer, "gene_id")?;
        for sample_id in &self.sample_ids {
            write!(writer, "\t{}", sample_id)?;
        }
        writeln!(writer)?;

        for (row, gene_id) in self.gene_ids.iter().enumerate() {
            write!(writer, "{}", gene_id)?;
            for col in 0..self.n_samples() {
                write!(writer, "\t{}", self.data[(row, col)])?;
            }
            writeln!(writer)?;
        }
        writer.flush()?;

        Ok(())
    }
}

/// Pseudobulk matrices keyed by cluster identifier.
#[derive(Debug, Clone, Default)]
pub struct PseudobulkSet {
    clusters: BTreeMap<String, PseudobulkMatrix>,
}

impl PseudobulkSet {
    pub fn new(clusters: BTreeMap<String, PseudobulkMatrix>) -> Self {
        Self { clusters }
    }

    pub fn get(&self, cluster_id: &str) -> Option<&PseudobulkMatrix> {
        self.clusters.get(cluster_id)
    }

    /// Cluster identifiers in sorted order.
    pub fn cluster_ids(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PseudobulkMatrix)> {
        self.clusters.iter()
    }
}
