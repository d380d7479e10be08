//! Result types for differential state analysis.

use crate::data::AggregateFn;
use crate::error::{PbdsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Test result for one gene in one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub gene_id: String,
    pub cluster_id: String,
    /// log2 fold change of the contrast; positive = higher in the target group.
    pub log_fc: f64,
    /// Average log2 counts-per-million (average expression for mean-aggregated data).
    pub log_cpm: f64,
    /// Test statistic (F, LR, z or t depending on the method).
    pub statistic: f64,
    /// Raw two-sided p-value.
    pub p_value: f64,
    /// Benjamini-Hochberg adjusted p-value within the cluster.
    pub p_adj: f64,
}

/// Differential results for a single cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResultTable {
    pub cluster_id: String,
    /// Contrast tested, e.g. `stim-ctrl`.
    pub contrast: String,
    /// Test used to produce the p-values.
    pub method: String,
    pub rows: Vec<DiffResult>,
}

impl DiffResultTable {
    pub fn new(cluster_id: String, contrast: String, method: String, rows: Vec<DiffResult>) -> Self {
        Self {
            cluster_id,
            contrast,
            method,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiffResult> {
        self.rows.iter()
    }

    /// Result row for a gene.
    pub fn get(&self, gene_id: &str) -> Option<&DiffResult> {
        self.rows.iter().find(|r| r.gene_id == gene_id)
    }

    /// Rows sorted by adjusted p-value (ascending).
    pub fn sorted_by_padj(&self) -> Vec<&DiffResult> {
        let mut sorted: Vec<_> = self.rows.iter().collect();
        sorted.sort_by(|a, b| a.p_adj.total_cmp(&b.p_adj));
        sorted
    }

    /// Rows with adjusted p-value below `alpha`.
    pub fn significant_at(&self, alpha: f64) -> Vec<&DiffResult> {
        self.rows.iter().filter(|r| r.p_adj < alpha).collect()
    }

    /// Count significant results at various thresholds.
    pub fn summary(&self) -> ResultSummary {
        ResultSummary {
            total: self.len(),
            significant_001: self.rows.iter().filter(|r| r.p_adj < 0.001).count(),
            significant_01: self.rows.iter().filter(|r| r.p_adj < 0.01).count(),
            significant_05: self.rows.iter().filter(|r| r.p_adj < 0.05).count(),
            significant_10: self.rows.iter().filter(|r| r.p_adj < 0.10).count(),
            up: self.rows.iter().filter(|r| r.p_adj < 0.05 && r.log_fc > 0.0).count(),
            down: self.rows.iter().filter(|r| r.p_adj < 0.05 && r.log_fc < 0.0).count(),
        }
    }

    /// Write results to a TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        write_rows(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

fn write_header<W: Write>(writer: &mut W) -> Result<()> {
    writeln!(
        writer,
        "gene_id\tcluster_id\tcontrast\tlog_fc\tlog_cpm\tstatistic\tp_value\tp_adj"
    )?;
    Ok(())
}

fn write_rows<W: Write>(writer: &mut W, table: &DiffResultTable) -> Result<()> {
    for r in &table.rows {
        writeln!(
            writer,
            "{}\t{}\t{}\t{:.6}\t{:.4}\t{:.4}\t{:.3e}\t{:.3e}",
            r.gene_id, r.cluster_id, table.contrast, r.log_fc, r.log_cpm, r.statistic, r.p_value, r.p_adj
        )?;
    }
    Ok(())
}

/// Summary statistics for a result table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total: usize,
    pub significant_001: usize,
    pub significant_01: usize,
    pub significant_05: usize,
    pub significant_10: usize,
    /// Significant at 0.05 with positive log fold change.
    pub up: usize,
    /// Significant at 0.05 with negative log fold change.
    pub down: usize,
}

impl std::fmt::Display for ResultSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Total genes tested: {}", self.total)?;
        writeln!(f, "Significant at FDR < 0.001: {}", self.significant_001)?;
        writeln!(f, "Significant at FDR < 0.01:  {}", self.significant_01)?;
        writeln!(f, "Significant at FDR < 0.05:  {} ({} up, {} down)", self.significant_05, self.up, self.down)?;
        writeln!(f, "Significant at FDR < 0.10:  {}", self.significant_10)?;
        Ok(())
    }
}

/// Why a cluster produced no result table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InsufficientData,
    EmptyAggregation,
    Numerical,
}

/// A cluster-scoped failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFailure {
    pub cluster_id: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl ClusterFailure {
    /// Record a cluster-scoped error; returns `None` for errors that must abort the run.
    pub fn from_error(cluster_id: &str, err: &PbdsError) -> Option<Self> {
        let kind = match err {
            PbdsError::InsufficientData { .. } => FailureKind::InsufficientData,
            PbdsError::EmptyAggregation { .. } => FailureKind::EmptyAggregation,
            PbdsError::Numerical(_) => FailureKind::Numerical,
            _ => return None,
        };
        Some(Self {
            cluster_id: cluster_id.to_string(),
            kind,
            reason: err.to_string(),
        })
    }
}

/// Outcome of a full run: one table per successful cluster plus the failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsResults {
    pub contrast: String,
    pub aggregate: AggregateFn,
    pub tables: BTreeMap<String, DiffResultTable>,
    pub failures: Vec<ClusterFailure>,
}

impl DsResults {
    /// Table for a cluster, if it was tested successfully.
    pub fn table(&self, cluster_id: &str) -> Option<&DiffResultTable> {
        self.tables.get(cluster_id)
    }

    /// Failure for a cluster, if it failed.
    pub fn failure(&self, cluster_id: &str) -> Option<&ClusterFailure> {
        self.failures.iter().find(|f| f.cluster_id == cluster_id)
    }

    /// Identifiers of clusters that failed.
    pub fn failed_clusters(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.cluster_id.as_str()).collect()
    }

    pub fn n_tested(&self) -> usize {
        self.tables.len()
    }

    pub fn n_failed(&self) -> usize {
        self.failures.len()
    }

    /// Serialize the whole results object to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write every cluster's table into one TSV file, clusters in sorted order.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        for table in self.tables.values() {
            write_rows(&mut writer, table)?;
        }
        writer.flush()?;
        Ok(())
    }
}
