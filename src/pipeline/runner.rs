//! Whole-run orchestration: aggregation, then every cluster through the tester.

use crate::aggregate::aggregate_pseudobulk;
use crate::data::{
    AggregateFn, CellSet, ClusterFailure, ContrastSpec, DesignSpec, DiffResultTable, DsResults,
    PseudobulkMatrix, PseudobulkSet, SampleMetadata,
};
use crate::error::{PbdsError, Result};
use crate::pipeline::tester::{test_cluster, TesterConfig};
use crate::test::TestMethod;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Analysis configuration for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Name of the analysis.
    pub name: String,
    /// How cells are combined into pseudobulk samples.
    pub aggregate: AggregateFn,
    /// Comparison between groups.
    pub contrast: ContrastSpec,
    /// Per-cluster testing settings.
    pub tester: TesterConfig,
    /// Test clusters in parallel.
    pub parallel: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            name: "unnamed".to_string(),
            aggregate: AggregateFn::default(),
            contrast: ContrastSpec::default(),
            tester: TesterConfig::default(),
            parallel: true,
        }
    }
}

impl AnalysisConfig {
    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(PbdsError::from)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(PbdsError::from)
    }
}

/// Builder for configuring and running a differential-state analysis.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    config: AnalysisConfig,
}

impl Analysis {
    /// Create an analysis with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from a config.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Set the analysis name.
    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    /// Sum raw counts or average log-expression.
    pub fn aggregate(mut self, aggregate: AggregateFn) -> Self {
        self.config.aggregate = aggregate;
        self
    }

    /// Set the contrast to test.
    pub fn contrast(mut self, contrast: ContrastSpec) -> Self {
        self.config.contrast = contrast;
        self
    }

    /// Test `target - reference`.
    pub fn pairwise(self, target: &str, reference: &str) -> Self {
        self.contrast(ContrastSpec::Pairwise {
            target: target.to_string(),
            reference: reference.to_string(),
        })
    }

    /// Set the count-model test.
    pub fn method(mut self, method: TestMethod) -> Self {
        self.config.tester.method = method;
        self
    }

    /// Drop samples built from fewer cells.
    pub fn min_cells(mut self, min_cells: usize) -> Self {
        self.config.tester.min_cells = min_cells;
        self
    }

    /// Require this many samples in every contrast group.
    pub fn min_samples_per_group(mut self, n: usize) -> Self {
        self.config.tester.min_samples_per_group = n;
        self
    }

    /// Drop genes whose total count in a cluster is smaller.
    pub fn min_total_count(mut self, min_total: f64) -> Self {
        self.config.tester.min_total_count = min_total;
        self
    }

    /// Skip dispersion estimation and use a fixed value.
    pub fn fixed_dispersion(mut self, dispersion: f64) -> Self {
        self.config.tester.fixed_dispersion = Some(dispersion);
        self
    }

    /// Replace all per-cluster settings.
    pub fn tester(mut self, tester: TesterConfig) -> Self {
        self.config.tester = tester;
        self
    }

    /// Test clusters in parallel or sequentially.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    /// Current configuration.
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Convert to config for serialization.
    pub fn to_config(&self) -> AnalysisConfig {
        self.config.clone()
    }

    /// Run the analysis on cell records.
    ///
    /// Errors in the shared inputs (metadata, design, configuration) abort
    /// the run. Cluster-scoped errors are recorded in
    /// [`DsResults::failures`] and the remaining clusters are still tested.
    pub fn run(&self, cells: &CellSet, metadata: &SampleMetadata) -> Result<DsResults> {
        metadata.validate_cells(cells)?;
        let design = DesignSpec::from_metadata(metadata, &self.config.contrast)?;
        let pseudobulk = aggregate_pseudobulk(cells, self.config.aggregate)?;
        self.run_pseudobulk(&pseudobulk, &design)
    }

    /// Run the per-cluster tests on already aggregated matrices.
    pub fn run_pseudobulk(&self, pseudobulk: &PseudobulkSet, design: &DesignSpec) -> Result<DsResults> {
        let clusters: Vec<(&String, &PseudobulkMatrix)> = pseudobulk.iter().collect();

        let outcomes: Vec<(String, Result<DiffResultTable>)> = if self.config.parallel {
            clusters
                .par_iter()
                .map(|(id, matrix)| ((*id).clone(), test_cluster(matrix, design, &self.config.tester)))
                .collect()
        } else {
            clusters
                .iter()
                .map(|(id, matrix)| ((*id).clone(), test_cluster(matrix, design, &self.config.tester)))
                .collect()
        };

        let mut tables = BTreeMap::new();
        let mut failures = Vec::new();
        for (cluster_id, outcome) in outcomes {
            match outcome {
                Ok(table) => {
                    tables.insert(cluster_id, table);
                }
                Err(err) => match ClusterFailure::from_error(&cluster_id, &err) {
                    Some(failure) => {
                        warn!(cluster = %cluster_id, reason = %failure.reason, "Cluster failed");
                        failures.push(failure);
                    }
                    None => return Err(err),
                },
            }
        }

        info!(
            analysis = %self.config.name,
            contrast = design.contrast_name(),
            tested = tables.len(),
            failed = failures.len(),
            "Analysis complete"
        );

        Ok(DsResults {
            contrast: design.contrast_name().to_string(),
            aggregate: self.config.aggregate,
            tables,
            failures,
        })
    }
}
