//! Per-cluster differential testing.
//!
//! One cluster's pseudobulk matrix goes through sample and gene filtering,
//! TMM normalization, dispersion estimation, negative binomial fits of the
//! full and null designs, a contrast test and BH correction. Mean-aggregated
//! matrices take the linear model path instead.

use crate::correct::correct_bh;
use crate::data::{AggregateFn, ClusterDesign, DesignSpec, DiffResult, DiffResultTable, PseudobulkMatrix};
use crate::error::{PbdsError, Result};
use crate::filter::{filter_samples, filter_total_count};
use crate::model::{
    estimate_common_dispersion, estimate_tagwise_dispersion, model_lm, model_nb_genewise,
    TAGWISE_PRIOR_DF,
};
use crate::normalize::{average_log_cpm, norm_tmm_with_config, TmmConfig, TmmFactors};
use crate::test::{test_lrt, test_qlf, test_t, test_wald, ContrastTestResult, TestMethod};
use serde::{Deserialize, Serialize};
use std::f64::consts::LN_2;
use tracing::{debug, info};

/// Settings for testing a single cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesterConfig {
    /// Contrast test for count (sum) pseudobulk.
    pub method: TestMethod,
    /// Samples built from fewer cells are dropped.
    pub min_cells: usize,
    /// Every group in the contrast needs at least this many samples.
    pub min_samples_per_group: usize,
    /// Genes with a smaller total count are dropped.
    pub min_total_count: f64,
    /// Use this dispersion for every gene instead of estimating one.
    pub fixed_dispersion: Option<f64>,
    /// Shrinkage weight of gene-wise dispersions toward the common value
    /// (Wald and LRT only).
    pub prior_df: f64,
    pub tmm: TmmConfig,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            method: TestMethod::default(),
            min_cells: 1,
            min_samples_per_group: 2,
            min_total_count: 1.0,
            fixed_dispersion: None,
            prior_df: TAGWISE_PRIOR_DF,
            tmm: TmmConfig::default(),
        }
    }
}

/// Test one cluster's pseudobulk matrix for the design's contrast.
///
/// # Errors
/// * [`PbdsError::InsufficientData`] when a contrast group has too few
///   samples, the design is rank deficient, no residual degrees of freedom
///   remain, or no gene survives filtering.
/// * [`PbdsError::InvalidParameter`] for an invalid configuration.
pub fn test_cluster(
    matrix: &PseudobulkMatrix,
    design: &DesignSpec,
    config: &TesterConfig,
) -> Result<DiffResultTable> {
    let cluster = matrix.cluster_id();
    if config.min_samples_per_group == 0 {
        return Err(PbdsError::InvalidParameter(
            "min_samples_per_group must be at least 1".to_string(),
        ));
    }

    let matrix = filter_samples(matrix, config.min_cells)?;
    let cluster_design = design.for_samples(matrix.sample_ids())?;
    check_design(cluster, &cluster_design, config.min_samples_per_group)?;

    let min_total = match matrix.aggregate() {
        AggregateFn::Sum => config.min_total_count,
        AggregateFn::Mean => 0.0,
    };
    let n_before = matrix.n_genes();
    let matrix = filter_total_count(&matrix, min_total)?;
    debug!(
        cluster,
        samples = matrix.n_samples(),
        genes = matrix.n_genes(),
        dropped = n_before - matrix.n_genes(),
        "Filtered cluster"
    );

    let (tested, log_cpm, log_scale) = match matrix.aggregate() {
        AggregateFn::Sum => {
            let tmm = norm_tmm_with_config(&matrix, &config.tmm)?;
            let tested = test_counts(&matrix, &cluster_design, &tmm, config)?;
            let log_cpm = average_log_cpm(matrix.data(), &tmm.effective_lib_sizes);
            (tested, log_cpm, LN_2)
        }
        AggregateFn::Mean => {
            let fit = model_lm(matrix.data(), matrix.gene_ids(), cluster_design.matrix())?;
            let tested = test_t(&fit, cluster_design.contrast())?;
            let n = matrix.n_samples() as f64;
            let means = matrix.row_sums().into_iter().map(|s| s / n).collect();
            (tested, means, 1.0)
        }
    };

    let corrected = correct_bh(&tested.p_values(), &tested.gene_ids());
    let rows: Vec<DiffResult> = tested
        .results
        .iter()
        .zip(&corrected.q_values)
        .zip(&log_cpm)
        .map(|((r, &p_adj), &log_cpm)| DiffResult {
            gene_id: r.gene_id.clone(),
            cluster_id: cluster.to_string(),
            log_fc: r.estimate / log_scale,
            log_cpm,
            statistic: r.statistic,
            p_value: r.p_value,
            p_adj,
        })
        .collect();

    let table = DiffResultTable::new(
        cluster.to_string(),
        design.contrast_name().to_string(),
        tested.method,
        rows,
    );
    info!(
        cluster,
        genes = table.len(),
        significant = corrected.n_significant(0.05),
        method = %table.method,
        "Tested cluster"
    );
    Ok(table)
}

/// Reject designs that cannot support the contrast.
fn check_design(cluster: &str, design: &ClusterDesign, min_per_group: usize) -> Result<()> {
    for ((group, &size), &coef) in design
        .groups()
        .iter()
        .zip(&design.group_sizes())
        .zip(design.contrast().iter())
    {
        if coef != 0.0 && size < min_per_group {
            return Err(PbdsError::insufficient(
                cluster,
                format!(
                    "group '{}' has {} sample(s), at least {} required",
                    group, size, min_per_group
                ),
            ));
        }
    }

    if !design.is_full_rank() {
        return Err(PbdsError::insufficient(cluster, "design is rank deficient"));
    }
    if design.df_residual() == 0 {
        return Err(PbdsError::insufficient(
            cluster,
            "no residual degrees of freedom",
        ));
    }
    Ok(())
}

/// Negative binomial path for summed counts.
fn test_counts(
    matrix: &PseudobulkMatrix,
    design: &ClusterDesign,
    tmm: &TmmFactors,
    config: &TesterConfig,
) -> Result<ContrastTestResult> {
    let cluster = matrix.cluster_id();
    let offsets = tmm.offsets();
    let counts = matrix.data();

    let n_genes = matrix.n_genes();
    let dispersions = match config.fixed_dispersion {
        Some(phi) if phi < 0.0 || !phi.is_finite() => {
            return Err(PbdsError::InvalidParameter(format!(
                "fixed_dispersion must be a finite non-negative number, got {}",
                phi
            )));
        }
        Some(phi) => vec![phi; n_genes],
        None => {
            let common = estimate_common_dispersion(counts, design.matrix(), &offsets)?;
            debug!(cluster, common, "Common dispersion");
            match config.method {
                // QL absorbs gene-level variability in the squeezed quasi-dispersion
                TestMethod::QuasiLikelihoodF => vec![common; n_genes],
                TestMethod::Wald | TestMethod::LikelihoodRatio => estimate_tagwise_dispersion(
                    counts,
                    design.matrix(),
                    &offsets,
                    common,
                    config.prior_df,
                )?,
            }
        }
    };
    debug!(cluster, norm_factors = ?tmm.norm_factors, "Cluster normalization");

    let genes = matrix.gene_ids();
    let full = model_nb_genewise(counts, genes, design.matrix(), &offsets, &dispersions)?;
    if !full.all_converged() {
        debug!(
            cluster,
            converged = full.n_converged(),
            genes = full.n_genes(),
            "Some gene fits did not converge"
        );
    }

    match config.method {
        TestMethod::Wald => test_wald(&full, design.contrast()),
        TestMethod::LikelihoodRatio | TestMethod::QuasiLikelihoodF => {
            let null = design.null_design()?;
            let reduced = model_nb_genewise(counts, genes, &null, &offsets, &dispersions)?;
            if config.method == TestMethod::LikelihoodRatio {
                test_lrt(&full, &reduced, design.contrast())
            } else {
                let (prior, tested) = test_qlf(&full, &reduced, design.contrast())?;
                debug!(cluster, d0 = prior.d0, s0_sq = prior.s0_sq, "QL prior");
                Ok(tested)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ContrastSpec, SampleEntry, SampleMetadata};
    use nalgebra::DMatrix;

    fn design(groups: &[(&str, &str)]) -> DesignSpec {
        let entries = groups
            .iter()
            .map(|(s, g)| SampleEntry::new(*s, *g))
            .collect();
        let metadata = SampleMetadata::new(entries).unwrap();
        DesignSpec::from_metadata(&metadata, &ContrastSpec::Auto).unwrap()
    }

    fn samples() -> Vec<String> {
        ["ctrl1", "ctrl2", "ctrl3", "stim1", "stim2", "stim3"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn create_matrix(aggregate: AggregateFn) -> PseudobulkMatrix {
        let mut rows = vec![
            20.0, 22.0, 18.0, 80.0, 85.0, 78.0, //
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ];
        for g in 0..10 {
            let base = 100.0 + 10.0 * g as f64;
            rows.extend([base, base + 3.0, base - 2.0, base + 1.0, base - 1.0, base + 2.0]);
        }
        let gene_ids: Vec<String> = (0..12).map(|i| format!("g{}", i)).collect();
        let data = DMatrix::from_row_slice(12, 6, &rows);
        PseudobulkMatrix::new("c1".to_string(), data, gene_ids, samples(), vec![5; 6], aggregate)
            .unwrap()
    }

    fn default_design() -> DesignSpec {
        design(&[
            ("ctrl1", "ctrl"),
            ("ctrl2", "ctrl"),
            ("ctrl3", "ctrl"),
            ("stim1", "stim"),
            ("stim2", "stim"),
            ("stim3", "stim"),
        ])
    }

    #[test]
    fn test_cluster_qlf() {
        let table =
            test_cluster(&create_matrix(AggregateFn::Sum), &default_design(), &TesterConfig::default())
                .unwrap();

        // all-zero gene dropped
        assert_eq!(table.len(), 11);
        assert!(table.get("g1").is_none());
        assert_eq!(table.method, "quasi_likelihood_f");
        assert_eq!(table.cluster_id, "c1");

        let g0 = table.get("g0").unwrap();
        assert!(g0.log_fc > 1.0);
        assert!(g0.p_adj < 0.05);

        for row in table.iter().filter(|r| r.gene_id != "g0") {
            assert!(row.log_fc.abs() < 0.5);
        }
    }

    #[test]
    fn test_cluster_methods() {
        for method in [TestMethod::LikelihoodRatio, TestMethod::Wald] {
            let config = TesterConfig {
                method,
                ..TesterConfig::default()
            };
            let table =
                test_cluster(&create_matrix(AggregateFn::Sum), &default_design(), &config).unwrap();
            assert_eq!(table.method, method.name());
            let g0 = table.get("g0").unwrap();
            assert!(g0.log_fc > 1.0);
            assert!(g0.p_value < 0.01);
        }
    }

    #[test]
    fn test_cluster_mean_path() {
        let table = test_cluster(
            &create_matrix(AggregateFn::Mean),
            &default_design(),
            &TesterConfig::default(),
        )
        .unwrap();
        assert_eq!(table.method, "t");
        let g0 = table.get("g0").unwrap();
        // raw difference of group means
        assert!((g0.log_fc - (81.0 - 20.0)).abs() < 1e-8);
    }

    #[test]
    fn test_too_few_samples() {
        let design = design(&[
            ("ctrl1", "ctrl"),
            ("ctrl2", "ctrl"),
            ("ctrl3", "ctrl"),
            ("stim1", "stim"),
            ("stim2", "stim"),
            ("stim3", "stim"),
        ]);
        let matrix = create_matrix(AggregateFn::Sum);
        let matrix = matrix.subset_samples(&[0, 1, 2, 3]).unwrap();
        let err = test_cluster(&matrix, &design, &TesterConfig::default()).unwrap_err();
        assert!(matches!(err, PbdsError::InsufficientData { ref cluster, .. } if cluster == "c1"));
    }

    #[test]
    fn test_min_cells_drops_samples() {
        let mut n_cells = vec![5; 6];
        n_cells[4] = 1;
        n_cells[5] = 1;
        let base = create_matrix(AggregateFn::Sum);
        let matrix = PseudobulkMatrix::new(
            "c1".to_string(),
            base.data().clone(),
            base.gene_ids().to_vec(),
            samples(),
            n_cells,
            AggregateFn::Sum,
        )
        .unwrap();
        let config = TesterConfig {
            min_cells: 2,
            ..TesterConfig::default()
        };
        assert!(matches!(
            test_cluster(&matrix, &default_design(), &config),
            Err(PbdsError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_invalid_fixed_dispersion() {
        let config = TesterConfig {
            fixed_dispersion: Some(-1.0),
            ..TesterConfig::default()
        };
        assert!(matches!(
            test_cluster(&create_matrix(AggregateFn::Sum), &default_design(), &config),
            Err(PbdsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_single_gene_effect_cancels() {
        // one gene: TMM makes each sample its own library size
        let data = DMatrix::from_row_slice(1, 4, &[10.0, 12.0, 100.0, 110.0]);
        let sample_ids: Vec<String> = ["ctrl1", "ctrl2", "stim1", "stim2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let matrix = PseudobulkMatrix::new(
            "c1".to_string(),
            data,
            vec!["g0".to_string()],
            sample_ids,
            vec![5; 4],
            AggregateFn::Sum,
        )
        .unwrap();
        let design = design(&[
            ("ctrl1", "ctrl"),
            ("ctrl2", "ctrl"),
            ("stim1", "stim"),
            ("stim2", "stim"),
        ]);

        for method in [
            TestMethod::QuasiLikelihoodF,
            TestMethod::LikelihoodRatio,
            TestMethod::Wald,
        ] {
            let config = TesterConfig {
                method,
                ..TesterConfig::default()
            };
            let table = test_cluster(&matrix, &design, &config).unwrap();
            let g0 = table.get("g0").unwrap();
            assert!(g0.log_fc.abs() < 1e-6, "{:?}: logFC {}", method, g0.log_fc);
            assert!(g0.p_value > 0.5, "{:?}: p {}", method, g0.p_value);
        }
    }

    #[test]
    fn test_noisy_null_gene_not_overcalled() {
        // quiet genes pull the common dispersion far below the noisy gene's
        let mut rows = vec![40.0, 200.0, 60.0, 300.0, 80.0, 220.0];
        for g in 0..10 {
            let base = 100.0 + 10.0 * g as f64;
            rows.extend([base, base + 3.0, base - 2.0, base + 1.0, base - 1.0, base + 2.0]);
        }
        let gene_ids: Vec<String> = (0..11).map(|i| format!("g{}", i)).collect();
        let matrix = PseudobulkMatrix::new(
            "c1".to_string(),
            DMatrix::from_row_slice(11, 6, &rows),
            gene_ids,
            samples(),
            vec![5; 6],
            AggregateFn::Sum,
        )
        .unwrap();
        let design = default_design();

        let cluster_design = design.for_samples(matrix.sample_ids()).unwrap();
        let tmm = norm_tmm_with_config(&matrix, &TmmConfig::default()).unwrap();
        let common =
            estimate_common_dispersion(matrix.data(), cluster_design.matrix(), &tmm.offsets())
                .unwrap();

        for method in [TestMethod::LikelihoodRatio, TestMethod::Wald] {
            let pooled = TesterConfig {
                method,
                fixed_dispersion: Some(common),
                ..TesterConfig::default()
            };
            let genewise = TesterConfig {
                method,
                ..TesterConfig::default()
            };
            let p_pooled = test_cluster(&matrix, &design, &pooled)
                .unwrap()
                .get("g0")
                .unwrap()
                .p_value;
            let p_genewise = test_cluster(&matrix, &design, &genewise)
                .unwrap()
                .get("g0")
                .unwrap()
                .p_value;
            assert!(
                p_genewise > 10.0 * p_pooled,
                "{:?}: gene-wise p {} vs common p {}",
                method,
                p_genewise,
                p_pooled
            );
        }
    }

    #[test]
    fn test_config_yaml_defaults() {
        let config: TesterConfig = serde_yaml::from_str("method: wald\nmin_cells: 10\n").unwrap();
        assert_eq!(config.method, TestMethod::Wald);
        assert_eq!(config.min_cells, 10);
        assert_eq!(config.min_samples_per_group, 2);
        assert!(config.fixed_dispersion.is_none());
        assert_eq!(config.prior_df, TAGWISE_PRIOR_DF);
    }
}
