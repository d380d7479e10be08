//! Pseudobulk Differential State Analysis Library
//!
//! This library aggregates single-cell counts into pseudobulk samples per
//! (cluster, sample) pair and tests every cluster for differential
//! expression between sample groups with negative binomial GLMs.
//!
//! # Overview
//!
//! The library is organized into composable modules:
//!
//! - **data**: Core data structures (CellSet, SampleMetadata, DesignSpec, PseudobulkMatrix, results)
//! - **aggregate**: Pseudobulk aggregation (sum of counts, mean of log-expression)
//! - **filter**: Sample and gene filtering, result filtering and ranking
//! - **normalize**: Library-size normalization (TMM)
//! - **model**: Statistical models (negative binomial GLM, common and gene-wise dispersion, QL squeezing, linear model)
//! - **test**: Hypothesis testing (QL F-test, LRT, Wald, t-test)
//! - **correct**: Multiple testing correction (Benjamini-Hochberg)
//! - **pipeline**: Per-cluster testing and run orchestration
//!
//! # Example
//!
//! ```no_run
//! use pseudobulk_ds::prelude::*;
//!
//! let genes = vec!["IFI6".to_string(), "ISG15".to_string()];
//! let cells = CellSet::new(
//!     genes,
//!     vec![
//!         CellRecord::new("c1", "B", "ctrl1", vec![3, 0]),
//!         CellRecord::new("c2", "B", "stim1", vec![12, 5]),
//!     ],
//! )
//! .unwrap();
//! let metadata = SampleMetadata::from_tsv("samples.tsv").unwrap();
//!
//! let results = Analysis::new()
//!     .pairwise("stim", "ctrl")
//!     .method(TestMethod::QuasiLikelihoodF)
//!     .run(&cells, &metadata)
//!     .unwrap();
//!
//! for (cluster, table) in filter_all(&results, &ResultFilter::new(1.0, 0.05)) {
//!     println!("{}: {} genes", cluster, table.len());
//! }
//! ```

pub mod aggregate;
pub mod correct;
pub mod data;
pub mod error;
pub mod filter;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod test;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::aggregate::aggregate_pseudobulk;
    pub use crate::correct::{correct_bh, BhCorrected};
    pub use crate::data::{
        AggregateFn, CellRecord, CellSet, ClusterDesign, ClusterFailure, ContrastSpec,
        DesignSpec, DiffResult, DiffResultTable, DsResults, FailureKind, PseudobulkMatrix,
        PseudobulkSet, ResultSummary, SampleEntry, SampleMetadata,
    };
    pub use crate::error::{PbdsError, Result};
    pub use crate::filter::{
        filter_all, filter_results, filter_samples, filter_total_count, rank_results,
        ResultFilter,
    };
    pub use crate::model::{
        estimate_common_dispersion, estimate_tagwise_dispersion, model_lm, model_nb,
        model_nb_genewise, squeeze_dispersions, LmFit, NbFit, QlPrior,
    };
    pub use crate::normalize::{norm_tmm, norm_tmm_with_config, TmmConfig, TmmFactors};
    pub use crate::pipeline::{test_cluster, Analysis, AnalysisConfig, TesterConfig};
    pub use crate::test::{
        test_lrt, test_qlf, test_t, test_wald, ContrastTestResult, ContrastTestSingle,
        TestMethod,
    };
}
