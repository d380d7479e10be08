//! Error types for the pseudobulk-ds library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum PbdsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    /// Bad or insufficient shared design input. Aborts the whole run.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single cluster lacks the samples or variation needed to fit.
    #[error("Insufficient data in cluster '{cluster}': {reason}")]
    InsufficientData { cluster: String, reason: String },

    /// A (cluster, sample) column was built from zero cells.
    #[error("Empty aggregation: cluster '{cluster}', sample '{sample}' has no contributing cells")]
    EmptyAggregation { cluster: String, sample: String },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Sample ID mismatch: {0}")]
    SampleMismatch(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PbdsError {
    /// Whether this error concerns a single cluster only.
    ///
    /// Cluster-scoped errors are recorded next to the other clusters' results;
    /// everything else aborts the run.
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            PbdsError::InsufficientData { .. }
                | PbdsError::EmptyAggregation { .. }
                | PbdsError::Numerical(_)
        )
    }

    pub(crate) fn insufficient(cluster: &str, reason: impl Into<String>) -> Self {
        PbdsError::InsufficientData {
            cluster: cluster.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, PbdsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_scope() {
        assert!(PbdsError::insufficient("B cells", "one sample").is_cluster_scoped());
        assert!(PbdsError::EmptyAggregation {
            cluster: "T".into(),
            sample: "s1".into()
        }
        .is_cluster_scoped());
        assert!(!PbdsError::Configuration("one group".into()).is_cluster_scoped());
        assert!(!PbdsError::InvalidParameter("x".into()).is_cluster_scoped());
    }

    #[test]
    fn test_messages() {
        let err = PbdsError::insufficient("NK", "group 'stim' has 1 sample(s)");
        assert_eq!(
            err.to_string(),
            "Insufficient data in cluster 'NK': group 'stim' has 1 sample(s)"
        );
    }
}
