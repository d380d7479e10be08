//! Contrast hypothesis tests for fitted per-gene models.

pub mod qlf;

use serde::{Deserialize, Serialize};

pub use lrt::test_lrt;
pub use qlf::test_qlf;
pub use wald::{test_t, test_wald};

/// Deviance differences at or below this are treated as zero.
pub(crate) const DEV_TOL: f64 = 1e-8;

/// Test used for count-based (summed) pseudobulk matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TestMethod {
    /// Quasi-likelihood F-test with empirical Bayes squeezed dispersions.
    #[default]
    QuasiLikelihoodF,
    /// Likelihood ratio test against the chi-squared distribution.
    LikelihoodRatio,
    /// Wald z-test on the contrast estimate.
    Wald,
}

impl TestMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::QuasiLikelihoodF => "quasi_likelihood_f",
            Self::LikelihoodRatio => "likelihood_ratio",
            Self::Wald => "wald",
        }
    }
}

/// Contrast test outcome for a single gene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastTestSingle {
    pub gene_id: String,
    /// Contrast estimate `c'beta` on the model's scale.
    pub estimate: f64,
    /// Test statistic (F, LR, z or t).
    pub statistic: f64,
    /// Two-sided p-value; NaN when the gene could not be tested.
    pub p_value: f64,
}

/// Contrast test outcomes for all genes of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastTestResult {
    pub results: Vec<ContrastTestSingle>,
    /// Name of the test that produced the p-values.
    pub method: String,
}

impl ContrastTestResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Get p-values for all genes.
    pub fn p_values(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.p_value).collect()
    }

    /// Get gene IDs.
    pub fn gene_ids(&self) -> Vec<String> {
        self.results.iter().map(|r| r.gene_id.clone()).collect()
    }

    /// Get result for a specific gene.
    pub fn get_gene(&self, gene_id: &str) -> Option<&ContrastTestSingle> {
        self.results.iter().find(|r| r.gene_id == gene_id)
    }
}

/// Statistic and p-value when the scale estimate is zero.
pub(crate) fn degenerate(effect: f64) -> (f64, f64) {
    if effect > 0.0 {
        (f64::INFINITY, 0.0)
    } else {
        (0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_serde_names() {
        let yaml = serde_yaml::to_string(&TestMethod::QuasiLikelihoodF).unwrap();
        assert_eq!(yaml.trim(), "quasi_likelihood_f");
        let back: TestMethod = serde_yaml::from_str("likelihood_ratio").unwrap();
        assert_eq!(back, TestMethod::LikelihoodRatio);
        assert_eq!(TestMethod::default(), TestMethod::QuasiLikelihoodF);
        assert_eq!(TestMethod::Wald.name(), "wald");
    }

    #[test]
    fn test_degenerate() {
        assert_eq!(degenerate(2.0), (f64::INFINITY, 0.0));
        assert_eq!(degenerate(0.0), (0.0, 1.0));
    }
}
