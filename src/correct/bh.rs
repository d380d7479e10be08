//! Benjamini-Hochberg false discovery rate correction.

use serde::{Deserialize, Serialize};

/// Result of BH correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BhCorrected {
    /// Gene IDs in original order.
    pub gene_ids: Vec<String>,
    /// Original p-values.
    pub p_values: Vec<f64>,
    /// Adjusted p-values (q-values); NaN where the p-value was NaN.
    pub q_values: Vec<f64>,
    /// Number of finite p-values the correction was taken over.
    pub n_tests: usize,
}

impl BhCorrected {
    /// Get q-value for a specific gene.
    pub fn get_qvalue(&self, gene_id: &str) -> Option<f64> {
        let idx = self.gene_ids.iter().position(|g| g == gene_id)?;
        self.q_values.get(idx).copied()
    }

    /// Count significant results at a threshold.
    pub fn n_significant(&self, alpha: f64) -> usize {
        self.q_values.iter().filter(|&&q| q < alpha).count()
    }
}

/// Apply Benjamini-Hochberg FDR correction.
///
/// The BH procedure controls the false discovery rate (FDR) at level α.
/// For each p-value, the adjusted p-value (q-value) is calculated as:
/// q[i] = min(p[i] * n / rank[i], q[i+1])
///
/// NaN p-values (genes that could not be tested) do not count toward `n`
/// and receive a NaN q-value.
///
/// # Arguments
/// * `p_values` - Raw p-values
/// * `gene_ids` - Gene identifiers (same order as p_values)
///
/// # Returns
/// BhCorrected containing q-values.
pub fn correct_bh(p_values: &[f64], gene_ids: &[String]) -> BhCorrected {
    let mut q_values = vec![f64::NAN; p_values.len()];

    let mut indices: Vec<usize> = (0..p_values.len())
        .filter(|&i| !p_values[i].is_nan())
        .collect();
    let n = indices.len();

    if n > 0 {
        indices.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

        let n_f64 = n as f64;
        let mut running = 1.0_f64;

        // Work backwards from the largest p-value
        for (i, &orig_idx) in indices.iter().enumerate().rev() {
            let rank = i + 1;
            let adjusted = p_values[orig_idx] * n_f64 / rank as f64;
            running = running.min(adjusted);
            q_values[orig_idx] = running;
        }
    }

    BhCorrected {
        gene_ids: gene_ids.to_vec(),
        p_values: p_values.to_vec(),
        q_values,
        n_tests: n,
    }
}
