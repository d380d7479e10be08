//! Thresholding and ranking of differential result tables.

use crate::data::{DiffResult, DiffResultTable, DsResults};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Thresholds applied to a result table.
///
/// A row passes when `|log_fc| >= min_abs_log_fc` and `p_adj <= max_p_adj`.
/// Both bounds are inclusive: a row sitting exactly on a threshold is kept.
/// Rows with a NaN log fold change or adjusted p-value never pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultFilter {
    pub min_abs_log_fc: f64,
    pub max_p_adj: f64,
}

impl Default for ResultFilter {
    fn default() -> Self {
        Self {
            min_abs_log_fc: 1.0,
            max_p_adj: 0.05,
        }
    }
}

impl ResultFilter {
    pub fn new(min_abs_log_fc: f64, max_p_adj: f64) -> Self {
        Self {
            min_abs_log_fc,
            max_p_adj,
        }
    }

    /// Whether a single row passes both thresholds.
    pub fn passes(&self, row: &DiffResult) -> bool {
        row.log_fc.abs() >= self.min_abs_log_fc && row.p_adj <= self.max_p_adj
    }
}

/// Ranking order: adjusted p-value, then raw p-value, then gene identifier.
pub fn compare_rows(a: &DiffResult, b: &DiffResult) -> Ordering {
    a.p_adj
        .total_cmp(&b.p_adj)
        .then_with(|| a.p_value.total_cmp(&b.p_value))
        .then_with(|| a.gene_id.cmp(&b.gene_id))
}

/// Rows passing `filter`, ranked, as a new table.
///
/// The input is left untouched. Filtering the output again with the same
/// thresholds returns an identical table.
///
/// # Example
/// ```ignore
/// let hits = filter_results(&table, &ResultFilter::new(1.0, 0.05));
/// for row in hits.iter() {
///     println!("{}\t{:.2}", row.gene_id, row.log_fc);
/// }
/// ```
pub fn filter_results(table: &DiffResultTable, filter: &ResultFilter) -> DiffResultTable {
    let mut rows: Vec<DiffResult> = table
        .rows
        .iter()
        .filter(|r| filter.passes(r))
        .cloned()
        .collect();
    rows.sort_by(compare_rows);

    DiffResultTable::new(
        table.cluster_id.clone(),
        table.contrast.clone(),
        table.method.clone(),
        rows,
    )
}

/// All rows of a table, ranked, as a new table.
pub fn rank_results(table: &DiffResultTable) -> DiffResultTable {
    let mut rows = table.rows.clone();
    rows.sort_by(compare_rows);
    DiffResultTable::new(
        table.cluster_id.clone(),
        table.contrast.clone(),
        table.method.clone(),
        rows,
    )
}

/// Apply `filter` to every cluster's table.
pub fn filter_all(results: &DsResults, filter: &ResultFilter) -> BTreeMap<String, DiffResultTable> {
    results
        .tables
        .iter()
        .map(|(cluster, table)| (cluster.clone(), filter_results(table, filter)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(gene: &str, log_fc: f64, p: f64, q: f64) -> DiffResult {
        DiffResult {
            gene_id: gene.to_string(),
            cluster_id: "T".to_string(),
            log_fc,
            log_cpm: 4.0,
            statistic: 2.0,
            p_value: p,
            p_adj: q,
        }
    }

    fn create_table() -> DiffResultTable {
        DiffResultTable::new(
            "T".into(),
            "stim-ctrl".into(),
            "quasi_likelihood_f".into(),
            vec![
                row("MX1", 2.5, 0.002, 0.01),
                row("CD3E", 0.2, 0.0001, 0.001),
                row("ISG15", -3.0, 0.001, 0.01),
                row("IFI6", 1.5, 0.001, 0.01),
                row("GNLY", 4.0, 0.2, 0.3),
                row("NAN1", f64::NAN, 0.001, 0.01),
                row("NAN2", 2.0, f64::NAN, f64::NAN),
                row("EDGE", 1.0, 0.04, 0.05),
            ],
        )
    }

    #[test]
    fn test_thresholds_and_order() {
        let table = create_table();
        let hits = filter_results(&table, &ResultFilter::new(1.0, 0.05));

        let genes: Vec<&str> = hits.iter().map(|r| r.gene_id.as_str()).collect();
        // ISG15 and IFI6 tie on p_adj and p_value, so gene id decides
        assert_eq!(genes, vec!["IFI6", "ISG15", "MX1", "EDGE"]);
        // EDGE sits on both thresholds
        assert!(ResultFilter::new(1.0, 0.05).passes(hits.get("EDGE").unwrap()));
        assert!(!ResultFilter::new(1.0 + 1e-12, 0.05).passes(hits.get("EDGE").unwrap()));
        assert!(!ResultFilter::new(1.0, 0.05 - 1e-12).passes(hits.get("EDGE").unwrap()));
        assert_eq!(hits.cluster_id, "T");
        assert_eq!(hits.contrast, "stim-ctrl");
    }

    #[test]
    fn test_input_untouched() {
        let table = create_table();
        let before = table.rows.len();
        let _ = filter_results(&table, &ResultFilter::new(1.0, 0.05));
        assert_eq!(table.rows.len(), before);
        assert_eq!(table.rows[0].gene_id, "MX1");
    }

    #[test]
    fn test_idempotent() {
        let filter = ResultFilter::new(1.0, 0.05);
        let once = filter_results(&create_table(), &filter);
        let twice = filter_results(&once, &filter);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rank_keeps_everything() {
        let ranked = rank_results(&create_table());
        assert_eq!(ranked.len(), 8);
        assert_eq!(ranked.rows[0].gene_id, "CD3E");
        // NaN sorts after every number under total ordering
        assert_eq!(ranked.rows[7].gene_id, "NAN2");
    }
}
