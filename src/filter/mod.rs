//! Filtering primitives for pseudobulk matrices and result tables.

pub mod genes;
pub mod results;
pub mod samples;

pub use genes::filter_total_count;
pub use results::{compare_rows, filter_all, filter_results, rank_results, ResultFilter};
pub use samples::filter_samples;
