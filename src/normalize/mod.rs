//! Library-size normalization for pseudobulk counts.
//!
//! - **TMM**: Trimmed mean of M-values (robust to asymmetric changes)

pub mod tmm;

pub use tmm::{average_log_cpm, norm_tmm, norm_tmm_with_config, TmmConfig, TmmFactors};
