//! Per-cluster testing and whole-run orchestration.

mod runner;
mod tester;

pub use runner::{Analysis, AnalysisConfig};
pub use tester::{test_cluster, TesterConfig};
