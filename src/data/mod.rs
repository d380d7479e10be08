//! Data structures for pseudobulk differential state analysis.

mod cell;
mod design;
mod metadata;
mod pseudobulk;
mod result;

pub use cell::{CellRecord, CellSet};
#[cfg(test)]
pub(crate) use design::contrast_complement;
pub use design::{ClusterDesign, ContrastSpec, DesignSpec};
pub use metadata::{SampleEntry, SampleMetadata};
pub use pseudobulk::{AggregateFn, PseudobulkMatrix, PseudobulkSet};
pub use result::{
    ClusterFailure, DiffResult, DiffResultTable, DsResults, FailureKind, ResultSummary,
};
