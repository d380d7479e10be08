//! Group design matrix and contrast construction from sample metadata.

use crate::data::SampleMetadata;
use crate::error::{PbdsError, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tolerance for rank and orthogonality checks.
const RANK_EPS: f64 = 1e-10;

/// Which comparison between groups is tested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContrastSpec {
    /// Exactly two groups: the second sorted level minus the first.
    #[default]
    Auto,
    /// `target - reference`.
    Pairwise { target: String, reference: String },
    /// `target - mean(all other groups)`.
    OneVsRest { target: String },
}

/// Sample-by-group design (one-hot, no intercept) with a contrast vector.
///
/// Rows follow the sorted sample identifiers of the metadata, columns the
/// sorted group levels. The contrast coefficients sum to zero; a positive
/// contrast value means higher in the target group(s).
#[derive(Debug, Clone)]
pub struct DesignSpec {
    matrix: DMatrix<f64>,
    sample_ids: Vec<String>,
    groups: Vec<String>,
    contrast: DVector<f64>,
    contrast_name: String,
    row_index: HashMap<String, usize>,
}

impl DesignSpec {
    /// Build the design from metadata.
    ///
    /// Fails with [`PbdsError::Configuration`] when a sample has no group,
    /// fewer than two groups exist, or the contrast names unknown groups.
    pub fn from_metadata(metadata: &SampleMetadata, contrast: &ContrastSpec) -> Result<Self> {
        if let Some(entry) = metadata.entries().iter().find(|e| e.group_id.is_empty()) {
            return Err(PbdsError::Configuration(format!(
                "Sample '{}' has no group label",
                entry.sample_id
            )));
        }

        let groups = metadata.levels();
        if groups.len() < 2 {
            return Err(PbdsError::Configuration(format!(
                "At least two groups are required for a contrast, found {}",
                groups.len()
            )));
        }

        let sample_ids = metadata.sample_ids();
        let mut matrix = DMatrix::zeros(sample_ids.len(), groups.len());
        for (row, entry) in metadata.entries().iter().enumerate() {
            // levels() is built from these same labels
            if let Some(col) = groups.iter().position(|g| *g == entry.group_id) {
                matrix[(row, col)] = 1.0;
            }
        }

        let (coefficients, contrast_name) = build_contrast(&groups, contrast)?;

        Self::assemble(
            matrix,
            sample_ids,
            groups,
            DVector::from_vec(coefficients),
            contrast_name,
        )
    }

    /// Create a design directly from components.
    ///
    /// The matrix is samples × groups; the contrast must have one entry per
    /// column, not be all zero, and sum to zero.
    pub fn from_parts(
        matrix: DMatrix<f64>,
        sample_ids: Vec<String>,
        groups: Vec<String>,
        contrast: Vec<f64>,
        contrast_name: impl Into<String>,
    ) -> Result<Self> {
        if matrix.nrows() != sample_ids.len() {
            return Err(PbdsError::DimensionMismatch {
                expected: matrix.nrows(),
                actual: sample_ids.len(),
            });
        }
        if matrix.ncols() != groups.len() {
            return Err(PbdsError::DimensionMismatch {
                expected: matrix.ncols(),
                actual: groups.len(),
            });
        }
        if contrast.len() != groups.len() {
            return Err(PbdsError::DimensionMismatch {
                expected: groups.len(),
                actual: contrast.len(),
            });
        }
        if contrast.iter().sum::<f64>().abs() > 1e-8 {
            return Err(PbdsError::Configuration(
                "Contrast coefficients must sum to zero".to_string(),
            ));
        }
        Self::assemble(
            matrix,
            sample_ids,
            groups,
            DVector::from_vec(contrast),
            contrast_name.into(),
        )
    }

    fn assemble(
        matrix: DMatrix<f64>,
        sample_ids: Vec<String>,
        groups: Vec<String>,
        contrast: DVector<f64>,
        contrast_name: String,
    ) -> Result<Self> {
        if contrast.norm() < RANK_EPS {
            return Err(PbdsError::Configuration(
                "Contrast vector is all zeros".to_string(),
            ));
        }
        let row_index = sample_ids
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
        Ok(Self {
            matrix,
            sample_ids,
            groups,
            contrast,
            contrast_name,
            row_index,
        })
    }

    /// Design matrix (samples × groups).
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Group levels (columns).
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn contrast(&self) -> &DVector<f64> {
        &self.contrast
    }

    /// Human-readable contrast, e.g. `stim-ctrl`.
    pub fn contrast_name(&self) -> &str {
        &self.contrast_name
    }

    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_groups(&self) -> usize {
        self.matrix.ncols()
    }

    /// Restrict the design to the given samples (in the given order).
    ///
    /// Groups with no remaining samples are dropped when the contrast does
    /// not involve them; otherwise they stay as empty columns so the
    /// caller's rank check can reject the design.
    pub fn for_samples(&self, sample_ids: &[String]) -> Result<ClusterDesign> {
        let rows: Vec<usize> = sample_ids
            .iter()
            .map(|s| {
                self.row_index.get(s).copied().ok_or_else(|| {
                    PbdsError::SampleMismatch(format!("Sample '{}' is not in the design", s))
                })
            })
            .collect::<Result<_>>()?;

        let keep_cols: Vec<usize> = (0..self.n_groups())
            .filter(|&j| {
                let used = rows.iter().any(|&r| self.matrix[(r, j)] != 0.0);
                used || self.contrast[j] != 0.0
            })
            .collect();

        let mut matrix = DMatrix::zeros(rows.len(), keep_cols.len());
        for (i, &r) in rows.iter().enumerate() {
            for (k, &j) in keep_cols.iter().enumerate() {
                matrix[(i, k)] = self.matrix[(r, j)];
            }
        }

        Ok(ClusterDesign {
            matrix,
            sample_ids: sample_ids.to_vec(),
            groups: keep_cols.iter().map(|&j| self.groups[j].clone()).collect(),
            contrast: DVector::from_iterator(
                keep_cols.len(),
                keep_cols.iter().map(|&j| self.contrast[j]),
            ),
        })
    }
}

/// The design seen by a single cluster after sample restriction.
#[derive(Debug, Clone)]
pub struct ClusterDesign {
    matrix: DMatrix<f64>,
    sample_ids: Vec<String>,
    groups: Vec<String>,
    contrast: DVector<f64>,
}

impl ClusterDesign {
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn contrast(&self) -> &DVector<f64> {
        &self.contrast
    }

    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    /// Residual degrees of freedom (`n - p`, saturating).
    pub fn df_residual(&self) -> usize {
        self.n_samples().saturating_sub(self.n_coefficients())
    }

    /// Number of samples in each group column.
    pub fn group_sizes(&self) -> Vec<usize> {
        (0..self.n_coefficients())
            .map(|j| self.matrix.column(j).iter().filter(|&&v| v != 0.0).count())
            .collect()
    }

    /// Numerical rank of the design matrix.
    pub fn rank(&self) -> usize {
        if self.matrix.nrows() == 0 || self.matrix.ncols() == 0 {
            return 0;
        }
        self.matrix.clone().svd(false, false).rank(RANK_EPS)
    }

    /// Whether the design has full column rank.
    pub fn is_full_rank(&self) -> bool {
        self.rank() == self.n_coefficients()
    }

    /// Design of the null model `c'β = 0`, i.e. `X·N` with `N` an
    /// orthonormal basis of the complement of the contrast.
    pub fn null_design(&self) -> Result<DMatrix<f64>> {
        let basis = contrast_complement(&self.contrast)?;
        Ok(&self.matrix * basis)
    }
}

/// Orthonormal basis (p × (p-1)) of the space orthogonal to `contrast`.
pub(crate) fn contrast_complement(contrast: &DVector<f64>) -> Result<DMatrix<f64>> {
    let p = contrast.len();
    let norm = contrast.norm();
    if norm < RANK_EPS {
        return Err(PbdsError::Configuration(
            "Contrast vector is all zeros".to_string(),
        ));
    }

    let mut basis: Vec<DVector<f64>> = vec![contrast / norm];
    for j in 0..p {
        if basis.len() == p {
            break;
        }
        let mut v = DVector::zeros(p);
        v[j] = 1.0;
        for b in &basis {
            let proj = b.dot(&v);
            v -= b * proj;
        }
        let v_norm = v.norm();
        if v_norm > 1e-8 {
            basis.push(v / v_norm);
        }
    }

    if basis.len() == 1 {
        return Ok(DMatrix::zeros(p, 0));
    }
    Ok(DMatrix::from_columns(&basis[1..]))
}

/// Contrast coefficients over sorted `groups` plus a display name.
fn build_contrast(groups: &[String], spec: &ContrastSpec) -> Result<(Vec<f64>, String)> {
    let position = |name: &str| {
        groups.iter().position(|g| g == name).ok_or_else(|| {
            PbdsError::Configuration(format!(
                "Contrast group '{}' not found. Available: {:?}",
                name, groups
            ))
        })
    };

    let mut coefficients = vec![0.0; groups.len()];
    let name = match spec {
        ContrastSpec::Auto => {
            if groups.len() != 2 {
                return Err(PbdsError::Configuration(format!(
                    "Automatic contrast needs exactly two groups, found {}; specify target and reference",
                    groups.len()
                )));
            }
            coefficients[0] = -1.0;
            coefficients[1] = 1.0;
            format!("{}-{}", groups[1], groups[0])
        }
        ContrastSpec::Pairwise { target, reference } => {
            let t = position(target)?;
            let r = position(reference)?;
            if t == r {
                return Err(PbdsError::Configuration(
                    "Contrast target and reference must differ".to_string(),
                ));
            }
            coefficients[t] = 1.0;
            coefficients[r] = -1.0;
            format!("{}-{}", target, reference)
        }
        ContrastSpec::OneVsRest { target } => {
            let t = position(target)?;
            let rest = -1.0 / (groups.len() - 1) as f64;
            for (j, c) in coefficients.iter_mut().enumerate() {
                *c = if j == t { 1.0 } else { rest };
            }
            format!("{}-rest", target)
        }
    };

    Ok((coefficients, name))
}
