//! Per-sample metadata: condition labels, subjects and cell counts.

use crate::data::CellSet;
use crate::error::{PbdsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// One row of sample metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEntry {
    /// Unique sample identifier.
    pub sample_id: String,
    /// Condition / group label (e.g. `ctrl`, `stim`).
    pub group_id: String,
    /// Patient or subject the sample came from.
    #[serde(default)]
    pub patient_id: Option<String>,
    /// Number of cells sequenced for the sample.
    #[serde(default)]
    pub n_cells: Option<usize>,
}

impl SampleEntry {
    pub fn new(sample_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            sample_id: sample_id.into(),
            group_id: group_id.into(),
            patient_id: None,
            n_cells: None,
        }
    }

    pub fn with_patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn with_n_cells(mut self, n_cells: usize) -> Self {
        self.n_cells = Some(n_cells);
        self
    }
}

/// Sample metadata table, kept sorted by sample identifier.
#[derive(Debug, Clone, Default)]
pub struct SampleMetadata {
    entries: Vec<SampleEntry>,
    index: HashMap<String, usize>,
}

impl SampleMetadata {
    /// Build a metadata table. Sample identifiers must be unique and non-empty.
    pub fn new(mut entries: Vec<SampleEntry>) -> Result<Self> {
        for entry in &mut entries {
            entry.sample_id = entry.sample_id.trim().to_string();
            entry.group_id = entry.group_id.trim().to_string();
            if entry.sample_id.is_empty() {
                return Err(PbdsError::Configuration(
                    "Sample metadata contains an empty sample identifier".to_string(),
                ));
            }
        }
        entries.sort_by(|a, b| a.sample_id.cmp(&b.sample_id));

        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if index.insert(entry.sample_id.clone(), i).is_some() {
                return Err(PbdsError::Configuration(format!(
                    "Duplicate sample identifier '{}' in metadata",
                    entry.sample_id
                )));
            }
        }

        Ok(Self { entries, index })
    }

    /// Load metadata from a TSV file.
    ///
    /// Expected header columns: `sample_id`, `group_id`, and optionally
    /// `patient_id` and `n_cells`. Extra columns are ignored.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut entries = Vec::new();
        for row in reader.deserialize() {
            let entry: SampleEntry = row?;
            entries.push(entry);
        }

        if entries.is_empty() {
            return Err(PbdsError::Configuration(
                "No samples in metadata file".to_string(),
            ));
        }

        Self::new(entries)
    }

    /// Entries in sample identifier order.
    pub fn entries(&self) -> &[SampleEntry] {
        &self.entries
    }

    /// Sample identifiers in sorted order.
    pub fn sample_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.sample_id.clone()).collect()
    }

    pub fn n_samples(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, sample_id: &str) -> Option<&SampleEntry> {
        self.index.get(sample_id).map(|&i| &self.entries[i])
    }

    pub fn has_sample(&self, sample_id: &str) -> bool {
        self.index.contains_key(sample_id)
    }

    /// Group label of a sample.
    pub fn group_of(&self, sample_id: &str) -> Option<&str> {
        self.get(sample_id).map(|e| e.group_id.as_str())
    }

    /// Sorted distinct non-empty group labels.
    pub fn levels(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.group_id.is_empty())
            .map(|e| e.group_id.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Check that every sample referenced by the cells is described here.
    pub fn validate_cells(&self, cells: &CellSet) -> Result<()> {
        let missing: Vec<String> = cells
            .samples()
            .into_iter()
            .filter(|s| !self.has_sample(s))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PbdsError::SampleMismatch(format!(
                "Samples without metadata: {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CellRecord;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_tsv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sample_id\tgroup_id\tpatient_id\tn_cells\tbatch").unwrap();
        writeln!(file, "stim1\tstim\tp1\t410\tA").unwrap();
        writeln!(file, "ctrl1\tctrl\tp1\t388\tA").unwrap();
        writeln!(file, "ctrl2\tctrl\tp2\t\tB").unwrap();
        writeln!(file, "stim2\tstim\tp2\t502\tB").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_metadata() {
        let file = create_test_tsv();
        let meta = SampleMetadata::from_tsv(file.path()).unwrap();

        assert_eq!(meta.n_samples(), 4);
        assert_eq!(meta.sample_ids(), vec!["ctrl1", "ctrl2", "stim1", "stim2"]);
        assert_eq!(meta.group_of("stim2"), Some("stim"));
        assert_eq!(meta.get("stim1").unwrap().n_cells, Some(410));
        assert_eq!(meta.get("ctrl2").unwrap().n_cells, None);
        assert_eq!(meta.get("ctrl2").unwrap().patient_id.as_deref(), Some("p2"));
    }

    #[test]
    fn test_optional_columns_absent() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sample_id\tgroup_id").unwrap();
        writeln!(file, "s1\tA").unwrap();
        writeln!(file, "s2\tB").unwrap();
        file.flush().unwrap();

        let meta = SampleMetadata::from_tsv(file.path()).unwrap();
        assert_eq!(meta.n_samples(), 2);
        assert!(meta.get("s1").unwrap().patient_id.is_none());
    }

    #[test]
    fn test_levels() {
        let file = create_test_tsv();
        let meta = SampleMetadata::from_tsv(file.path()).unwrap();
        assert_eq!(meta.levels(), vec!["ctrl", "stim"]);
    }

    #[test]
    fn test_duplicate_sample_rejected() {
        let entries = vec![SampleEntry::new("s1", "A"), SampleEntry::new("s1", "B")];
        assert!(matches!(
            SampleMetadata::new(entries),
            Err(PbdsError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_cells() {
        let meta = SampleMetadata::new(vec![SampleEntry::new("s1", "A")]).unwrap();
        let genes = vec!["g1".to_string()];

        let ok = CellSet::new(genes.clone(), vec![CellRecord::new("c1", "T", "s1", vec![1])])
            .unwrap();
        assert!(meta.validate_cells(&ok).is_ok());

        let bad = CellSet::new(genes, vec![CellRecord::new("c1", "T", "s9", vec![1])]).unwrap();
        assert!(matches!(
            meta.validate_cells(&bad),
            Err(PbdsError::SampleMismatch(_))
        ));
    }
}
