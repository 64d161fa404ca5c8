use std::collections::BTreeSet;
use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::ConnError;
use crate::paths;

pub const DEFAULT_DATASET_NAME: &str = "BIDS Dataset";
pub const DEFAULT_DATASET_TYPE: &str = "raw";

const BOLD_SIDECAR: &str = "*_bold.json";
const BOLD_IMAGE: &str = "*_bold.nii*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidsMetadata {
    pub num_subjects: usize,
    pub subjects: Vec<String>,
    pub tr: Option<f64>,
    pub sessions: Vec<String>,
    pub num_functional_files: usize,
    pub name: Option<String>,
    pub dataset_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescription {
    pub name: String,
    pub dataset_type: String,
}

#[derive(Debug, Deserialize)]
struct RawDescription {
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "DatasetType")]
    dataset_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BidsMetadataReader {
    root: Utf8PathBuf,
}

impl BidsMetadataReader {
    pub fn open(root: &Utf8Path) -> Result<Self, ConnError> {
        if !root.exists() {
            return Err(ConnError::PathNotFound {
                kind: "BIDS directory",
                path: root.to_owned(),
            });
        }
        let reader = Self {
            root: root.to_owned(),
        };
        if !reader.description_path().exists() {
            warn!("no dataset_description.json found in {}", reader.root);
        }
        Ok(reader)
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn description_path(&self) -> Utf8PathBuf {
        self.root.join("dataset_description.json")
    }

    pub fn subjects(&self) -> Vec<String> {
        prefixed_dirs(&self.root, "sub-").into_iter().collect()
    }

    pub fn number_of_subjects(&self) -> usize {
        self.subjects().len()
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut sessions = BTreeSet::new();
        for subject in self.subjects() {
            sessions.extend(prefixed_dirs(&self.root.join(&subject), "ses-"));
        }
        sessions.into_iter().collect()
    }

    pub fn repetition_time(&self) -> Option<f64> {
        let pattern = Pattern::new(BOLD_SIDECAR).ok()?;
        let sidecar = self.matching_files(&pattern).into_iter().next()?;
        debug!("reading repetition time from {}", sidecar);
        let content = fs::read_to_string(&sidecar).ok()?;
        let value: serde_json::Value = serde_json::from_str(&content).ok()?;
        let tr = match value.get("RepetitionTime")? {
            serde_json::Value::Number(number) => number.as_f64(),
            serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        (tr.is_finite() && tr > 0.0).then_some(tr)
    }

    pub fn functional_file_count(&self) -> usize {
        match Pattern::new(BOLD_IMAGE) {
            Ok(pattern) => self.matching_files(&pattern).len(),
            Err(_) => 0,
        }
    }

    pub fn description(&self) -> Option<DatasetDescription> {
        let content = fs::read_to_string(self.description_path()).ok()?;
        let raw: RawDescription = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("unreadable dataset_description.json: {err}");
                return None;
            }
        };
        Some(DatasetDescription {
            name: raw.name.unwrap_or_else(|| DEFAULT_DATASET_NAME.to_string()),
            dataset_type: raw
                .dataset_type
                .unwrap_or_else(|| DEFAULT_DATASET_TYPE.to_string()),
        })
    }

    pub fn acquisition_parameters(&self) -> BidsMetadata {
        let subjects = self.subjects();
        let description = self.description();
        BidsMetadata {
            num_subjects: subjects.len(),
            subjects,
            tr: self.repetition_time(),
            sessions: self.sessions(),
            num_functional_files: self.functional_file_count(),
            name: description.as_ref().map(|desc| desc.name.clone()),
            dataset_type: description.map(|desc| desc.dataset_type),
        }
    }

    fn matching_files(&self, pattern: &Pattern) -> Vec<Utf8PathBuf> {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| pattern.matches(name))
                    .unwrap_or(false)
            })
            .filter_map(|entry| paths::to_utf8(entry.into_path()).ok())
            .collect()
    }
}

fn prefixed_dirs(dir: &Utf8Path, prefix: &str) -> BTreeSet<String> {
    let Ok(entries) = dir.read_dir_utf8() else {
        return BTreeSet::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir() && entry.file_name().starts_with(prefix))
        .map(|entry| entry.file_name().to_string())
        .collect()
}

impl fmt::Display for BidsMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{rule}")?;
        writeln!(f, "BIDS DATASET SUMMARY")?;
        writeln!(f, "{rule}")?;
        writeln!(
            f,
            "Dataset Name: {}",
            self.name.as_deref().unwrap_or("Unknown")
        )?;
        writeln!(
            f,
            "Dataset Type: {}",
            self.dataset_type.as_deref().unwrap_or("Unknown")
        )?;
        writeln!(f, "Number of Subjects: {}", self.num_subjects)?;
        if !self.subjects.is_empty() {
            let shown = self.subjects.iter().take(5).cloned().collect::<Vec<_>>();
            write!(f, "Subject IDs: {}", shown.join(", "))?;
            if self.subjects.len() > 5 {
                write!(f, ", ... (+{} more)", self.subjects.len() - 5)?;
            }
            writeln!(f)?;
        }
        if !self.sessions.is_empty() {
            writeln!(f, "Sessions: {}", self.sessions.join(", "))?;
        }
        match self.tr {
            Some(tr) => writeln!(f, "TR (RepetitionTime): {tr:.2} seconds")?,
            None => writeln!(f, "TR (RepetitionTime): Not found in metadata")?,
        }
        writeln!(f, "Functional Files: {}", self.num_functional_files)?;
        write!(f, "{rule}")
    }
}
