//! Dataset discovery
//!
//! Maps each tuple to the list of raw input files available to it. The core
//! only needs the mapping to be deterministic; how a dataset is laid out is
//! up to the [`DatasetSource`] implementation.

use crate::runtime::expand::AxisTuple;
use crate::workflow::surface::SUBJECT_AXIS;
use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Provides the input file list of a tuple
pub trait DatasetSource: Send + Sync {
    /// Files for the tuple, in a stable order
    fn files(&self, tuple: &AxisTuple) -> Result<Vec<PathBuf>>;
}

/// Explicit subject -> files mapping
#[derive(Debug, Clone, Default)]
pub struct StaticDataset {
    files: HashMap<String, Vec<PathBuf>>,
}

impl StaticDataset {
    /// Dataset with no subjects
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the files of one subject
    pub fn with_subject<I, P>(mut self, subject: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files
            .insert(subject.into(), files.into_iter().map(Into::into).collect());
        self
    }
}

impl DatasetSource for StaticDataset {
    fn files(&self, tuple: &AxisTuple) -> Result<Vec<PathBuf>> {
        let subject = tuple.get(SUBJECT_AXIS).unwrap_or_default();
        Ok(self.files.get(subject).cloned().unwrap_or_default())
    }
}

/// Files found on disk under a dataset root
///
/// A subject's files are everything below `<root>/<subject>/`, or when that
/// directory does not exist, the top-level files of `<root>` whose names
/// start with the subject id followed by `_`, `-`, `.` or nothing else. A
/// subject with neither yields an empty list.
/// With a suffix set, only file names ending in it are kept.
#[derive(Debug, Clone)]
pub struct DirectoryDataset {
    root: PathBuf,
    suffix: Option<String>,
}

impl DirectoryDataset {
    /// Discover files under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            suffix: None,
        }
    }

    /// Keep only files whose name ends in `suffix`
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    fn keeps(&self, name: &str) -> bool {
        self.suffix.as_deref().map_or(true, |suffix| name.ends_with(suffix))
    }
}

/// `s1_T1w.nii.gz` belongs to `s1`, `s10_T1w.nii.gz` does not
fn names_subject(name: &str, subject: &str) -> bool {
    name.strip_prefix(subject)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(['_', '-', '.']))
}

impl DatasetSource for DirectoryDataset {
    fn files(&self, tuple: &AxisTuple) -> Result<Vec<PathBuf>> {
        let Some(subject) = tuple.get(SUBJECT_AXIS) else {
            return Ok(Vec::new());
        };

        let subject_dir = self.root.join(subject);
        let mut files = Vec::new();
        if subject_dir.is_dir() {
            for entry in WalkDir::new(&subject_dir).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file() && self.keeps(&entry.file_name().to_string_lossy()) {
                    files.push(entry.into_path());
                }
            }
        } else if self.root.is_dir() {
            for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1).sort_by_file_name() {
                let entry = entry?;
                let matches = {
                    let name = entry.file_name().to_string_lossy();
                    names_subject(&name, subject) && self.keeps(&name)
                };
                if entry.file_type().is_file() && matches {
                    files.push(entry.into_path());
                }
            }
        }

        tracing::debug!("📂 Found {} dataset file(s) for subject '{}'", files.len(), subject);
        Ok(files)
    }
}
