//! Node instance fingerprints
//!
//! A fingerprint is a SHA-256 over the template name, the resolved
//! parameters, the rendered command line, the expected output paths and
//! every input. File inputs contribute either their content or, when content
//! hashing is disabled, their size and modification time.

use crate::error::ExecutionError;
use crate::runtime::invocation::Command;
use crate::runtime::resolve::SlotMap;
use crate::workflow::SlotValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// How input files contribute to a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    /// File contents
    Content,
    /// Path, size and modification time
    Metadata,
}

impl HashMode {
    /// Content hashing when enabled, metadata otherwise
    pub fn from_flag(enable_content_hash: bool) -> Self {
        if enable_content_hash {
            HashMode::Content
        } else {
            HashMode::Metadata
        }
    }
}

/// Everything a fingerprint covers, owned so hashing can move off the runtime
#[derive(Debug, Clone)]
pub struct FingerprintInput {
    pub template: String,
    pub params: BTreeMap<String, String>,
    pub program: String,
    pub args: Vec<String>,
    pub inputs: SlotMap,
    pub outputs: SlotMap,
}

impl FingerprintInput {
    pub fn new(
        template: &str,
        params: &BTreeMap<String, String>,
        command: &Command,
        inputs: &SlotMap,
        outputs: &SlotMap,
    ) -> Self {
        Self {
            template: template.to_string(),
            params: params.clone(),
            program: command.program.clone(),
            args: command.args.clone(),
            inputs: inputs.clone(),
            outputs: outputs.clone(),
        }
    }
}

/// Compute the hex fingerprint on the blocking pool
pub async fn compute(input: FingerprintInput, mode: HashMode) -> Result<String, ExecutionError> {
    tokio::task::spawn_blocking(move || compute_blocking(&input, mode))
        .await
        .map_err(|e| ExecutionError::WorkerPanicked(format!("fingerprint task failed: {}", e)))?
}

/// Hash an invocation; reads files, so call it off the async runtime
pub fn compute_blocking(input: &FingerprintInput, mode: HashMode) -> Result<String, ExecutionError> {
    let mut hasher = Sha256::new();
    field(&mut hasher, "template", input.template.as_bytes());
    for (key, value) in &input.params {
        field(&mut hasher, "param", key.as_bytes());
        field(&mut hasher, "value", value.as_bytes());
    }
    field(&mut hasher, "program", input.program.as_bytes());
    for arg in &input.args {
        field(&mut hasher, "arg", arg.as_bytes());
    }
    for (slot, value) in &input.outputs {
        field(&mut hasher, "output", slot.as_bytes());
        for path in value.paths() {
            field(&mut hasher, "path", path.as_os_str().as_encoded_bytes());
        }
    }
    for (slot, value) in &input.inputs {
        field(&mut hasher, "input", slot.as_bytes());
        match value {
            SlotValue::Scalar(s) => field(&mut hasher, "scalar", s.as_bytes()),
            _ => {
                for path in value.paths() {
                    hash_path(&mut hasher, slot, path, mode)?;
                }
            }
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Tagged, length-prefixed field so adjacent values cannot run together
fn field(hasher: &mut Sha256, tag: &str, value: &[u8]) {
    hasher.update(tag.as_bytes());
    hasher.update([0u8]);
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value);
}

fn hash_path(hasher: &mut Sha256, slot: &str, path: &Path, mode: HashMode) -> Result<(), ExecutionError> {
    let missing = || ExecutionError::MissingInput {
        slot: slot.to_string(),
        path: path.to_path_buf(),
    };
    field(hasher, "file", path.as_os_str().as_encoded_bytes());

    let metadata = std::fs::metadata(path).map_err(|_| missing())?;
    if metadata.is_dir() {
        let entries = WalkDir::new(path).sort_by_file_name().min_depth(1);
        for entry in entries {
            let entry = entry.map_err(|e| ExecutionError::Io(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
            field(hasher, "entry", rel.as_os_str().as_encoded_bytes());
            hash_file(hasher, entry.path(), mode)?;
        }
        Ok(())
    } else {
        hash_file(hasher, path, mode)
    }
}

fn hash_file(hasher: &mut Sha256, path: &Path, mode: HashMode) -> Result<(), ExecutionError> {
    match mode {
        HashMode::Content => {
            let mut file = std::fs::File::open(path)?;
            let mut content = Sha256::new();
            std::io::copy(&mut file, &mut content)?;
            field(hasher, "content", &content.finalize());
        }
        HashMode::Metadata => {
            let metadata = std::fs::metadata(path)?;
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            field(hasher, "size", &metadata.len().to_le_bytes());
            field(hasher, "mtime", &mtime.to_le_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn input_for(file: &Path) -> FingerprintInput {
        FingerprintInput {
            template: "lh_convert".into(),
            params: BTreeMap::from([("mesh_format".to_string(), "stl".to_string())]),
            program: "mris_convert".into(),
            args: vec![file.display().to_string(), "lh.pial.stl".into()],
            inputs: SlotMap::from([("surface".to_string(), SlotValue::File(file.to_path_buf()))]),
            outputs: SlotMap::from([("mesh".to_string(), SlotValue::File(PathBuf::from("/w/s1/lh.pial.stl")))]),
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lh.pial");
        std::fs::write(&file, b"surface-v1").unwrap();

        let a = compute_blocking(&input_for(&file), HashMode::Content).unwrap();
        let b = compute_blocking(&input_for(&file), HashMode::Content).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_content_change_changes_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lh.pial");
        std::fs::write(&file, b"surface-v1").unwrap();
        let before = compute_blocking(&input_for(&file), HashMode::Content).unwrap();

        std::fs::write(&file, b"surface-v2").unwrap();
        let after = compute_blocking(&input_for(&file), HashMode::Content).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_params_change_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lh.pial");
        std::fs::write(&file, b"surface").unwrap();

        let base = input_for(&file);
        let mut changed = base.clone();
        changed.params.insert("mesh_format".into(), "vtk".into());
        assert_ne!(
            compute_blocking(&base, HashMode::Metadata).unwrap(),
            compute_blocking(&changed, HashMode::Metadata).unwrap()
        );
    }

    #[test]
    fn test_directory_inputs_are_walked() {
        let dir = tempfile::tempdir().unwrap();
        let subject = dir.path().join("s1");
        std::fs::create_dir_all(subject.join("surf")).unwrap();
        std::fs::write(subject.join("surf/lh.pial"), b"a").unwrap();

        let input = input_for(&subject);
        let before = compute_blocking(&input, HashMode::Content).unwrap();
        std::fs::write(subject.join("surf/rh.pial"), b"b").unwrap();
        let after = compute_blocking(&input, HashMode::Content).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_input_is_reported() {
        let err = compute_blocking(&input_for(Path::new("/nonexistent/lh.pial")), HashMode::Content).unwrap_err();
        assert!(matches!(err, ExecutionError::MissingInput { slot, .. } if slot == "surface"));
    }
}
