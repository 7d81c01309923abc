//! Output sink
//!
//! Copies each family's designated outputs to
//! `<results_dir>/<tuple path>/<logical_name>`. A file output becomes a file
//! of that name; a file list becomes a directory holding its files.

use crate::error::EngineError;
use crate::runtime::expand::ExpandedPipeline;
use crate::runtime::status::{ExecutionRecord, NodeState};
use crate::workflow::SlotValue;
use std::io;
use std::path::{Path, PathBuf};

/// A result that could not be written
#[derive(Debug)]
pub struct SinkFailure {
    /// Index of the tuple family the result belongs to
    pub family: usize,
    /// Instance whose output was being copied
    pub node: String,
    pub error: EngineError,
}

/// What the sink wrote, and what it could not
#[derive(Debug, Default)]
pub struct SinkReport {
    pub written: Vec<PathBuf>,
    pub failures: Vec<SinkFailure>,
}

/// Copy sink outputs of every instance that produced them
///
/// Families whose source instance did not succeed (or was skipped) are
/// left out; nothing stale is written for them. A failed copy is recorded
/// against its family and the remaining results are still written.
pub async fn collect_results(
    expanded: &ExpandedPipeline,
    records: &[ExecutionRecord],
    results_dir: &Path,
) -> SinkReport {
    let mut report = SinkReport::default();

    for (family, tuple) in expanded.tuples.iter().enumerate() {
        for sink in &expanded.sinks {
            let Some(instance) = expanded.find(family, &sink.source.node) else {
                continue;
            };
            let record = &records[instance.id.0];
            if !matches!(record.state, NodeState::Succeeded | NodeState::Skipped) {
                continue;
            }
            let Some(value) = record.outputs.get(&sink.source.slot) else {
                continue;
            };

            let target = results_dir.join(tuple.rel_path()).join(&sink.logical_name);
            match copy_value(value, &target).await {
                Ok(()) => {
                    tracing::info!("📦 {} -> {}", record.key, target.display());
                    report.written.push(target);
                }
                Err(source) => {
                    tracing::error!("❌ Failed to write result '{}' for {}: {}", sink.logical_name, record.key, source);
                    report.failures.push(SinkFailure {
                        family,
                        node: record.key.clone(),
                        error: EngineError::Sink { target, source },
                    });
                }
            }
        }
    }

    report
}

async fn copy_value(value: &SlotValue, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match value {
        SlotValue::File(path) => {
            tokio::fs::copy(path, target).await?;
        }
        SlotValue::Files(paths) => {
            tokio::fs::create_dir_all(target).await?;
            for path in paths {
                let name = path.file_name().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("output path has no file name: {}", path.display()),
                    )
                })?;
                tokio::fs::copy(path, target.join(name)).await?;
            }
        }
        SlotValue::Scalar(text) => {
            tokio::fs::write(target, text).await?;
        }
    }
    Ok(())
}
