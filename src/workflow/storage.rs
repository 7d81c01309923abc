//! Pipeline definition files
//!
//! Pipelines are stored as pretty-printed JSON so they can be reviewed and
//! versioned alongside the study they process.

use crate::workflow::types::PipelineTemplate;
use anyhow::{Context, Result};
use std::path::Path;

/// Load a pipeline definition from a JSON file
pub async fn load_pipeline(path: &Path) -> Result<PipelineTemplate> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read pipeline file '{}'", path.display()))?;
    let pipeline: PipelineTemplate = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid pipeline definition in '{}'", path.display()))?;

    tracing::info!(
        "📥 Loaded pipeline '{}' ({} nodes, {} connections) from {}",
        pipeline.name,
        pipeline.nodes.len(),
        pipeline.connections.len(),
        path.display()
    );
    Ok(pipeline)
}

/// Write a pipeline definition as JSON, creating parent directories
pub async fn save_pipeline(pipeline: &PipelineTemplate, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(pipeline)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write pipeline file '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::builder::PipelineBuilder;
    use crate::workflow::types::{NodeTemplate, SlotKind};

    #[tokio::test]
    async fn test_save_and_load_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("defs/pipeline.json");
        let pipeline = PipelineBuilder::new("roundtrip")
            .axis("subject_id", ["s1"])
            .node(NodeTemplate::new("a", "true").output("out", "a.txt"))
            .node(NodeTemplate::new("b", "true").input("in", SlotKind::File))
            .connect(("a", "out"), ("b", "in"))
            .build();

        save_pipeline(&pipeline, &path).await.unwrap();
        let loaded = load_pipeline(&path).await.unwrap();
        assert_eq!(loaded, pipeline);
    }

    #[tokio::test]
    async fn test_load_reports_path_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = load_pipeline(&path).await.unwrap_err();
        assert!(format!("{:#}", err).contains("broken.json"));
    }
}
