//! reconflow: graph-structured orchestration of external neuroimaging tools
//!
//! Pipelines are declared once as templates, expanded over per-subject axis
//! values, validated as a DAG, and executed locally or on a batch queue with
//! per-subject failure isolation and a fingerprint cache that skips unchanged
//! work.

// Run configuration (TOML file plus environment overrides)
pub mod config;

// Typed error taxonomy
pub mod error;

// Pipeline definitions: templates, transforms, builder, pipeline files
pub mod workflow;

// Expansion, graph validation, scheduling and execution
pub mod runtime;

// Fingerprints and the persistent execution cache
pub mod cache;

// Per-subject input file discovery
pub mod dataset;

// Copying final outputs into the results layout
pub mod sink;

// Re-export commonly used types for external consumers
pub use config::{ExecutionMode, RunConfig};
pub use dataset::{DatasetSource, DirectoryDataset, StaticDataset};
pub use error::{ConfigError, EngineError, ExecutionError, NoMatchError, ValidationErrors};
pub use runtime::{ExecutionEngine, NodeState, RunOutcome, RunReport};
pub use workflow::{NodeTemplate, PipelineBuilder, PipelineTemplate, SlotKind, Transform};
