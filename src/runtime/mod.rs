//! Runtime Execution Engine
//!
//! This module turns validated pipeline templates into runs. It handles:
//! - Expanding templates over axis values into node instances
//! - Building and validating the petgraph instance DAG
//! - Resolving inputs and rendering tool invocations
//! - Scheduling local processes and remote batch jobs
//! - Tracking per-node state and publishing run progress

// Axis expansion into per-tuple node instances
pub mod expand;

// Input slot resolution through transforms
pub mod resolve;

// Instance DAG construction and validation
pub mod graph;

// Placeholder rendering of commands and output paths
pub mod invocation;

// Local external-process execution
pub mod executor;

// Remote batch queue submission and polling
pub mod queue;

// Execution records, run reports and the live status board
pub mod status;

// Central scheduler owning all execution records
pub mod scheduler;

// Run orchestration from template to report
pub mod engine;

// Re-export main types
pub use engine::ExecutionEngine;
pub use executor::LocalExecutor;
pub use expand::{AxisTuple, ExpandedPipeline, InstanceId, NodeInstance};
pub use graph::PipelineGraph;
pub use queue::{CommandQueue, PollPolicy, RemoteJob, RemoteQueue, RemoteStatus, SubmissionHandle};
pub use status::{
    ExecutionRecord, FamilyState, FamilyStatus, NodeState, RunOutcome, RunReport, RunSnapshot, StatusBoard,
};
