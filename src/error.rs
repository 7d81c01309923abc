//! Error taxonomy for pipeline construction and execution
//!
//! Configuration errors are detected before any external process runs and are
//! always reported together. Resolution and execution errors are recorded on
//! the node instance that hit them and only affect its tuple family.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single graph-construction violation
///
/// Every variant carries enough identification (node, slot, axis) for a user
/// to locate the problem in the pipeline definition without re-running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("axis '{axis}' has no values")]
    EmptyAxis { axis: String },

    #[error("axis '{axis}' is declared more than once")]
    DuplicateAxis { axis: String },

    #[error("axis '{axis}' value '{value}' is not usable as a directory name")]
    InvalidAxisValue { axis: String, value: String },

    #[error("node '{node}' is declared more than once")]
    DuplicateNode { node: String },

    #[error("{context} references unknown node '{node}'")]
    UnknownNode { context: String, node: String },

    #[error("node '{node}' has no {direction} slot named '{slot}'")]
    UnknownSlot {
        node: String,
        slot: String,
        direction: &'static str,
    },

    #[error("cannot bind {source_desc} to '{node}.{slot}' ({expected}): {reason}")]
    IncompatibleSlots {
        node: String,
        slot: String,
        source_desc: String,
        expected: String,
        reason: String,
    },

    #[error("transform '{transform}' into '{node}.{slot}' takes {expected} source(s), got {actual}")]
    InvalidArity {
        node: String,
        slot: String,
        transform: String,
        expected: String,
        actual: usize,
    },

    #[error("dependency cycle between nodes: {}", nodes.join(" -> "))]
    Cycle { nodes: Vec<String> },

    #[error("input '{node}.{slot}' has no incoming connection")]
    UnboundInput { node: String, slot: String },

    #[error("input '{node}.{slot}' is bound {count} times")]
    DuplicateBinding {
        node: String,
        slot: String,
        count: usize,
    },

    #[error("node '{node}' uses unknown placeholder '{{{placeholder}}}' in {location}")]
    UnresolvedPlaceholder {
        node: String,
        placeholder: String,
        location: String,
    },

    #[error("sink '{sink}' targets missing output '{node}.{slot}'")]
    UnknownSinkTarget {
        sink: String,
        node: String,
        slot: String,
    },
}

/// Every violation found while validating a pipeline
///
/// Never empty; built through [`ValidationErrors::from_vec`] or
/// [`ValidationErrors::single`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(Vec<ConfigError>);

impl ValidationErrors {
    /// Wrap a list of violations, returning `None` when the list is empty
    pub fn from_vec(errors: Vec<ConfigError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self(errors))
        }
    }

    /// A single violation
    pub fn single(error: ConfigError) -> Self {
        Self(vec![error])
    }

    /// Violations in detection order
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any violation matches the predicate
    pub fn contains(&self, predicate: impl Fn(&ConfigError) -> bool) -> bool {
        self.0.iter().any(predicate)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pipeline validation failed with {} error(s):", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            writeln!(f, "  {}. {}", i + 1, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// A selection transform found nothing matching among its candidates
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no match for {predicate} when resolving '{node}.{slot}' (candidates: {candidates:?})")]
pub struct NoMatchError {
    pub node: String,
    pub slot: String,
    pub predicate: String,
    pub candidates: Vec<String>,
}

/// Why a single node instance failed
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Resolution(#[from] NoMatchError),

    #[error("input '{slot}' does not exist: {}", path.display())]
    MissingInput { slot: String, path: PathBuf },

    #[error("cannot render invocation: {0}")]
    Render(String),

    #[error("failed to start '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("'{program}' exited with status {code}{}", format_tail(stderr_tail))]
    NonZeroExit {
        program: String,
        code: i32,
        stderr_tail: String,
    },

    #[error("'{program}' was terminated by a signal")]
    Terminated { program: String },

    #[error("expected output '{slot}' was not produced: {}", path.display())]
    MissingOutput { slot: String, path: PathBuf },

    #[error("expected output '{slot}' is empty: {}", path.display())]
    EmptyOutput { slot: String, path: PathBuf },

    #[error("queue submission failed: {0}")]
    Submission(String),

    #[error("remote job {handle} finished as {state}")]
    RemoteFailed { handle: String, state: String },

    #[error("remote job {handle} vanished from the queue after {polls} polls")]
    Lost { handle: String, polls: u32 },

    #[error("cancelled")]
    Cancelled,

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ExecutionError {
    fn from(err: std::io::Error) -> Self {
        ExecutionError::Io(err.to_string())
    }
}

fn format_tail(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {}", tail)
    }
}

/// Failures that stop a whole run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("cache store error: {0}")]
    Cache(#[from] sqlx::Error),

    #[error("cache entry is corrupt: {0}")]
    CacheDecode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dataset discovery failed for {tuple}: {message}")]
    Dataset { tuple: String, message: String },

    #[error("cannot write result {}: {source}", target.display())]
    Sink {
        target: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}
