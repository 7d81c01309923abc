//! Execution records, run reports and the live status board
//!
//! Records are owned and mutated by the scheduler alone. Readers (the CLI
//! progress logger, embedders) observe the run through [`StatusBoard`], an
//! `ArcSwap` cell the scheduler republishes after every transition.

use crate::error::ExecutionError;
use crate::runtime::queue::SubmissionHandle;
use crate::runtime::resolve::SlotMap;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of one node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Submitted,
    Succeeded,
    Failed,
    /// Satisfied from the cache without running
    Skipped,
    Cancelled,
}

impl NodeState {
    /// No further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped | NodeState::Cancelled
        )
    }

    /// Downstream instances may start once a dependency is in this state
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Skipped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Submitted => "submitted",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped (cached)",
            NodeState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why a record is Failed
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// The node itself failed
    Execution { message: String },
    /// An upstream instance in the same family failed; never executed
    Propagated { from: String },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Execution { message } => f.write_str(message),
            Failure::Propagated { from } => write!(f, "not run: upstream '{}' failed", from),
        }
    }
}

/// Per-instance execution record
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub key: String,
    pub template: String,
    pub family: usize,
    pub state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<SubmissionHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(skip_serializing_if = "SlotMap::is_empty")]
    pub outputs: SlotMap,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Pending record for an instance
    pub fn new(key: String, template: String, family: usize) -> Self {
        Self {
            key,
            template,
            family,
            state: NodeState::Pending,
            fingerprint: None,
            handle: None,
            failure: None,
            outputs: SlotMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Mark failed by this instance's own error
    pub fn fail(&mut self, error: &ExecutionError) {
        self.finish(NodeState::Failed);
        self.failure = Some(Failure::Execution {
            message: error.to_string(),
        });
    }

    /// Mark failed because upstream `from` failed; never started
    pub fn fail_propagated(&mut self, from: &str) {
        self.finish(NodeState::Failed);
        self.failure = Some(Failure::Propagated { from: from.to_string() });
    }

    /// Failed without having run
    pub fn is_propagated_failure(&self) -> bool {
        matches!(self.failure, Some(Failure::Propagated { .. }))
    }

    /// Enter `Running` or `Submitted` and stamp the start time
    pub fn start(&mut self, state: NodeState) {
        self.state = state;
        self.started_at.get_or_insert_with(Utc::now);
    }

    /// Enter a terminal state and stamp the finish time
    pub fn finish(&mut self, state: NodeState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

/// Terminal status of one tuple family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FamilyState {
    /// Every instance Succeeded or Skipped
    Succeeded,
    Failed,
    Cancelled,
    /// Still has non-terminal instances (only seen in live snapshots)
    InProgress,
}

/// Per-tuple summary
#[derive(Debug, Clone, Serialize)]
pub struct FamilyStatus {
    /// Tuple values, e.g. `s1`
    pub tuple: String,
    pub state: FamilyState,
    /// Configured as best-effort: a failure does not fail the run
    pub best_effort: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<FirstFailure>,
}

impl FamilyStatus {
    /// Fail the family after its nodes finished, keeping any earlier first failure
    pub fn fail_late(&mut self, node: impl Into<String>, cause: impl Into<String>) {
        if self.state == FamilyState::Succeeded {
            self.state = FamilyState::Failed;
        }
        if self.first_failure.is_none() {
            self.first_failure = Some(FirstFailure {
                node: node.into(),
                cause: cause.into(),
            });
        }
    }
}

/// The node that failed first within a family, with its cause
#[derive(Debug, Clone, Serialize)]
pub struct FirstFailure {
    pub node: String,
    pub cause: String,
}

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every family succeeded, or failed only where best-effort
    Succeeded,
    /// Some required families failed, others succeeded
    PartialSuccess,
    /// No required family succeeded
    Failed,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::PartialSuccess => "partial success",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// External work performed during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvocationCounts {
    pub local_runs: usize,
    pub remote_submissions: usize,
    pub cache_hits: usize,
}

impl InvocationCounts {
    /// External tool invocations, local or remote
    pub fn external(&self) -> usize {
        self.local_runs + self.remote_submissions
    }
}

/// Final report of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: String,
    pub outcome: RunOutcome,
    pub families: Vec<FamilyStatus>,
    pub counts: InvocationCounts,
    pub records: Vec<ExecutionRecord>,
    /// Sink outputs copied into the results directory
    pub results: Vec<std::path::PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Record by instance key, e.g. `recon[s1]`
    pub fn record(&self, key: &str) -> Option<&ExecutionRecord> {
        self.records.iter().find(|r| r.key == key)
    }

    /// Family summary by tuple display, e.g. `s1`
    pub fn family(&self, tuple: &str) -> Option<&FamilyStatus> {
        self.families.iter().find(|f| f.tuple == tuple)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} of '{}': {}", self.run_id, self.pipeline, self.outcome)?;
        writeln!(
            f,
            "  {} local run(s), {} remote submission(s), {} cache hit(s)",
            self.counts.local_runs, self.counts.remote_submissions, self.counts.cache_hits
        )?;
        for family in &self.families {
            let label = if family.tuple.is_empty() { "(single)" } else { &family.tuple };
            match &family.first_failure {
                Some(first) => writeln!(
                    f,
                    "  {:<16} {:?}{} - first failure at {}: {}",
                    label,
                    family.state,
                    if family.best_effort { " (best effort)" } else { "" },
                    first.node,
                    first.cause
                )?,
                None => writeln!(f, "  {:<16} {:?}", label, family.state)?,
            }
        }
        Ok(())
    }
}

/// Summarize one family from its records
///
/// The first failure is the earliest-finishing non-propagated failure.
pub fn family_status<'a>(
    tuple: String,
    best_effort: bool,
    records: impl Iterator<Item = &'a ExecutionRecord>,
) -> FamilyStatus {
    let mut state = FamilyState::Succeeded;
    let mut first: Option<&ExecutionRecord> = None;
    for record in records {
        match record.state {
            NodeState::Succeeded | NodeState::Skipped => {}
            NodeState::Failed => {
                state = FamilyState::Failed;
                if !record.is_propagated_failure()
                    && first.map_or(true, |f| record.finished_at < f.finished_at)
                {
                    first = Some(record);
                }
            }
            NodeState::Cancelled => {
                if state != FamilyState::Failed {
                    state = FamilyState::Cancelled;
                }
            }
            _ => {
                if state == FamilyState::Succeeded {
                    state = FamilyState::InProgress;
                }
            }
        }
    }
    FamilyStatus {
        tuple,
        state,
        best_effort,
        first_failure: first.map(|r| FirstFailure {
            node: r.key.clone(),
            cause: r.failure.as_ref().map(ToString::to_string).unwrap_or_default(),
        }),
    }
}

/// Decide the run outcome from family summaries
pub fn run_outcome(families: &[FamilyStatus], cancelled: bool) -> RunOutcome {
    if cancelled {
        return RunOutcome::Cancelled;
    }
    let required: Vec<&FamilyStatus> = families.iter().filter(|f| !f.best_effort).collect();
    let failed = required.iter().filter(|f| f.state != FamilyState::Succeeded).count();
    if failed == 0 {
        RunOutcome::Succeeded
    } else if failed < required.len() || families.iter().any(|f| f.state == FamilyState::Succeeded) {
        RunOutcome::PartialSuccess
    } else {
        RunOutcome::Failed
    }
}

/// Immutable view of a run in progress
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub total: usize,
    pub by_state: BTreeMap<NodeState, usize>,
    pub families: Vec<FamilyStatus>,
    pub counts: InvocationCounts,
    pub finished: bool,
}

impl RunSnapshot {
    /// Instances currently in `state`
    pub fn count(&self, state: NodeState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }

    /// Instances in a terminal state
    pub fn done(&self) -> usize {
        self.by_state
            .iter()
            .filter(|(state, _)| state.is_terminal())
            .map(|(_, n)| n)
            .sum()
    }
}

/// Lock-free published run status
#[derive(Debug, Default)]
pub struct StatusBoard {
    current: ArcSwap<RunSnapshot>,
}

impl StatusBoard {
    /// Empty board; readers see a default snapshot until the first publish
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the current snapshot
    pub fn publish(&self, snapshot: RunSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<RunSnapshot> {
        self.current.load_full()
    }
}

/// Snapshot of a record table
pub fn snapshot_of(
    run_id: &str,
    records: &[ExecutionRecord],
    families: Vec<FamilyStatus>,
    counts: InvocationCounts,
    finished: bool,
) -> RunSnapshot {
    let mut by_state = BTreeMap::new();
    for record in records {
        *by_state.entry(record.state).or_insert(0) += 1;
    }
    RunSnapshot {
        run_id: run_id.to_string(),
        total: records.len(),
        by_state,
        families,
        counts,
        finished,
    }
}
