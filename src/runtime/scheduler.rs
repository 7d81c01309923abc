//! Run scheduler
//!
//! The scheduler is the only owner of execution records, the in-flight
//! fingerprint table and the cache store. Work happens in two phases on
//! spawned tasks:
//!
//! - prepare: resolve inputs, render the command, fingerprint
//! - execute: run locally (bounded by a semaphore) or submit remotely
//!
//! Tasks never touch shared state; they send [`Report`]s over one channel
//! and the scheduler loop applies the resulting transitions. A task that
//! panics is detected through its `JoinSet` handle and fails its node.

use crate::cache::{fingerprint, CacheEntry, CacheStore, FingerprintInput, HashMode};
use crate::error::ExecutionError;
use crate::runtime::executor::LocalExecutor;
use crate::runtime::expand::{AxisTuple, InstanceId, NodeInstance};
use crate::runtime::graph::PipelineGraph;
use crate::runtime::invocation::{self, Command};
use crate::runtime::queue::{wait_for_job, PollPolicy, RemoteJob, RemoteQueue, SubmissionHandle};
use crate::runtime::resolve::{self, Binding, ResolveContext, SlotMap};
use crate::runtime::status::{
    family_status, snapshot_of, ExecutionRecord, FamilyStatus, InvocationCounts, NodeState, StatusBoard,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Where execute-phase work goes
#[derive(Clone)]
pub enum Backend {
    Local(LocalExecutor),
    Remote {
        queue: Arc<dyn RemoteQueue>,
        default_queue: Option<String>,
        poll: PollPolicy,
    },
}

/// Per-run scheduling settings
pub struct SchedulerOptions {
    pub run_id: String,
    pub work_dir: PathBuf,
    /// Concurrent local processes, and concurrent input hashing
    pub local_workers: usize,
    pub hash_mode: HashMode,
    /// Per tuple family: failure does not fail the run
    pub best_effort: Vec<bool>,
}

/// Records and counters at the end of scheduling
pub struct ScheduleResult {
    pub records: Vec<ExecutionRecord>,
    pub counts: InvocationCounts,
    pub cancelled: bool,
}

/// Output of the prepare phase
#[derive(Debug, Clone)]
struct Prepared {
    command: Command,
    outputs: SlotMap,
    fingerprint: String,
}

/// Worker-to-scheduler messages
enum Report {
    Prepared {
        id: InstanceId,
        result: Result<Prepared, ExecutionError>,
    },
    /// A local process acquired a worker slot and is starting
    Started { id: InstanceId },
    Submitted { id: InstanceId, handle: SubmissionHandle },
    Finished {
        id: InstanceId,
        result: Result<(), ExecutionError>,
    },
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Prepare,
    Execute,
}

/// Everything a prepare task needs, owned
struct PrepareJob {
    instance: NodeInstance,
    tuple: AxisTuple,
    bindings: BTreeMap<String, Binding>,
    upstream: HashMap<InstanceId, SlotMap>,
    dataset: Arc<Vec<PathBuf>>,
    work_dir: PathBuf,
    hash_mode: HashMode,
    hash_slots: Arc<Semaphore>,
}

impl PrepareJob {
    async fn run(self) -> Result<Prepared, ExecutionError> {
        let ctx = ResolveContext {
            tuple: &self.tuple,
            dataset_files: &self.dataset,
            upstream: &self.upstream,
        };
        let inputs = resolve::resolve_inputs(&self.instance.key, &self.instance.template, &self.bindings, &ctx)?;

        let dir = invocation::node_dir(&self.work_dir, &self.tuple, self.instance.name());
        let outputs = invocation::expected_outputs(&self.instance, &self.tuple, &dir, &self.work_dir)?;
        let command =
            invocation::render_command(&self.instance, &self.tuple, &inputs, &outputs, &dir, &self.work_dir)?;
        invocation::check_inputs(&inputs).await?;

        let _permit = self
            .hash_slots
            .acquire_owned()
            .await
            .map_err(|e| ExecutionError::Io(e.to_string()))?;
        let input = FingerprintInput::new(self.instance.name(), &self.instance.params, &command, &inputs, &outputs);
        let fingerprint = fingerprint::compute(input, self.hash_mode).await?;

        Ok(Prepared {
            command,
            outputs,
            fingerprint,
        })
    }
}

/// Central scheduler for one run
pub struct Scheduler<'g> {
    graph: &'g PipelineGraph,
    options: SchedulerOptions,
    backend: Backend,
    cache: Option<CacheStore>,
    datasets: Vec<Arc<Vec<PathBuf>>>,
    board: Arc<StatusBoard>,
    cancel: CancellationToken,

    records: Vec<ExecutionRecord>,
    preparing: HashSet<InstanceId>,
    prepared: HashMap<InstanceId, Prepared>,
    /// Fingerprint -> instance currently executing it
    inflight: HashMap<String, InstanceId>,
    /// Instances parked behind an in-flight fingerprint
    waiters: HashMap<String, VecDeque<InstanceId>>,
    counts: InvocationCounts,
    cancelled: bool,

    local_slots: Arc<Semaphore>,
    hash_slots: Arc<Semaphore>,
    tasks: JoinSet<()>,
    task_ids: HashMap<TaskId, (InstanceId, Phase)>,
    tx: mpsc::UnboundedSender<Report>,
    rx: mpsc::UnboundedReceiver<Report>,
}

impl<'g> Scheduler<'g> {
    /// `datasets` holds the discovered input files of each tuple family
    pub fn new(
        graph: &'g PipelineGraph,
        options: SchedulerOptions,
        backend: Backend,
        cache: Option<CacheStore>,
        datasets: Vec<Arc<Vec<PathBuf>>>,
        board: Arc<StatusBoard>,
        cancel: CancellationToken,
    ) -> Self {
        let records = graph
            .instances()
            .iter()
            .map(|i| ExecutionRecord::new(i.key.clone(), i.name().to_string(), i.family))
            .collect();
        let workers = options.local_workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            graph,
            options,
            backend,
            cache,
            datasets,
            board,
            cancel,
            records,
            preparing: HashSet::new(),
            prepared: HashMap::new(),
            inflight: HashMap::new(),
            waiters: HashMap::new(),
            counts: InvocationCounts::default(),
            cancelled: false,
            local_slots: Arc::new(Semaphore::new(workers)),
            hash_slots: Arc::new(Semaphore::new(workers)),
            tasks: JoinSet::new(),
            task_ids: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Drive every instance to a terminal state
    pub async fn run(mut self) -> ScheduleResult {
        tracing::info!(
            "▶️ Scheduling {} instances across {} tuple families",
            self.records.len(),
            self.graph.tuples().len()
        );
        self.publish(false);

        loop {
            if !self.cancelled {
                self.dispatch_ready();
            }
            if self.records.iter().all(|r| r.state.is_terminal()) {
                break;
            }
            if self.tasks.is_empty() && self.rx.is_empty() {
                self.stall();
                break;
            }

            tokio::select! {
                Some(report) = self.rx.recv() => self.handle(report).await,
                Some(joined) = self.tasks.join_next_with_id() => self.reap(joined).await,
                _ = self.cancel.cancelled(), if !self.cancelled => self.cancel_pending(),
            }
            self.publish(false);
        }

        // only stale prepare tasks of abandoned instances can remain
        self.tasks.shutdown().await;
        self.publish(true);

        ScheduleResult {
            records: self.records,
            counts: self.counts,
            cancelled: self.cancelled,
        }
    }

    /// Start the prepare phase of every Pending instance whose dependencies are satisfied
    fn dispatch_ready(&mut self) {
        for &id in self.graph.order() {
            if self.records[id.0].state != NodeState::Pending
                || self.preparing.contains(&id)
                || self.prepared.contains_key(&id)
            {
                continue;
            }
            let upstream = self.graph.upstream(id);
            if upstream.iter().all(|u| self.records[u.0].state.satisfies_dependents()) {
                self.spawn_prepare(id, upstream);
            }
        }
    }

    fn spawn_prepare(&mut self, id: InstanceId, upstream: Vec<InstanceId>) {
        let instance = self.graph.instance(id).clone();
        let job = PrepareJob {
            tuple: self.graph.tuples()[instance.family].clone(),
            bindings: self.graph.bindings(id).clone(),
            upstream: upstream
                .into_iter()
                .map(|u| (u, self.records[u.0].outputs.clone()))
                .collect(),
            dataset: Arc::clone(&self.datasets[instance.family]),
            work_dir: self.options.work_dir.clone(),
            hash_mode: self.options.hash_mode,
            hash_slots: Arc::clone(&self.hash_slots),
            instance,
        };
        tracing::debug!("🔍 Preparing {}", self.records[id.0].key);

        let tx = self.tx.clone();
        let handle = self.tasks.spawn(async move {
            let result = job.run().await;
            let _ = tx.send(Report::Prepared { id, result });
        });
        self.task_ids.insert(handle.id(), (id, Phase::Prepare));
        self.preparing.insert(id);
    }

    fn spawn_execute(&mut self, id: InstanceId) {
        let Some(prepared) = self.prepared.get(&id) else {
            return;
        };
        let command = prepared.command.clone();
        let outputs = prepared.outputs.clone();
        let key = self.records[id.0].key.clone();
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        self.records[id.0].state = NodeState::Ready;

        let handle = match self.backend.clone() {
            Backend::Local(executor) => {
                let slots = Arc::clone(&self.local_slots);
                self.tasks.spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = slots.acquire_owned() => permit.ok(),
                    };
                    let result = match permit {
                        None => Err(ExecutionError::Cancelled),
                        Some(_permit) => {
                            let _ = tx.send(Report::Started { id });
                            match executor.execute(&key, &command, &cancel).await {
                                Ok(()) => invocation::verify_outputs(&outputs).await,
                                Err(e) => Err(e),
                            }
                        }
                    };
                    let _ = tx.send(Report::Finished { id, result });
                })
            }
            Backend::Remote {
                queue,
                default_queue,
                poll,
            } => {
                let job = RemoteJob {
                    name: key,
                    command,
                    resources: self.graph.instance(id).template.resources.clone(),
                    queue: default_queue,
                };
                self.tasks.spawn(async move {
                    let result = async {
                        if cancel.is_cancelled() {
                            return Err(ExecutionError::Cancelled);
                        }
                        let handle = queue.submit(&job).await?;
                        tracing::info!("📤 Submitted {} as job {}", job.name, handle);
                        let _ = tx.send(Report::Submitted {
                            id,
                            handle: handle.clone(),
                        });
                        wait_for_job(queue.as_ref(), &handle, poll, &cancel).await?;
                        invocation::verify_outputs(&outputs).await
                    }
                    .await;
                    let _ = tx.send(Report::Finished { id, result });
                })
            }
        };
        self.task_ids.insert(handle.id(), (id, Phase::Execute));
    }

    async fn handle(&mut self, report: Report) {
        match report {
            Report::Prepared { id, result } => {
                self.preparing.remove(&id);
                if self.records[id.0].state.is_terminal() {
                    return;
                }
                match result {
                    Ok(prepared) => self.on_prepared(id, prepared).await,
                    Err(error) => self.fail(id, &error),
                }
            }
            Report::Started { id } => {
                if !self.records[id.0].state.is_terminal() {
                    self.records[id.0].start(NodeState::Running);
                    self.counts.local_runs += 1;
                }
            }
            Report::Submitted { id, handle } => {
                self.counts.remote_submissions += 1;
                let record = &mut self.records[id.0];
                if !record.state.is_terminal() {
                    record.start(NodeState::Submitted);
                    record.handle = Some(handle);
                }
            }
            Report::Finished { id, result } => self.on_finished(id, result).await,
        }
    }

    /// Dedup against in-flight work, then consult the cache, then execute
    async fn on_prepared(&mut self, id: InstanceId, prepared: Prepared) {
        let fingerprint = prepared.fingerprint.clone();
        self.records[id.0].fingerprint = Some(fingerprint.clone());

        if let Some(&leader) = self.inflight.get(&fingerprint) {
            tracing::info!(
                "⏸️ {} waits for identical work in {}",
                self.records[id.0].key,
                self.records[leader.0].key
            );
            self.prepared.insert(id, prepared);
            self.waiters.entry(fingerprint).or_default().push_back(id);
            return;
        }

        if let Some(entry) = self.lookup_cache(&fingerprint).await {
            let record = &mut self.records[id.0];
            record.outputs = entry.outputs;
            record.finish(NodeState::Skipped);
            self.counts.cache_hits += 1;
            tracing::info!("♻️ {} skipped: cached by run {}", record.key, entry.run_id);
            return;
        }

        self.inflight.insert(fingerprint, id);
        self.prepared.insert(id, prepared);
        self.spawn_execute(id);
    }

    /// A hit whose outputs vanished is a miss
    async fn lookup_cache(&self, fingerprint: &str) -> Option<CacheEntry> {
        let cache = self.cache.as_ref()?;
        match cache.lookup(fingerprint).await {
            Ok(Some(entry)) if entry.is_valid().await => Some(entry),
            Ok(Some(_)) => {
                tracing::info!("🧹 Cache entry {} is stale (outputs missing), re-executing", short(fingerprint));
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("⚠️ Cache lookup failed, treating as miss: {}", e);
                None
            }
        }
    }

    async fn on_finished(&mut self, id: InstanceId, result: Result<(), ExecutionError>) {
        let Some(prepared) = self.prepared.remove(&id) else {
            return;
        };
        if self.records[id.0].state.is_terminal() {
            self.release(&prepared.fingerprint);
            return;
        }

        match result {
            Ok(()) => {
                let record = &mut self.records[id.0];
                record.outputs = prepared.outputs.clone();
                record.finish(NodeState::Succeeded);
                tracing::info!("✅ {} succeeded", record.key);

                if let Some(cache) = &self.cache {
                    let entry = CacheEntry {
                        fingerprint: prepared.fingerprint.clone(),
                        template: record.template.clone(),
                        outputs: prepared.outputs.clone(),
                        run_id: self.options.run_id.clone(),
                        created_at: Utc::now(),
                    };
                    if let Err(e) = cache.insert(&entry).await {
                        tracing::warn!("⚠️ Failed to record cache entry for {}: {}", record.key, e);
                    }
                }

                self.inflight.remove(&prepared.fingerprint);
                let waiters = self.waiters.remove(&prepared.fingerprint).unwrap_or_default();
                let leader_key = self.records[id.0].key.clone();
                for waiter in waiters {
                    let Some(parked) = self.prepared.remove(&waiter) else {
                        continue;
                    };
                    let record = &mut self.records[waiter.0];
                    if record.state.is_terminal() {
                        continue;
                    }
                    record.outputs = parked.outputs;
                    record.finish(NodeState::Skipped);
                    self.counts.cache_hits += 1;
                    tracing::info!("♻️ {} reuses the outputs of {}", record.key, leader_key);
                }
            }
            Err(ExecutionError::Cancelled) => {
                self.records[id.0].finish(NodeState::Cancelled);
                self.release(&prepared.fingerprint);
            }
            Err(error) => {
                self.fail(id, &error);
                self.release(&prepared.fingerprint);
            }
        }
    }

    /// Hand an in-flight fingerprint to the next live waiter, if any
    fn release(&mut self, fingerprint: &str) {
        self.inflight.remove(fingerprint);
        let Some(queue) = self.waiters.get_mut(fingerprint) else {
            return;
        };
        let mut next = None;
        while let Some(waiter) = queue.pop_front() {
            if !self.records[waiter.0].state.is_terminal() {
                next = Some(waiter);
                break;
            }
            self.prepared.remove(&waiter);
        }
        if queue.is_empty() {
            self.waiters.remove(fingerprint);
        }
        if let Some(leader) = next {
            tracing::info!("🔁 {} takes over execution after its leader failed", self.records[leader.0].key);
            self.inflight.insert(fingerprint.to_string(), leader);
            self.spawn_execute(leader);
        }
    }

    /// Record a failure and fail what can no longer run
    ///
    /// Execution errors fail the instance's descendants. A resolution error
    /// fails every not-yet-started instance of the family.
    fn fail(&mut self, id: InstanceId, error: &ExecutionError) {
        let key = self.records[id.0].key.clone();
        tracing::error!("❌ {} failed: {}", key, error);
        self.records[id.0].fail(error);

        let affected: Vec<InstanceId> = match error {
            ExecutionError::Resolution(_) => self
                .graph
                .family_members(self.graph.instance(id).family)
                .into_iter()
                .filter(|m| self.records[m.0].state == NodeState::Pending)
                .collect(),
            _ => self.graph.descendants(id),
        };
        for other in affected {
            let record = &mut self.records[other.0];
            if other != id && !record.state.is_terminal() {
                record.fail_propagated(&key);
                tracing::warn!("⛔ {} will not run: upstream {} failed", record.key, key);
            }
        }
    }

    /// Collect a finished task; a panic fails the node it was working on
    async fn reap(&mut self, joined: Result<(TaskId, ()), JoinError>) {
        match joined {
            Ok((task, ())) => {
                self.task_ids.remove(&task);
            }
            Err(e) => {
                let Some((id, phase)) = self.task_ids.remove(&e.id()) else {
                    return;
                };
                let error = if e.is_panic() {
                    ExecutionError::WorkerPanicked(format!("{} task of {}", phase_name(phase), self.records[id.0].key))
                } else {
                    ExecutionError::Cancelled
                };
                let report = match phase {
                    Phase::Prepare => Report::Prepared { id, result: Err(error) },
                    Phase::Execute => Report::Finished { id, result: Err(error) },
                };
                self.handle(report).await;
            }
        }
    }

    /// Stop dispatching; everything not yet running becomes Cancelled
    fn cancel_pending(&mut self) {
        self.cancelled = true;
        let mut count = 0;
        for record in &mut self.records {
            if matches!(record.state, NodeState::Pending | NodeState::Ready) {
                record.finish(NodeState::Cancelled);
                count += 1;
            }
        }
        tracing::warn!("🛑 Run cancelled: {} queued instance(s) cancelled, waiting for running ones", count);
    }

    /// Nothing in flight yet instances remain; fail them rather than hang
    fn stall(&mut self) {
        for record in &mut self.records {
            if !record.state.is_terminal() {
                tracing::error!("❌ {} can never become ready", record.key);
                record.fail(&ExecutionError::Io("no runnable path to this instance".to_string()));
            }
        }
    }

    fn publish(&self, finished: bool) {
        let families = self.families();
        self.board.publish(snapshot_of(
            &self.options.run_id,
            &self.records,
            families,
            self.counts,
            finished,
        ));
    }

    /// Current per-family summaries
    pub fn families(&self) -> Vec<FamilyStatus> {
        summarize_families(self.graph, &self.records, &self.options.best_effort)
    }
}

/// Per-family summaries of a record table
pub fn summarize_families(
    graph: &PipelineGraph,
    records: &[ExecutionRecord],
    best_effort: &[bool],
) -> Vec<FamilyStatus> {
    graph
        .tuples()
        .iter()
        .enumerate()
        .map(|(family, tuple)| {
            family_status(
                tuple.to_string(),
                best_effort.get(family).copied().unwrap_or(false),
                records.iter().filter(|r| r.family == family),
            )
        })
        .collect()
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Prepare => "prepare",
        Phase::Execute => "execute",
    }
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}
