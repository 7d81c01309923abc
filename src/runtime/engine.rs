//! Pipeline run engine
//!
//! Turns a pipeline template into a run: expansion into per-tuple instances,
//! validation of the whole graph, dataset discovery, scheduling against the
//! cache and the configured backend, and finally the output sink.

use crate::cache::{CacheStore, HashMode};
use crate::config::{ExecutionMode, RunConfig};
use crate::dataset::DatasetSource;
use crate::error::{EngineError, ValidationErrors};
use crate::runtime::executor::LocalExecutor;
use crate::runtime::graph::PipelineGraph;
use crate::runtime::queue::{CommandQueue, PollPolicy, RemoteQueue};
use crate::runtime::scheduler::{summarize_families, Backend, Scheduler, SchedulerOptions};
use crate::runtime::status::{run_outcome, RunOutcome, RunReport, StatusBoard};
use crate::sink::collect_results;
use crate::workflow::surface::SUBJECT_AXIS;
use crate::workflow::PipelineTemplate;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Runs pipelines under one configuration
pub struct ExecutionEngine {
    config: RunConfig,
    /// Replaces the command-line queue in remote mode
    queue: Option<Arc<dyn RemoteQueue>>,
    board: Arc<StatusBoard>,
}

impl ExecutionEngine {
    /// Create an engine running local tools or the configured queue
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            queue: None,
            board: StatusBoard::new(),
        }
    }

    /// Submit remote jobs through this queue instead of the configured commands
    pub fn with_queue(mut self, queue: Arc<dyn RemoteQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Active configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Live progress of the current run
    pub fn status_board(&self) -> Arc<StatusBoard> {
        self.board.clone()
    }

    /// Expand and validate without touching the filesystem
    pub fn validate(&self, pipeline: &PipelineTemplate) -> Result<PipelineGraph, ValidationErrors> {
        tracing::debug!("🔍 Validating pipeline '{}'", pipeline.name);
        let graph = PipelineGraph::from_template(pipeline)?;
        tracing::debug!(
            "✅ Pipeline '{}' is valid: {} instances in {} tuple families",
            pipeline.name,
            graph.instances().len(),
            graph.tuples().len()
        );
        Ok(graph)
    }

    /// Execute a pipeline to completion or cancellation
    ///
    /// Validation happens before anything is written; a rejected pipeline
    /// leaves no trace on disk. Node and result-copy failures never make
    /// this return an error, they are reported per tuple family in the
    /// [`RunReport`].
    pub async fn run(
        &self,
        pipeline: &PipelineTemplate,
        dataset: &dyn DatasetSource,
        cancel: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let run_start = std::time::Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();

        tracing::info!("🚀 Starting run {} of pipeline '{}'", run_id, pipeline.name);

        let graph = self.validate(pipeline).inspect_err(|errors| {
            tracing::error!("❌ Pipeline '{}' rejected with {} violation(s)", pipeline.name, errors.len());
        })?;

        let datasets = self.discover(&graph, dataset)?;
        let best_effort = self.best_effort(&graph);

        let cache = if self.config.use_cache {
            let path = self.config.cache_db_path();
            tracing::debug!("🗄️ Opening cache store at {}", path.display());
            Some(CacheStore::open(&path).await?)
        } else {
            tracing::info!("🚫 Cache disabled for this run");
            None
        };
        // Metadata only unless fingerprints are persisted
        let hash_mode = HashMode::from_flag(self.config.enable_content_hash_cache && self.config.use_cache);

        let options = SchedulerOptions {
            run_id: run_id.clone(),
            work_dir: self.config.work_dir.clone(),
            local_workers: self.config.local_workers(),
            hash_mode,
            best_effort: best_effort.clone(),
        };
        let scheduled = Scheduler::new(
            &graph,
            options,
            self.backend(),
            cache,
            datasets,
            self.board.clone(),
            cancel,
        )
        .run()
        .await;

        let sunk = collect_results(graph.expanded(), &scheduled.records, &self.config.results_dir).await;
        let mut families = summarize_families(&graph, &scheduled.records, &best_effort);
        for failure in sunk.failures {
            families[failure.family].fail_late(failure.node, failure.error.to_string());
        }
        let outcome = run_outcome(&families, scheduled.cancelled);

        let duration = run_start.elapsed();
        match outcome {
            RunOutcome::Succeeded => tracing::info!(
                "🎉 Run {} of '{}' succeeded in {:?} ({} local, {} remote, {} cached)",
                run_id,
                pipeline.name,
                duration,
                scheduled.counts.local_runs,
                scheduled.counts.remote_submissions,
                scheduled.counts.cache_hits
            ),
            other => tracing::warn!("⚠️ Run {} of '{}' finished as {} in {:?}", run_id, pipeline.name, other, duration),
        }

        Ok(RunReport {
            run_id,
            pipeline: pipeline.name.clone(),
            outcome,
            families,
            counts: scheduled.counts,
            records: scheduled.records,
            results: sunk.written,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn discover(
        &self,
        graph: &PipelineGraph,
        dataset: &dyn DatasetSource,
    ) -> Result<Vec<Arc<Vec<PathBuf>>>, EngineError> {
        graph
            .tuples()
            .iter()
            .map(|tuple| {
                dataset.files(tuple).map(Arc::new).map_err(|e| EngineError::Dataset {
                    tuple: tuple.to_string(),
                    message: format!("{:#}", e),
                })
            })
            .collect()
    }

    fn best_effort(&self, graph: &PipelineGraph) -> Vec<bool> {
        graph
            .tuples()
            .iter()
            .map(|tuple| {
                tuple
                    .get(SUBJECT_AXIS)
                    .is_some_and(|subject| self.config.best_effort_subjects.iter().any(|s| s == subject))
            })
            .collect()
    }

    fn backend(&self) -> Backend {
        match self.config.execution_mode {
            ExecutionMode::Local => Backend::Local(LocalExecutor::new()),
            ExecutionMode::RemoteQueue => {
                let queue: Arc<dyn RemoteQueue> = match &self.queue {
                    Some(queue) => queue.clone(),
                    None => Arc::new(CommandQueue::new(self.config.queue.clone())),
                };
                Backend::Remote {
                    queue,
                    default_queue: self.config.queue_name.clone(),
                    poll: PollPolicy {
                        interval: self.config.poll_interval(),
                        lost_retries: self.config.lost_poll_retries,
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::StaticDataset;
    use crate::error::ConfigError;
    use crate::runtime::status::FamilyState;
    use crate::workflow::{NodeTemplate, PipelineBuilder, SlotKind};

    fn config_in(dir: &std::path::Path) -> RunConfig {
        RunConfig {
            work_dir: dir.join("work"),
            results_dir: dir.join("results"),
            subjects_dir: dir.join("subjects"),
            max_concurrent_local_workers: 2,
            ..RunConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rejected_pipeline_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutionEngine::new(config_in(dir.path()));
        let pipeline = PipelineBuilder::new("loop")
            .axis("subject_id", ["s1"])
            .node(NodeTemplate::new("a", "true").input("x", SlotKind::File).output("y", "y"))
            .node(NodeTemplate::new("b", "true").input("x", SlotKind::File).output("y", "y"))
            .connect(("a", "y"), ("b", "x"))
            .connect(("b", "y"), ("a", "x"))
            .build();

        let err = engine
            .run(&pipeline, &StaticDataset::new(), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            EngineError::Validation(errors) => {
                assert!(errors.contains(|e| matches!(e, ConfigError::Cycle { .. })))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dir.path().join("work").exists());
        assert!(!dir.path().join("results").exists());
    }

    #[tokio::test]
    async fn test_best_effort_family_does_not_fail_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.use_cache = false;
        config.best_effort_subjects = vec!["s2".to_string()];
        let engine = ExecutionEngine::new(config);

        let pipeline = PipelineBuilder::new("flaky")
            .axis("subject_id", ["s1", "s2"])
            .node(
                NodeTemplate::new("step", "sh")
                    .args(["-c", "test {subject_id} = s1 && echo ok > {out}"])
                    .output("out", "out.txt"),
            )
            .sink("result", ("step", "out"))
            .build();

        let report = engine
            .run(&pipeline, &StaticDataset::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert!(report.family("s2").is_some_and(|f| f.best_effort));
        assert_eq!(report.results, vec![dir.path().join("results/s1/result")]);
        assert_eq!(engine.status_board().snapshot().total, 2);
    }

    #[tokio::test]
    async fn test_unwritable_result_fails_only_its_family() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.use_cache = false;
        std::fs::create_dir_all(dir.path().join("results")).unwrap();
        std::fs::write(dir.path().join("results/s2"), b"not a directory").unwrap();
        let engine = ExecutionEngine::new(config);

        let pipeline = PipelineBuilder::new("sinks")
            .axis("subject_id", ["s1", "s2", "s3"])
            .node(
                NodeTemplate::new("step", "sh")
                    .args(["-c", "echo {subject_id} > {out}"])
                    .output("out", "out.txt"),
            )
            .sink("result", ("step", "out"))
            .build();

        let report = engine
            .run(&pipeline, &StaticDataset::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::PartialSuccess);
        assert_eq!(report.counts.local_runs, 3);
        assert_eq!(
            report.results,
            vec![dir.path().join("results/s1/result"), dir.path().join("results/s3/result")]
        );

        let s2 = report.family("s2").unwrap();
        assert_eq!(s2.state, FamilyState::Failed);
        let first = s2.first_failure.as_ref().unwrap();
        assert_eq!(first.node, "step[s2]");
        assert!(first.cause.contains("cannot write result"), "cause: {}", first.cause);
        assert_eq!(report.family("s3").unwrap().state, FamilyState::Succeeded);
    }
}
