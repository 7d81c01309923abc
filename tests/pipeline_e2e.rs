//! End-to-end runs with small shell scripts standing in for the imaging tools

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reconflow::config::{ExecutionMode, QueueCommands, RunConfig};
use reconflow::dataset::StaticDataset;
use reconflow::error::ExecutionError;
use reconflow::runtime::queue::{RemoteJob, RemoteQueue, RemoteStatus, SubmissionHandle};
use reconflow::runtime::status::{FamilyState, Failure, NodeState, RunOutcome, RunReport};
use reconflow::runtime::ExecutionEngine;
use reconflow::workflow::{NodeTemplate, PipelineBuilder, PipelineTemplate, SlotKind, SlotSource, Transform};
use reconflow::workflow::Predicate;
use tokio_util::sync::CancellationToken;

struct Fixture {
    root: tempfile::TempDir,
    dataset: StaticDataset,
}

impl Fixture {
    /// One T1 image per subject under `<root>/data/<subject>/`
    fn new(subjects: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut dataset = StaticDataset::new();
        for subject in subjects {
            let dir = root.path().join("data").join(subject);
            std::fs::create_dir_all(&dir).unwrap();
            let t1 = dir.join(format!("{}_T1w.nii.gz", subject));
            std::fs::write(&t1, format!("t1 of {}", subject)).unwrap();
            dataset = dataset.with_subject(*subject, [t1]);
        }
        Self { root, dataset }
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn config(&self) -> RunConfig {
        RunConfig {
            work_dir: self.path().join("work"),
            results_dir: self.path().join("results"),
            subjects_dir: self.path().join("data"),
            max_concurrent_local_workers: 4,
            poll_interval_ms: 10,
            lost_poll_retries: 2,
            ..RunConfig::default()
        }
    }

    async fn run(&self, engine: &ExecutionEngine, pipeline: &PipelineTemplate) -> RunReport {
        engine
            .run(pipeline, &self.dataset, CancellationToken::new())
            .await
            .unwrap()
    }

    fn results(&self, subject: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.path().join("results").join(subject))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// reconstruct -> combine; `recon` exits non-zero for `fail_on` or a T1 reading "broken"
fn recon_combine(subjects: &[&str], fail_on: &str) -> PipelineTemplate {
    let recon = NodeTemplate::new("recon", "sh")
        .args([
            "-c",
            "test \"$1\" != \"$2\" && ! grep -q broken \"$3\" && cp \"$3\" \"$4\" && echo \"$1 rh\" > \"$5\"",
            "sh",
            "{subject_id}",
            "{fail_on}",
            "{t1}",
            "{pial}",
        ])
        .source_input(
            "t1",
            SlotKind::File,
            SlotSource::Dataset {
                transform: Transform::select(Predicate::Suffix(".nii.gz".to_string())),
            },
        )
        .param("fail_on", fail_on)
        .output_list("pial", ["lh.pial", "rh.pial"]);

    let combine = NodeTemplate::new("combine", "sh")
        .args(["-c", "out=\"$1\"; shift; cat \"$@\" > \"$out\"", "sh", "{mesh}", "{in_files}"])
        .input("in_files", SlotKind::FileList)
        .output("mesh", "bh.stl");

    PipelineBuilder::new("recon-combine")
        .axis("subject_id", subjects.iter().copied())
        .node(recon)
        .node(combine)
        .connect(("recon", "pial"), ("combine", "in_files"))
        .sink("pial", ("recon", "pial"))
        .sink("full_mesh", ("combine", "mesh"))
        .build()
}

fn state(report: &RunReport, key: &str) -> NodeState {
    report.record(key).unwrap().state
}

#[tokio::test]
async fn test_two_subjects_run_every_node_once() {
    let fixture = Fixture::new(&["s1", "s2"]);
    let mut config = fixture.config();
    config.use_cache = false;
    let engine = ExecutionEngine::new(config);

    let report = fixture.run(&engine, &recon_combine(&["s1", "s2"], "none")).await;

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.counts.local_runs, 4);
    assert_eq!(report.counts.cache_hits, 0);
    assert_eq!(fixture.results("s1"), vec!["full_mesh", "pial"]);
    assert_eq!(fixture.results("s2"), vec!["full_mesh", "pial"]);

    let mesh = std::fs::read_to_string(fixture.path().join("results/s2/full_mesh")).unwrap();
    assert_eq!(mesh, "t1 of s2s2 rh\n");
    assert!(fixture.path().join("work/s1/recon/stdout.log").exists());
    assert!(!fixture.path().join("work/cache.db").exists());
}

#[tokio::test]
async fn test_failing_subject_does_not_affect_others() {
    let fixture = Fixture::new(&["s1", "s2"]);
    let mut config = fixture.config();
    config.use_cache = false;
    let engine = ExecutionEngine::new(config);

    let report = fixture.run(&engine, &recon_combine(&["s1", "s2"], "s2")).await;

    assert_eq!(report.outcome, RunOutcome::PartialSuccess);
    assert_eq!(report.counts.local_runs, 3);
    assert_eq!(state(&report, "combine[s1]"), NodeState::Succeeded);
    assert_eq!(state(&report, "recon[s2]"), NodeState::Failed);

    let combine = report.record("combine[s2]").unwrap();
    assert_eq!(combine.state, NodeState::Failed);
    assert!(combine.started_at.is_none());
    assert!(matches!(&combine.failure, Some(Failure::Propagated { from }) if from == "recon[s2]"));

    let s2 = report.family("s2").unwrap();
    assert_eq!(s2.state, FamilyState::Failed);
    let first = s2.first_failure.as_ref().unwrap();
    assert_eq!(first.node, "recon[s2]");
    assert!(first.cause.contains("exited with status 1"), "cause: {}", first.cause);
    assert_eq!(report.family("s1").unwrap().state, FamilyState::Succeeded);

    assert_eq!(fixture.results("s1"), vec!["full_mesh", "pial"]);
    assert!(!fixture.path().join("results/s2").exists());
}

#[tokio::test]
async fn test_unchanged_rerun_invokes_nothing() {
    let fixture = Fixture::new(&["s1", "s2"]);
    let engine = ExecutionEngine::new(fixture.config());
    let pipeline = recon_combine(&["s1", "s2"], "none");

    let first = fixture.run(&engine, &pipeline).await;
    assert_eq!(first.counts.local_runs, 4);

    let second = fixture.run(&engine, &pipeline).await;
    assert_eq!(second.outcome, RunOutcome::Succeeded);
    assert_eq!(second.counts.external(), 0);
    assert_eq!(second.counts.cache_hits, 4);
    assert!(second.records.iter().all(|r| r.state == NodeState::Skipped));
    assert_eq!(fixture.results("s1"), vec!["full_mesh", "pial"]);
}

#[tokio::test]
async fn test_rerun_after_fix_only_runs_failed_subject() {
    let fixture = Fixture::new(&["s1", "s2"]);
    let engine = ExecutionEngine::new(fixture.config());
    let pipeline = recon_combine(&["s1", "s2"], "none");
    let t1 = fixture.path().join("data/s2/s2_T1w.nii.gz");

    std::fs::write(&t1, "broken").unwrap();
    let broken = fixture.run(&engine, &pipeline).await;
    assert_eq!(broken.outcome, RunOutcome::PartialSuccess);
    assert_eq!(broken.family("s2").unwrap().first_failure.as_ref().unwrap().node, "recon[s2]");

    std::fs::write(&t1, "t1 of s2").unwrap();
    let report = fixture.run(&engine, &pipeline).await;

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.counts.local_runs, 2);
    assert_eq!(report.counts.cache_hits, 2);
    assert_eq!(state(&report, "recon[s1]"), NodeState::Skipped);
    assert_eq!(fixture.results("s2"), vec!["full_mesh", "pial"]);
}

#[tokio::test]
async fn test_deleted_output_reruns_only_its_node() {
    let fixture = Fixture::new(&["s1", "s2"]);
    let engine = ExecutionEngine::new(fixture.config());
    let pipeline = recon_combine(&["s1", "s2"], "none");

    let first = fixture.run(&engine, &pipeline).await;
    assert_eq!(first.counts.local_runs, 4);

    let lh = fixture.path().join("work/s1/recon/lh.pial");
    std::fs::remove_file(&lh).unwrap();
    let report = fixture.run(&engine, &pipeline).await;

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.counts.local_runs, 1);
    assert_eq!(report.counts.cache_hits, 3);
    assert_eq!(state(&report, "recon[s1]"), NodeState::Succeeded);
    // regenerated with identical content, so the combined mesh is still current
    assert_eq!(state(&report, "combine[s1]"), NodeState::Skipped);
    assert_eq!(state(&report, "recon[s2]"), NodeState::Skipped);
    assert_eq!(std::fs::read_to_string(&lh).unwrap(), "t1 of s1");
}

#[tokio::test]
async fn test_missing_hemisphere_fails_only_that_subject() {
    let root = tempfile::tempdir().unwrap();
    let mut dataset = StaticDataset::new();
    for (subject, hemis) in [("s1", &["lh", "rh"][..]), ("s2", &["rh"][..])] {
        let dir = root.path().join("surf").join(subject);
        std::fs::create_dir_all(&dir).unwrap();
        let files: Vec<PathBuf> = hemis
            .iter()
            .map(|h| {
                let path = dir.join(format!("{}.pial", h));
                std::fs::write(&path, format!("{} {}", subject, h)).unwrap();
                path
            })
            .collect();
        dataset = dataset.with_subject(subject, files);
    }

    let convert = |name: &str, transform: Transform, mesh: &str| {
        NodeTemplate::new(name, "cp")
            .args(["{surface}", "{mesh}"])
            .source_input("surface", SlotKind::File, SlotSource::Dataset { transform })
            .output("mesh", mesh)
    };
    let pipeline = PipelineBuilder::new("hemispheres")
        .axis("subject_id", ["s1", "s2"])
        .node(convert("lh_convert", Transform::left_hemisphere(), "lh.stl"))
        .node(convert("rh_convert", Transform::right_hemisphere(), "rh.stl"))
        .node(
            NodeTemplate::new("combine", "sh")
                .args(["-c", "out=\"$1\"; shift; cat \"$@\" > \"$out\"", "sh", "{mesh}", "{in_files}"])
                .input("in_files", SlotKind::FileList)
                .output("mesh", "bh.stl"),
        )
        .pack([("rh_convert", "mesh"), ("lh_convert", "mesh")], ("combine", "in_files"))
        .sink("full_mesh", ("combine", "mesh"))
        .build();

    let config = RunConfig {
        work_dir: root.path().join("work"),
        results_dir: root.path().join("results"),
        use_cache: false,
        ..RunConfig::default()
    };
    let engine = ExecutionEngine::new(config);
    let report = engine.run(&pipeline, &dataset, CancellationToken::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::PartialSuccess);
    assert_eq!(report.family("s1").unwrap().state, FamilyState::Succeeded);
    let combined = std::fs::read_to_string(root.path().join("results/s1/full_mesh")).unwrap();
    assert_eq!(combined, "s1 rhs1 lh");

    let s2 = report.family("s2").unwrap();
    assert_eq!(s2.state, FamilyState::Failed);
    let first = s2.first_failure.as_ref().unwrap();
    assert_eq!(first.node, "lh_convert[s2]");
    assert!(first.cause.contains("no match"), "cause: {}", first.cause);
    assert_eq!(state(&report, "combine[s2]"), NodeState::Failed);
    assert!(state(&report, "rh_convert[s2]").is_terminal());
}

/// Runs each job inline at submission and reports the result on poll
#[derive(Default)]
struct InlineQueue {
    lose_jobs: bool,
    jobs: Mutex<HashMap<String, RemoteStatus>>,
    names: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteQueue for InlineQueue {
    async fn submit(&self, job: &RemoteJob) -> Result<SubmissionHandle, ExecutionError> {
        tokio::fs::create_dir_all(&job.command.cwd).await?;
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(job.script())
            .current_dir(&job.command.cwd)
            .status()
            .await?;
        let state = if self.lose_jobs {
            RemoteStatus::Lost
        } else if status.success() {
            RemoteStatus::Succeeded
        } else {
            RemoteStatus::Failed("FAILED".to_string())
        };

        self.names.lock().unwrap().push(job.name.clone());
        let mut jobs = self.jobs.lock().unwrap();
        let handle = SubmissionHandle(format!("job-{}", jobs.len() + 1));
        jobs.insert(handle.0.clone(), state);
        Ok(handle)
    }

    async fn poll(&self, handle: &SubmissionHandle) -> Result<RemoteStatus, ExecutionError> {
        Ok(self.jobs.lock().unwrap().get(&handle.0).cloned().unwrap_or(RemoteStatus::Lost))
    }

    async fn cancel(&self, _handle: &SubmissionHandle) -> Result<(), ExecutionError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_remote_queue_runs_every_node() {
    let fixture = Fixture::new(&["s1", "s2"]);
    let mut config = fixture.config();
    config.execution_mode = ExecutionMode::RemoteQueue;
    config.use_cache = false;
    let queue = Arc::new(InlineQueue::default());
    let engine = ExecutionEngine::new(config).with_queue(queue.clone());

    let report = fixture.run(&engine, &recon_combine(&["s1", "s2"], "s2")).await;

    assert_eq!(report.counts.remote_submissions, 3);
    assert_eq!(report.counts.local_runs, 0);
    assert_eq!(state(&report, "combine[s1]"), NodeState::Succeeded);
    assert!(report.record("combine[s1]").unwrap().handle.is_some());
    assert_eq!(state(&report, "combine[s2]"), NodeState::Failed);
    assert!(!queue.names.lock().unwrap().contains(&"combine[s2]".to_string()));
    assert_eq!(fixture.results("s1"), vec!["full_mesh", "pial"]);
}

#[tokio::test]
async fn test_lost_remote_job_fails_after_retries() {
    let fixture = Fixture::new(&["s1"]);
    let mut config = fixture.config();
    config.execution_mode = ExecutionMode::RemoteQueue;
    config.use_cache = false;
    let queue = Arc::new(InlineQueue {
        lose_jobs: true,
        ..InlineQueue::default()
    });
    let engine = ExecutionEngine::new(config).with_queue(queue);

    let report = fixture.run(&engine, &recon_combine(&["s1"], "none")).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    let recon = report.record("recon[s1]").unwrap();
    assert_eq!(recon.state, NodeState::Failed);
    let cause = recon.failure.as_ref().unwrap().to_string();
    assert!(cause.contains("vanished from the queue after 2 polls"), "cause: {}", cause);
    assert!(report.record("combine[s1]").unwrap().is_propagated_failure());
}

#[tokio::test]
async fn test_command_queue_drives_shell_scheduler() {
    let fixture = Fixture::new(&["s1"]);
    let mut config = fixture.config();
    config.execution_mode = ExecutionMode::RemoteQueue;
    config.use_cache = false;
    config.queue = QueueCommands {
        submit: vec![
            "sh".into(),
            "-c".into(),
            "cd \"$1\" && sh -c \"$2\"; echo \"$$;local\"".into(),
            "sh".into(),
            "{cwd}".into(),
            "{command}".into(),
        ],
        status: vec!["echo".into(), "COMPLETED".into()],
        status_fallback: Vec::new(),
        cancel: vec!["true".into()],
    };
    let engine = ExecutionEngine::new(config);

    let report = fixture.run(&engine, &recon_combine(&["s1"], "none")).await;

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.counts.remote_submissions, 2);
    assert!(report.records.iter().all(|r| r.handle.is_some()));
    assert_eq!(fixture.results("s1"), vec!["full_mesh", "pial"]);
}
