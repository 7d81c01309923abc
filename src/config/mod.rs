//! Run configuration
//!
//! Loaded from an optional TOML file, then overridden by `RECONFLOW_*`
//! environment variables for container and cluster deployments. Every field
//! has a default so an empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where ready nodes are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Child processes on this machine, bounded by the local worker limit
    #[default]
    Local,
    /// Jobs submitted to a batch queue and polled until they finish
    RemoteQueue,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ExecutionMode::Local),
            "remote-queue" | "remote" => Ok(ExecutionMode::RemoteQueue),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

/// Main run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// FreeSurfer SUBJECTS_DIR the reconstruction writes into
    pub subjects_dir: PathBuf,
    /// Root holding raw per-subject images; falls back to `subjects_dir`
    pub dataset_dir: Option<PathBuf>,
    /// Final outputs land in `<results_dir>/<subject_id>/<logical_name>`
    pub results_dir: PathBuf,
    /// Per-node working directories and the cache database live here
    pub work_dir: PathBuf,
    /// Values of the `subject_id` axis
    pub subject_ids: Vec<String>,
    pub execution_mode: ExecutionMode,
    /// Default queue for remote submissions
    pub queue_name: Option<String>,
    pub max_concurrent_local_workers: usize,
    /// Hash input file contents; otherwise path, size and mtime are used
    pub enable_content_hash_cache: bool,
    /// Disable to neither read nor write cache entries
    pub use_cache: bool,
    /// Defaults to `<work_dir>/cache.db`
    pub cache_db: Option<PathBuf>,
    /// Subjects whose failure does not fail the run
    pub best_effort_subjects: Vec<String>,
    /// Interval between remote status polls
    pub poll_interval_ms: u64,
    /// Consecutive "job unknown" polls before a remote job counts as lost
    pub lost_poll_retries: u32,
    pub queue: QueueCommands,
    pub surface: SurfaceConfig,
}

/// Command templates for a command-line batch queue (SLURM defaults)
///
/// Placeholders: `{queue}`, `{cpus}`, `{memory}`, `{walltime}`, `{name}`,
/// `{cwd}`, `{command}` for submission and `{handle}` for the others.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueCommands {
    pub submit: Vec<String>,
    pub status: Vec<String>,
    /// Consulted when `status` prints nothing (finished jobs leave squeue)
    pub status_fallback: Vec<String>,
    pub cancel: Vec<String>,
}

impl Default for QueueCommands {
    fn default() -> Self {
        let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        Self {
            submit: owned(&[
                "sbatch",
                "--parsable",
                "--partition={queue}",
                "--cpus-per-task={cpus}",
                "--job-name={name}",
                "--chdir={cwd}",
                "--output={cwd}/slurm-%j.out",
                "--wrap={command}",
            ]),
            status: owned(&["squeue", "--noheader", "--format=%T", "--jobs={handle}"]),
            status_fallback: owned(&["sacct", "--noheader", "--parsable2", "-X", "--format=State", "--jobs={handle}"]),
            cancel: owned(&["scancel", "{handle}"]),
        }
    }
}

/// Options of the built-in surface reconstruction pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SurfaceConfig {
    /// recon-all directive, e.g. "all" or "autorecon1"
    pub directive: String,
    pub openmp: u32,
    /// Suffix identifying the T1 image among a subject's files
    pub t1_suffix: String,
    /// Extension of the converted meshes
    pub mesh_format: String,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            directive: "all".to_string(),
            openmp: 4,
            t1_suffix: ".nii.gz".to_string(),
            mesh_format: "stl".to_string(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            subjects_dir: PathBuf::from("subjects"),
            dataset_dir: None,
            results_dir: PathBuf::from("results"),
            work_dir: PathBuf::from("work"),
            subject_ids: Vec::new(),
            execution_mode: ExecutionMode::Local,
            queue_name: None,
            max_concurrent_local_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            enable_content_hash_cache: true,
            use_cache: true,
            cache_db: None,
            best_effort_subjects: Vec::new(),
            poll_interval_ms: 30_000,
            lost_poll_retries: 3,
            queue: QueueCommands::default(),
            surface: SurfaceConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load from a TOML file (if given) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("Invalid config file '{}'", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Override fields from `RECONFLOW_*` variables
    ///
    /// `lookup` is injected so tests do not touch the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("RECONFLOW_SUBJECTS_DIR") {
            self.subjects_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RECONFLOW_DATASET_DIR") {
            self.dataset_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RECONFLOW_RESULTS_DIR") {
            self.results_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RECONFLOW_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RECONFLOW_SUBJECT_IDS") {
            self.subject_ids = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("RECONFLOW_EXECUTION_MODE") {
            self.execution_mode = v.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        }
        if let Some(v) = lookup("RECONFLOW_QUEUE_NAME") {
            self.queue_name = Some(v);
        }
        if let Some(v) = lookup("RECONFLOW_MAX_WORKERS") {
            self.max_concurrent_local_workers = v
                .parse()
                .with_context(|| format!("RECONFLOW_MAX_WORKERS is not a number: {}", v))?;
        }
        if let Some(v) = lookup("RECONFLOW_CONTENT_HASH") {
            self.enable_content_hash_cache = parse_bool(&v)?;
        }
        if let Some(v) = lookup("RECONFLOW_USE_CACHE") {
            self.use_cache = parse_bool(&v)?;
        }
        Ok(())
    }

    /// Make every configured directory absolute
    ///
    /// Node commands run inside their node directory, where relative paths
    /// would resolve differently.
    pub fn absolutize(&mut self) -> std::io::Result<()> {
        self.subjects_dir = std::path::absolute(&self.subjects_dir)?;
        self.results_dir = std::path::absolute(&self.results_dir)?;
        self.work_dir = std::path::absolute(&self.work_dir)?;
        if let Some(dir) = self.dataset_dir.take() {
            self.dataset_dir = Some(std::path::absolute(dir)?);
        }
        if let Some(db) = self.cache_db.take() {
            self.cache_db = Some(std::path::absolute(db)?);
        }
        Ok(())
    }

    /// Where raw subject data is discovered
    pub fn dataset_root(&self) -> &Path {
        self.dataset_dir.as_deref().unwrap_or(&self.subjects_dir)
    }

    /// SQLite cache file inside the work directory
    pub fn cache_db_path(&self) -> PathBuf {
        self.cache_db
            .clone()
            .unwrap_or_else(|| self.work_dir.join("cache.db"))
    }

    /// Delay between remote status polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Worker limit, never below one
    pub fn local_workers(&self) -> usize {
        self.max_concurrent_local_workers.max(1)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("Not a boolean: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = RunConfig::from_toml("").unwrap();
        assert_eq!(config.execution_mode, ExecutionMode::Local);
        assert!(config.enable_content_hash_cache);
        assert_eq!(config.surface.openmp, 4);
        assert_eq!(config.surface.directive, "all");
        assert_eq!(config.cache_db_path(), PathBuf::from("work/cache.db"));
        assert_eq!(config.queue.cancel, vec!["scancel", "{handle}"]);
    }

    #[test]
    fn test_toml_fields() {
        let config = RunConfig::from_toml(
            r#"
            subjects_dir = "/data/subjects"
            results_dir = "/data/results"
            subject_ids = ["klb", "abc"]
            execution_mode = "remote-queue"
            queue_name = "long"
            max_concurrent_local_workers = 2
            enable_content_hash_cache = false

            [surface]
            openmp = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.subject_ids, vec!["klb", "abc"]);
        assert_eq!(config.execution_mode, ExecutionMode::RemoteQueue);
        assert_eq!(config.queue_name.as_deref(), Some("long"));
        assert!(!config.enable_content_hash_cache);
        assert_eq!(config.surface.openmp, 8);
        assert_eq!(config.surface.mesh_format, "stl");
        assert_eq!(config.dataset_root(), Path::new("/data/subjects"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RECONFLOW_SUBJECT_IDS", "s1, s2,,s3"),
            ("RECONFLOW_EXECUTION_MODE", "remote-queue"),
            ("RECONFLOW_CONTENT_HASH", "off"),
            ("RECONFLOW_MAX_WORKERS", "0"),
        ]);
        let mut config = RunConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.subject_ids, vec!["s1", "s2", "s3"]);
        assert_eq!(config.execution_mode, ExecutionMode::RemoteQueue);
        assert!(!config.enable_content_hash_cache);
        assert_eq!(config.local_workers(), 1);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = RunConfig::default();
        let result = config.apply_env(|k| (k == "RECONFLOW_USE_CACHE").then(|| "maybe".to_string()));
        assert!(result.is_err());
    }
}
