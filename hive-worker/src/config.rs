//! Worker configuration
//!
//! Defines all configurable parameters of the agent: master connection,
//! worker identity, local directory layout, execution backend and the
//! intervals used by the lifecycle loop.

use hive_core::domain::worker::WorkerKind;
use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration
///
/// Loaded once at start-up; the worker never mutates it afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Master base URL (e.g., "http://localhost:8000")
    pub master_url: String,

    /// Worker uuid issued by `register`
    pub worker_id: String,

    /// Passcode issued together with the worker uuid
    pub passcode: String,

    pub worker_kind: WorkerKind,

    /// Opaque resource identifier forwarded into the job environment
    pub resource_id: String,

    /// Per-worker scratch directory, wiped on every enroll and cleanup
    pub work_dir: PathBuf,

    /// Directory shared by co-located workers for downloaded datasets
    pub dataset_root: PathBuf,

    /// SQLite file holding the shared dataset registry
    pub registry_path: PathBuf,

    /// Port reported to the master on poll
    pub port: u16,

    /// Backoff between polls and failed enrolls
    pub poll_interval: Duration,

    /// Run jobs inside a container instead of directly on the host
    pub in_container: bool,

    /// Container CLI binary (podman or docker)
    pub container_runtime: String,

    pub container_image: String,

    /// Interpreter used to build the virtual environment
    pub python: String,

    /// Entry script inside the code directory that every job starts from
    pub entry_script: String,

    /// Copy artifacts into this folder instead of uploading them
    pub output_dir: Option<PathBuf>,

    pub tensorboard_port: u16,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(master_url: String, worker_id: String, passcode: String) -> Self {
        let base = std::env::temp_dir().join("hive");
        let dataset_root = base.join("datasets");
        Self {
            work_dir: base.join(if worker_id.is_empty() { "worker" } else { worker_id.as_str() }),
            registry_path: dataset_root.join("registry.db"),
            dataset_root,
            master_url,
            worker_id,
            passcode,
            worker_kind: WorkerKind::Cpu,
            resource_id: String::new(),
            port: 7000,
            poll_interval: Duration::from_secs(30),
            in_container: false,
            container_runtime: "podman".to_string(),
            container_image: "docker.io/library/python:3.11-slim".to_string(),
            python: "python3".to_string(),
            entry_script: "main.py".to_string(),
            output_dir: None,
            tensorboard_port: 6006,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - HIVE_MASTER_URL (required)
    /// - HIVE_WORKER_ID, HIVE_PASSCODE (required to run, not to register)
    /// - HIVE_WORKER_KIND (optional, cpu|gpu, default: cpu)
    /// - HIVE_RESOURCE_ID (optional)
    /// - HIVE_WORK_DIR, HIVE_DATASET_ROOT, HIVE_REGISTRY_PATH (optional paths)
    /// - HIVE_PORT (optional, default: 7000)
    /// - HIVE_POLL_INTERVAL (optional, seconds, default: 30)
    /// - HIVE_IN_CONTAINER (optional, default: false)
    /// - HIVE_CONTAINER_RUNTIME, HIVE_CONTAINER_IMAGE (optional)
    /// - HIVE_PYTHON, HIVE_ENTRY_SCRIPT (optional)
    /// - HIVE_OUTPUT_DIR (optional)
    /// - HIVE_TENSORBOARD_PORT (optional, default: 6006)
    ///
    /// A `master_url` given on the command line takes precedence over
    /// HIVE_MASTER_URL.
    pub fn from_env(master_url: Option<String>) -> anyhow::Result<Self> {
        let master_url = master_url
            .or_else(|| std::env::var("HIVE_MASTER_URL").ok())
            .ok_or_else(|| anyhow::anyhow!("HIVE_MASTER_URL environment variable not set"))?;

        let worker_id = std::env::var("HIVE_WORKER_ID").unwrap_or_default();
        let passcode = std::env::var("HIVE_PASSCODE").unwrap_or_default();

        let mut config = Self::new(master_url, worker_id, passcode);

        if let Some(kind) = env_parse::<WorkerKind>("HIVE_WORKER_KIND") {
            config.worker_kind = kind;
        }
        if let Ok(resource_id) = std::env::var("HIVE_RESOURCE_ID") {
            config.resource_id = resource_id;
        }
        if let Some(dir) = env_path("HIVE_WORK_DIR") {
            config.work_dir = dir;
        }
        if let Some(dir) = env_path("HIVE_DATASET_ROOT") {
            config.registry_path = dir.join("registry.db");
            config.dataset_root = dir;
        }
        if let Some(path) = env_path("HIVE_REGISTRY_PATH") {
            config.registry_path = path;
        }
        if let Some(port) = env_parse::<u16>("HIVE_PORT") {
            config.port = port;
        }
        if let Some(secs) = env_parse::<u64>("HIVE_POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(flag) = env_parse::<bool>("HIVE_IN_CONTAINER") {
            config.in_container = flag;
        }
        if let Ok(runtime) = std::env::var("HIVE_CONTAINER_RUNTIME") {
            config.container_runtime = runtime;
        }
        if let Ok(image) = std::env::var("HIVE_CONTAINER_IMAGE") {
            config.container_image = image;
        }
        if let Ok(python) = std::env::var("HIVE_PYTHON") {
            config.python = python;
        }
        if let Ok(script) = std::env::var("HIVE_ENTRY_SCRIPT") {
            config.entry_script = script;
        }
        config.output_dir = env_path("HIVE_OUTPUT_DIR");
        if let Some(port) = env_parse::<u16>("HIVE_TENSORBOARD_PORT") {
            config.tensorboard_port = port;
        }

        Ok(config)
    }

    /// Validates the settings needed to talk to the master
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.master_url.is_empty() {
            anyhow::bail!("master_url cannot be empty");
        }

        if !self.master_url.starts_with("http://") && !self.master_url.starts_with("https://") {
            anyhow::bail!("master_url must start with http:// or https://");
        }

        if self.poll_interval.as_secs() == 0 {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        Ok(())
    }

    /// Validates everything the lifecycle loop needs on top of [`Config::validate`]
    pub fn validate_for_run(&self) -> anyhow::Result<()> {
        self.validate()?;

        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if self.passcode.is_empty() {
            anyhow::bail!("passcode cannot be empty");
        }

        if self.entry_script.is_empty() {
            anyhow::bail!("entry_script cannot be empty");
        }

        if self.work_dir == self.dataset_root || self.dataset_root.starts_with(&self.work_dir) {
            anyhow::bail!("dataset_root must live outside work_dir, which is wiped on enroll");
        }

        Ok(())
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            "http://localhost:8000".to_string(),
            String::new(),
            String::new(),
        )
    }
}
