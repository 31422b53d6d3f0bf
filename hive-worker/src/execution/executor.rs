//! Executor
//!
//! Prepares the Python virtual environment and launches the job's entry
//! script on one of two backends:
//! - bare metal: a child process using the venv interpreter, working
//!   directory set to the code folder
//! - container: a detached container without network access, the work
//!   folders bind-mounted read-write and the dataset read-only
//!
//! Both backends append the job's stdout and stderr to the user log and pass
//! the same [`TaskEnvironment`] variables.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::environment::{
    CONTAINER_CODE_DIR, CONTAINER_DATASET_DIR, CONTAINER_LOG_DIR, CONTAINER_OUTPUT_DIR,
    CONTAINER_VENV_DIR, TaskEnvironment, USER_LOG, WorkLayout,
};
use crate::config::Config;
use crate::container::{ContainerRuntime, ContainerSpec, Mount};

/// Where jobs run; chosen once from configuration
#[derive(Debug, Clone)]
pub enum Backend {
    BareMetal,
    Container {
        runtime: ContainerRuntime,
        image: String,
    },
}

/// A started job: exactly one process or one container
#[derive(Debug)]
pub enum JobHandle {
    Process(Child),
    Container {
        runtime: ContainerRuntime,
        id: String,
    },
}

#[derive(Debug, Clone)]
pub struct Executor {
    backend: Backend,
    python: String,
    entry_script: String,
}

impl Executor {
    pub fn new(backend: Backend, python: impl Into<String>, entry_script: impl Into<String>) -> Self {
        Self {
            backend,
            python: python.into(),
            entry_script: entry_script.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let backend = if config.in_container {
            Backend::Container {
                runtime: ContainerRuntime::new(config.container_runtime.clone()),
                image: config.container_image.clone(),
            }
        } else {
            Backend::BareMetal
        };

        Self::new(backend, config.python.clone(), config.entry_script.clone())
    }

    pub fn in_container(&self) -> bool {
        matches!(self.backend, Backend::Container { .. })
    }

    /// Fails early when the container runtime is not usable
    pub async fn check_backend(&self) -> Result<()> {
        match &self.backend {
            Backend::BareMetal => Ok(()),
            Backend::Container { runtime, .. } => runtime.check_available().await,
        }
    }

    /// Creates `workdir/venv`, even when the job declares no dependencies
    pub async fn create_venv(&self, layout: &WorkLayout) -> Result<()> {
        info!("Creating virtual environment in {}", layout.venv.display());

        match &self.backend {
            Backend::BareMetal => {
                let mut cmd = Command::new(&self.python);
                cmd.arg("-m").arg("venv").arg(&layout.venv);
                run_checked(cmd, "venv creation").await
            }
            Backend::Container { runtime, image } => {
                tokio::fs::create_dir_all(&layout.venv).await?;
                let spec = setup_spec(
                    layout,
                    image,
                    vec![
                        self.python.clone(),
                        "-m".to_string(),
                        "venv".to_string(),
                        CONTAINER_VENV_DIR.to_string(),
                    ],
                );
                runtime.run_to_completion(&spec).await
            }
        }
    }

    /// Installs `code/requirements.txt` into the venv
    ///
    /// # Returns
    /// `false` when the file is missing or blank and nothing was installed
    pub async fn install_requirements(&self, layout: &WorkLayout) -> Result<bool> {
        let requirements = layout.requirements();
        let content = match tokio::fs::read_to_string(&requirements).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No requirements file, skipping install");
                return Ok(false);
            }
            Err(e) => return Err(e).context("Failed to read requirements file"),
        };

        if content.trim().is_empty() {
            debug!("Requirements file is empty, skipping install");
            return Ok(false);
        }

        info!("Installing job dependencies");
        match &self.backend {
            Backend::BareMetal => {
                let mut cmd = Command::new(layout.venv.join("bin").join("python"));
                cmd.args(["-m", "pip", "install", "-r"]).arg(&requirements);
                run_checked(cmd, "dependency install").await?;
            }
            Backend::Container { runtime, image } => {
                let spec = setup_spec(
                    layout,
                    image,
                    vec![
                        format!("{}/bin/python", CONTAINER_VENV_DIR),
                        "-m".to_string(),
                        "pip".to_string(),
                        "install".to_string(),
                        "-r".to_string(),
                        format!("{}/requirements.txt", CONTAINER_CODE_DIR),
                    ],
                );
                runtime.run_to_completion(&spec).await?;
            }
        }

        Ok(true)
    }

    /// Starts the entry script
    pub async fn start(
        &self,
        layout: &WorkLayout,
        env: &TaskEnvironment,
        dataset: Option<&Path>,
        task_uuid: &str,
    ) -> Result<JobHandle> {
        tokio::fs::create_dir_all(&layout.log).await?;

        match &self.backend {
            Backend::BareMetal => self.start_process(layout, env, dataset),
            Backend::Container { runtime, image } => {
                // The bind-mounted log must exist before the container appends to it.
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(layout.user_log())
                    .context("Failed to create user log")?;

                let name = format!("hive-{}", task_uuid);
                // Leftover from a previous crash of this worker.
                runtime.remove(&name).await;

                let mut mounts = vec![
                    Mount::rw(&layout.code, CONTAINER_CODE_DIR),
                    Mount::rw(&layout.output, CONTAINER_OUTPUT_DIR),
                    Mount::rw(&layout.log, CONTAINER_LOG_DIR),
                    Mount::rw(&layout.venv, CONTAINER_VENV_DIR),
                ];
                if let Some(dataset) = dataset {
                    mounts.push(Mount::ro(dataset, CONTAINER_DATASET_DIR));
                }

                let spec = ContainerSpec {
                    name: Some(name),
                    image: image.clone(),
                    mounts,
                    env: env.container_vars(dataset.is_some()),
                    workdir: Some(CONTAINER_CODE_DIR.to_string()),
                    network: false,
                    command: vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        format!(
                            "exec {}/bin/python -u {} >> {}/{} 2>&1",
                            CONTAINER_VENV_DIR, self.entry_script, CONTAINER_LOG_DIR, USER_LOG
                        ),
                    ],
                };

                let id = runtime.run_detached(&spec).await?;
                Ok(JobHandle::Container {
                    runtime: runtime.clone(),
                    id,
                })
            }
        }
    }

    fn start_process(
        &self,
        layout: &WorkLayout,
        env: &TaskEnvironment,
        dataset: Option<&Path>,
    ) -> Result<JobHandle> {
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(layout.user_log())
            .context("Failed to open user log")?;
        let stderr = stdout.try_clone()?;

        let bin = layout.venv.join("bin");
        let path = match std::env::var("PATH") {
            Ok(path) if !path.is_empty() => format!("{}:{}", bin.display(), path),
            _ => bin.display().to_string(),
        };

        let child = Command::new(bin.join("python"))
            .arg("-u")
            .arg(&self.entry_script)
            .current_dir(&layout.code)
            .envs(env.host_vars(layout, dataset))
            .env("VIRTUAL_ENV", &layout.venv)
            .env("PATH", path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start job process")?;

        info!("Job process started (pid {:?})", child.id());
        Ok(JobHandle::Process(child))
    }
}

/// One-shot container with network access for venv setup
fn setup_spec(layout: &WorkLayout, image: &str, command: Vec<String>) -> ContainerSpec {
    ContainerSpec {
        image: image.to_string(),
        mounts: vec![
            Mount::rw(&layout.code, CONTAINER_CODE_DIR),
            Mount::rw(&layout.venv, CONTAINER_VENV_DIR),
        ],
        workdir: Some(CONTAINER_CODE_DIR.to_string()),
        network: true,
        command,
        ..Default::default()
    }
}

async fn run_checked(mut cmd: Command, what: &str) -> Result<()> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", what))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "{} failed: exit_code={}, stderr='{}'",
            what,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }

    Ok(())
}
