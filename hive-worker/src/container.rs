//! Container runtime management
//!
//! Drives the container CLI (podman or docker) for job execution:
//! - Checking runtime availability
//! - Starting detached job containers and one-shot setup containers
//! - Inspecting status, collecting logs and killing containers

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Container states in which the job is still considered alive
pub const ALIVE_STATES: &[&str] = &["created", "running", "restarting", "paused"];

/// A bind mount from the host into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn rw(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn ro(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    fn as_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything needed to start one container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    /// `false` runs the container with `--network none`
    pub network: bool,
    pub command: Vec<String>,
}

/// Thin wrapper over the container CLI
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    binary: String,
}

impl ContainerRuntime {
    /// Creates a runtime that shells out to `binary` (e.g. "podman")
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Checks that the runtime is installed and answering
    pub async fn check_available(&self) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("Failed to execute '{} --version'. Is it installed?", self.binary))?;

        if !output.status.success() {
            anyhow::bail!("{} is not working correctly", self.binary);
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!("Container runtime is available: {}", version.trim());

        Ok(())
    }

    /// Starts a detached container and returns its id
    pub async fn run_detached(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Starting container from image {}", spec.image);

        let output = Command::new(&self.binary)
            .args(run_args(spec, true))
            .output()
            .await
            .context("Failed to execute container run command")?;

        let stdout = check_output("run", &spec.image, &output)?;
        let container_id = stdout.trim().to_string();

        info!("Container started with ID: {}", container_id);
        Ok(container_id)
    }

    /// Runs a `--rm` container to completion, failing on a non-zero exit
    pub async fn run_to_completion(&self, spec: &ContainerSpec) -> Result<()> {
        debug!("Running one-shot container {:?}", spec.command);

        let output = Command::new(&self.binary)
            .args(run_args(spec, false))
            .output()
            .await
            .context("Failed to execute container run command")?;

        check_output("run", &spec.image, &output)?;
        Ok(())
    }

    /// Current state string of a container (e.g. "running", "exited")
    pub async fn status(&self, container_id: &str) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Status}}", container_id])
            .output()
            .await
            .context("Failed to execute container inspect command")?;

        let stdout = check_output("inspect", container_id, &output)?;
        Ok(stdout.trim().to_string())
    }

    /// Exit code of a stopped container
    pub async fn exit_code(&self, container_id: &str) -> Result<i64> {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.ExitCode}}", container_id])
            .output()
            .await
            .context("Failed to execute container inspect command")?;

        let stdout = check_output("inspect", container_id, &output)?;
        stdout
            .trim()
            .parse::<i64>()
            .with_context(|| format!("Unexpected exit code '{}'", stdout.trim()))
    }

    /// Combined stdout/stderr of a container
    pub async fn logs(&self, container_id: &str) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(["logs", container_id])
            .output()
            .await
            .context("Failed to execute container logs command")?;

        check_output("logs", container_id, &output)?;
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    pub async fn kill(&self, container_id: &str) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["kill", container_id])
            .output()
            .await
            .context("Failed to execute container kill command")?;

        check_output("kill", container_id, &output)?;
        debug!("Container {} killed", container_id);
        Ok(())
    }

    /// Force-removes a container, ignoring containers that are already gone
    pub async fn remove(&self, container_id: &str) {
        match Command::new(&self.binary)
            .args(["rm", "-f", container_id])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                debug!("Container {} removed", container_id);
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!("Failed to remove container {}: {}", container_id, stderr.trim());
            }
            Err(e) => {
                warn!("Failed to remove container {}: {}", container_id, e);
            }
        }
    }
}

/// Builds the argument list of a `run` invocation
fn run_args(spec: &ContainerSpec, detached: bool) -> Vec<String> {
    let mut args = vec!["run".to_string()];

    if detached {
        args.push("-d".to_string());
    } else {
        args.push("--rm".to_string());
    }

    if let Some(name) = &spec.name {
        args.push("--name".to_string());
        args.push(name.clone());
    }

    if !spec.network {
        args.push("--network".to_string());
        args.push("none".to_string());
    }

    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(mount.as_arg());
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    if let Some(workdir) = &spec.workdir {
        args.push("-w".to_string());
        args.push(workdir.clone());
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Returns stdout of a successful invocation, or an error carrying both streams
fn check_output(action: &str, target: &str, output: &Output) -> Result<String> {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !stderr.trim().is_empty() {
        debug!("container {} stderr: {}", action, stderr.trim());
    }

    if !output.status.success() {
        let exit_code = output.status.code().unwrap_or(-1);
        let error_msg = format!(
            "Container {} failed for {}: exit_code={}, stderr='{}'",
            action,
            target,
            exit_code,
            stderr.trim()
        );
        error!("{}", error_msg);
        anyhow::bail!("{}", error_msg);
    }

    Ok(stdout)
}
