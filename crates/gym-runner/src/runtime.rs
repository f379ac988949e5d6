use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::process::{Command, Output, Stdio};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    Dead,
    Other(String),
}

impl ContainerStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "running" => ContainerStatus::Running,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            other => ContainerStatus::Other(other.to_string()),
        }
    }

    /// Only a running container is alive. `removing`, `restarting`,
    /// `paused` and `created` all mean the workload is not serving.
    pub fn is_alive(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Running => f.write_str("running"),
            ContainerStatus::Exited => f.write_str("exited"),
            ContainerStatus::Dead => f.write_str("dead"),
            ContainerStatus::Other(s) => f.write_str(s),
        }
    }
}

/// Everything needed to launch one detached, auto-removed container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// (host port, container port), published as TCP.
    pub ports: Vec<(u16, u16)>,
    /// `host:container` bind mounts.
    pub volumes: Vec<String>,
    pub memory: Option<String>,
    pub cpus: Option<f64>,
    pub user: Option<String>,
    pub privileged: bool,
    pub network: Option<String>,
}

/// Container engine seen by the scheduler. One instance is built at startup
/// and shared by every attempt; each attempt only touches containers it
/// named itself.
pub trait ContainerRuntime: Send + Sync {
    fn image_exists(&self, image: &str) -> Result<bool>;
    fn run_detached(&self, spec: &ContainerSpec) -> Result<()>;
    /// An error means the container could not be inspected, usually because
    /// it has already been removed.
    fn status(&self, name: &str) -> Result<ContainerStatus>;
    fn stop(&self, name: &str) -> Result<()>;
}

/// Drives the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn exec(&self, args: &[String]) -> Result<Output> {
        debug!(binary = %self.binary, args = ?args, "invoking container runtime");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| anyhow!("failed to invoke {}: {}", self.binary, e))?;
        Ok(output)
    }

    fn exec_checked(&self, args: &[String]) -> Result<String> {
        let output = self.exec(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(anyhow!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or(""),
                stderr_tail(&output)
            ))
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for DockerCli {
    fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self.exec(&[
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            image.to_string(),
        ])?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = stderr_tail(&output);
        if stderr.to_ascii_lowercase().contains("no such image") {
            Ok(false)
        } else {
            Err(anyhow!("could not inspect image {}: {}", image, stderr))
        }
    }

    fn run_detached(&self, spec: &ContainerSpec) -> Result<()> {
        self.exec_checked(&run_args(spec)).map(|_| ())
    }

    fn status(&self, name: &str) -> Result<ContainerStatus> {
        let raw = self.exec_checked(&[
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            name.to_string(),
        ])?;
        Ok(ContainerStatus::parse(&raw))
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.exec_checked(&["stop".to_string(), name.to_string()])
            .map(|_| ())
    }
}

pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for (host, container) in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}/tcp", host, container));
    }
    for volume in &spec.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }
    if let Some(memory) = &spec.memory {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }
    if let Some(cpus) = spec.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.to_string());
    }
    if let Some(user) = &spec.user {
        args.push("-u".to_string());
        args.push(user.clone());
    }
    if spec.privileged {
        args.push("--privileged".to_string());
    }
    if let Some(network) = &spec.network {
        args.push(format!("--network={}", network));
    }
    args.push(spec.image.clone());
    args
}

fn stderr_tail(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no error output")
        .trim()
        .to_string()
}
