// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Errors reported by a [`ContainerRuntime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The named container does not exist.
    #[error("container {0} not found")]
    NotFound(String),
    /// The runtime could not be reached at all (daemon down, binary missing).
    #[error("container runtime unreachable: {0}")]
    Unavailable(String),
    /// A call exceeded the caller-side ceiling.
    #[error("runtime call `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    /// The runtime answered but refused the request.
    #[error("runtime rejected `{op}`: {message}")]
    Rejected { op: &'static str, message: String },
    #[error("unexpected runtime output: {0}")]
    Malformed(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    /// Whether the failure says nothing about the container itself, only
    /// that the runtime could not be consulted.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_) | RuntimeError::Timeout { .. })
    }
}

/// Lifecycle state of a container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Unknown,
}

impl WorkerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => WorkerState::Created,
            "running" => WorkerState::Running,
            "restarting" => WorkerState::Restarting,
            "paused" => WorkerState::Paused,
            "exited" => WorkerState::Exited,
            "dead" => WorkerState::Dead,
            _ => WorkerState::Unknown,
        }
    }

    /// The process inside has ended and will not serve without a relaunch.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Exited | WorkerState::Dead)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Created => "created",
            WorkerState::Running => "running",
            WorkerState::Restarting => "restarting",
            WorkerState::Paused => "paused",
            WorkerState::Exited => "exited",
            WorkerState::Dead => "dead",
            WorkerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Bind mount from the host into the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Host port published to a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuRequest {
    None,
    /// expose every device; selection happens through `CUDA_VISIBLE_DEVICES`.
    All,
    Devices(Vec<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    UnlessStopped,
    Always,
}

impl RestartPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::UnlessStopped => "unless-stopped",
            RestartPolicy::Always => "always",
        }
    }
}

/// Everything needed to launch one worker container.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub name: String,
    pub image: String,
    /// arguments appended after the image (the image entrypoint is kept).
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub network: Option<String>,
    pub gpus: GpuRequest,
    pub restart: RestartPolicy,
    pub ports: Vec<PortMapping>,
    pub labels: BTreeMap<String, String>,
}

/// Reference to a launched container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    pub id: String,
    pub name: String,
}

/// Container as seen when enumerating the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub id: String,
    pub name: String,
    pub state: WorkerState,
    pub labels: BTreeMap<String, String>,
}

/// Launches and inspects worker containers.
///
/// `target` arguments accept a container name or id. Implementations map a
/// missing container to [`RuntimeError::NotFound`] so callers can treat
/// absence as a state rather than a failure.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn run(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RuntimeError>;

    async fn stop(&self, target: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, target: &str, force: bool) -> Result<(), RuntimeError>;

    async fn status(&self, target: &str) -> Result<WorkerState, RuntimeError>;

    /// Last `tail` lines of combined stdout/stderr.
    async fn logs(&self, target: &str, tail: usize) -> Result<String, RuntimeError>;

    async fn exists(&self, target: &str) -> Result<bool, RuntimeError>;

    /// All containers (any state) whose name starts with `name_prefix`.
    async fn list(&self, name_prefix: &str) -> Result<Vec<WorkerInfo>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parsing_is_lenient() {
        assert_eq!(WorkerState::parse("running\n"), WorkerState::Running);
        assert_eq!(WorkerState::parse("Exited"), WorkerState::Exited);
        assert_eq!(WorkerState::parse("removing"), WorkerState::Unknown);
        assert!(WorkerState::Dead.is_terminal());
        assert!(!WorkerState::Restarting.is_terminal());
    }

    #[test]
    fn unreachable_covers_timeouts() {
        let timeout = RuntimeError::Timeout {
            op: "status",
            after: Duration::from_secs(5),
        };
        assert!(timeout.is_unreachable());
        assert!(!RuntimeError::NotFound("x".into()).is_unreachable());
    }
}
