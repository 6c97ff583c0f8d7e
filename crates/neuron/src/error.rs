// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::fmt;

use cache::CacheError;
use model_runtime::{RuntimeError, TelemetryError, WorkerState};
use protocol::{ModelStatus, RecordError};
use thiserror::Error;

/// Failures of the record store layer.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("state store failure: {0}")]
    Store(#[from] CacheError),
    #[error("record for {abbr} is unreadable: {source}")]
    Decode {
        abbr: String,
        #[source]
        source: RecordError,
    },
    #[error("model {abbr} cannot move from {from} to {to}")]
    Transition {
        abbr: String,
        from: ModelStatus,
        to: ModelStatus,
    },
    #[error("model {0} not found")]
    Missing(String),
}

/// Errors returned synchronously by supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("model {0} not found")]
    NotFound(String),
    #[error("model {abbr} is already {status}")]
    AlreadyActive { abbr: String, status: ModelStatus },
    #[error("a deployment attempt for {0} is still in flight")]
    AttemptInFlight(String),
    #[error("port {port} is already used by {holder}")]
    PortInUse { port: u16, holder: String },
    #[error("model {abbr} cannot move from {from} to {to}")]
    InvalidTransition {
        abbr: String,
        from: ModelStatus,
        to: ModelStatus,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RecordError),
    #[error("no free port at or above {0}")]
    PortsExhausted(u16),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(#[source] RuntimeError),
    #[error("worker launch failed: {0}")]
    LaunchFailed(String),
    #[error("state store failure: {0}")]
    Store(#[source] RegistryError),
    #[error("gpu telemetry unavailable: {0}")]
    Telemetry(#[from] TelemetryError),
}

impl From<RegistryError> for SupervisorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Missing(abbr) => SupervisorError::NotFound(abbr),
            RegistryError::Transition { abbr, from, to } => {
                SupervisorError::InvalidTransition { abbr, from, to }
            }
            other => SupervisorError::Store(other),
        }
    }
}

/// Telemetry could not be read; placement falls back to GPU 0.
#[derive(Debug, Error)]
#[error("gpu telemetry unavailable, placing on gpu 0: {0}")]
pub struct AllocationUnavailable(pub String);

/// Best-effort diagnosis of why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashKind {
    OutOfMemory,
    GpuError,
    ModelNotFound,
    /// nothing recognisable in the logs; carries the last known state.
    Exited(String),
}

/// Log fragments mapped to a crash kind; first match wins.
const CRASH_SIGNATURES: &[(&[&str], CrashKind)] = &[
    (&["out of memory", "outofmemoryerror"], CrashKind::OutOfMemory),
    (
        &["cuda error", "cudaerror", "no cuda gpus", "nvidia driver"],
        CrashKind::GpuError,
    ),
    (
        &[
            "repository not found",
            "does not appear to have a file",
            "404 client error",
            "not found",
        ],
        CrashKind::ModelNotFound,
    ),
];

impl CrashKind {
    /// Classify a worker's tail logs.
    pub fn classify(logs: &str, state: Option<WorkerState>) -> Self {
        let lower = logs.to_lowercase();
        for (needles, kind) in CRASH_SIGNATURES {
            if needles.iter().any(|n| lower.contains(n)) {
                return kind.clone();
            }
        }
        CrashKind::Exited(state.map_or_else(|| "missing".to_string(), |s| s.to_string()))
    }
}

impl fmt::Display for CrashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashKind::OutOfMemory => f.write_str("out of GPU memory"),
            CrashKind::GpuError => f.write_str("GPU/CUDA error"),
            CrashKind::ModelNotFound => f.write_str("model not found"),
            CrashKind::Exited(state) => write!(f, "container stopped unexpectedly (status: {state})"),
        }
    }
}

/// Why an attempt ended in `error`; recorded as the progress message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureCause {
    #[error("Deployment failed: {0}")]
    WorkerCrashed(CrashKind),
    #[error("Deployment failed: timeout waiting for model to load after {0}s")]
    DeploymentTimeout(u64),
}
