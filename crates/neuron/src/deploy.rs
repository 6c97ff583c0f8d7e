// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Readiness half of a deployment attempt.
//!
//! Once the runtime has accepted a launch, the attempt polls the worker on a
//! fixed deadline schedule (`launch + interval * (i + 1)`). The whole loop,
//! including the runtime and probe calls inside each poll, is bounded by
//! `launch + interval * max_polls`; a poll still in flight at that point
//! ends the attempt as timed out. Each poll first asks the runtime whether
//! the container is still alive, then asks the probe whether it serves.

use std::sync::Arc;
use std::time::Duration;

use config::{DeployConfig, STARTING_PROGRESS};
use model_runtime::{ContainerRuntime, ReadinessProbe, RuntimeError, WorkerState};
use protocol::ModelStatus;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{CrashKind, FailureCause, RegistryError};
use crate::publish::{publish_running, RoutePublisher};
use crate::registry::{ModelRegistry, RecordUpdate};
use crate::tasks::AttemptTicket;

/// lines of worker output inspected when classifying a crash.
pub const CRASH_LOG_LINES: usize = 50;

pub const MSG_INITIALIZING: &str = "Initializing deployment...";
pub const MSG_STARTING: &str = "Starting container...";
pub const MSG_LAUNCHED: &str = "Container started, loading model...";
pub const MSG_READY: &str = "Model ready";

/// Phase labels keyed by the upper bound (exclusive) of the share of the
/// polling budget already spent, in percent.
const PHASES: &[(u32, &str)] = &[
    (10, "Initializing engine"),
    (40, "Loading model weights"),
    (70, "Compiling CUDA graphs"),
    (90, "Starting server"),
];
const FINAL_PHASE: &str = "Finalizing";

/// Polling budget and progress shape of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployTiming {
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub ready_grace: Duration,
    pub launch_progress: u8,
    pub progress_ceiling: u8,
}

impl Default for DeployTiming {
    fn default() -> Self {
        Self::from(&DeployConfig::default())
    }
}

impl From<&DeployConfig> for DeployTiming {
    fn from(config: &DeployConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_polls: config.max_polls.max(1),
            ready_grace: config.ready_grace(),
            launch_progress: config.launch_progress.max(STARTING_PROGRESS),
            progress_ceiling: config.progress_ceiling,
        }
    }
}

impl DeployTiming {
    /// Hard ceiling on the readiness loop.
    pub fn budget(&self) -> Duration {
        self.poll_interval * self.max_polls
    }

    /// Progress reported after poll `i` (0-based) found the worker not ready.
    pub fn progress_at(&self, i: u32) -> u8 {
        let span = u32::from(self.progress_ceiling.saturating_sub(self.launch_progress));
        let step = span * (i + 1).min(self.max_polls) / self.max_polls;
        // step <= span <= 100
        self.launch_progress.saturating_add(step as u8)
    }

    pub fn phase_at(&self, i: u32) -> &'static str {
        let spent = i.saturating_mul(100) / self.max_polls;
        PHASES
            .iter()
            .find(|(bound, _)| spent < *bound)
            .map_or(FINAL_PHASE, |(_, label)| label)
    }

    fn progress_message(&self, i: u32) -> String {
        let elapsed = self.poll_interval * (i + 1);
        format!("{}... ({}s)", self.phase_at(i), elapsed.as_secs())
    }
}

/// How the readiness loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Ready,
    Crashed(CrashKind),
    TimedOut,
    /// cancelled through the task registry (delete).
    Cancelled,
    /// the record disappeared underneath the attempt.
    Vanished,
}

/// Drives launched workers to `running` or `error`.
#[derive(Clone)]
pub struct StateMachine {
    registry: ModelRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ReadinessProbe>,
    publisher: Arc<dyn RoutePublisher>,
    timing: DeployTiming,
}

impl StateMachine {
    pub fn new(
        registry: ModelRegistry,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ReadinessProbe>,
        publisher: Arc<dyn RoutePublisher>,
        timing: DeployTiming,
    ) -> Self {
        Self {
            registry,
            runtime,
            probe,
            publisher,
            timing,
        }
    }

    pub fn timing(&self) -> &DeployTiming {
        &self.timing
    }

    /// Poll until the worker serves, dies, or the budget runs out.
    pub async fn await_ready(
        &self,
        ticket: &mut AttemptTicket,
        container: &str,
        port: u16,
    ) -> AttemptOutcome {
        let abbr = ticket.abbr().to_string();
        let start = Instant::now();
        let end = start + self.timing.budget();

        for i in 0..self.timing.max_polls {
            let deadline = (start + self.timing.poll_interval * (i + 1)).min(end);
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = ticket.cancelled() => return AttemptOutcome::Cancelled,
            }

            let polled = tokio::select! {
                polled = timeout_at(end, self.poll_once(&abbr, container, port, i)) => polled,
                _ = ticket.cancelled() => return AttemptOutcome::Cancelled,
            };
            match polled {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => {}
                Err(_) => {
                    warn!("neuron::deploy: poll {} for {abbr} still pending at the deadline", i + 1);
                    return AttemptOutcome::TimedOut;
                }
            }
        }
        AttemptOutcome::TimedOut
    }

    /// One liveness check, probe and progress update; `None` keeps polling.
    async fn poll_once(
        &self,
        abbr: &str,
        container: &str,
        port: u16,
        i: u32,
    ) -> Option<AttemptOutcome> {
        if let Some(kind) = self.check_alive(container).await {
            return Some(AttemptOutcome::Crashed(kind));
        }

        if self.probe.is_ready(port).await {
            info!("neuron::deploy: {abbr} ready after {} poll(s)", i + 1);
            return Some(AttemptOutcome::Ready);
        }

        let update = RecordUpdate::new()
            .progress(self.timing.progress_at(i))
            .message(self.timing.progress_message(i));
        match self.registry.update(abbr, update).await {
            Ok(true) => None,
            Ok(false) => Some(AttemptOutcome::Vanished),
            Err(e) => {
                warn!("neuron::deploy: progress update for {abbr} failed: {e}");
                None
            }
        }
    }

    /// `Some(kind)` when the worker is gone or has stopped.
    async fn check_alive(&self, container: &str) -> Option<CrashKind> {
        let state = match self.runtime.status(container).await {
            Ok(state) if is_crash_state(state) => Some(state),
            // unknown only counts once the runtime confirms the worker is gone.
            Ok(WorkerState::Unknown) => match self.runtime.exists(container).await {
                Ok(false) => None,
                _ => return None,
            },
            Ok(_) => return None,
            Err(RuntimeError::NotFound(_)) => None,
            Err(e) => {
                // cannot tell; the probe still gets its say.
                warn!("neuron::deploy: status of {container} unavailable: {e}");
                return None;
            }
        };
        Some(diagnose(self.runtime.as_ref(), container, state).await)
    }

    /// Record the outcome; publishes exactly once on success.
    pub async fn settle(&self, ticket: &mut AttemptTicket, outcome: &AttemptOutcome) {
        let abbr = ticket.abbr().to_string();
        let result = match outcome {
            AttemptOutcome::Ready => self.settle_ready(ticket).await,
            AttemptOutcome::Crashed(kind) => {
                self.fail(&abbr, FailureCause::WorkerCrashed(kind.clone()))
                    .await
            }
            AttemptOutcome::TimedOut => {
                // the container stays around for post-mortem logs.
                let cause = FailureCause::DeploymentTimeout(self.timing.budget().as_secs());
                self.fail(&abbr, cause).await
            }
            AttemptOutcome::Cancelled | AttemptOutcome::Vanished => {
                debug!("neuron::deploy: attempt for {abbr} ended early ({outcome:?})");
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(RegistryError::Missing(_)) => {
                debug!("neuron::deploy: {abbr} deleted before the attempt settled")
            }
            Err(e) => warn!("neuron::deploy: could not record outcome for {abbr}: {e}"),
        }
    }

    async fn settle_ready(&self, ticket: &mut AttemptTicket) -> Result<(), RegistryError> {
        let abbr = ticket.abbr().to_string();
        self.registry
            .transition(
                &abbr,
                ModelStatus::Running,
                RecordUpdate::new().progress(100).message(MSG_READY),
            )
            .await?;
        publish_running(&self.registry, self.publisher.as_ref()).await;

        tokio::select! {
            _ = sleep(self.timing.ready_grace) => {}
            _ = ticket.cancelled() => return Ok(()),
        }
        // only a still-running record gets its progress cleared.
        if let Some(record) = self.registry.get(&abbr).await? {
            if record.status == ModelStatus::Running {
                self.registry
                    .update(&abbr, RecordUpdate::new().clear_progress())
                    .await?;
            }
        }
        Ok(())
    }

    async fn fail(&self, abbr: &str, cause: FailureCause) -> Result<(), RegistryError> {
        warn!("neuron::deploy: {abbr}: {cause}");
        self.registry
            .transition(
                abbr,
                ModelStatus::Error,
                RecordUpdate::new().progress(0).message(cause.to_string()),
            )
            .await
            .map(drop)
    }

    /// Readiness loop plus settlement; the ticket is released on return.
    pub async fn run(self, mut ticket: AttemptTicket, container: String, port: u16) -> AttemptOutcome {
        let outcome = self.await_ready(&mut ticket, &container, port).await;
        self.settle(&mut ticket, &outcome).await;
        outcome
    }
}

/// Classify a stopped worker from its tail logs.
pub async fn diagnose(
    runtime: &dyn ContainerRuntime,
    container: &str,
    state: Option<WorkerState>,
) -> CrashKind {
    let logs = match runtime.logs(container, CRASH_LOG_LINES).await {
        Ok(logs) => logs,
        Err(e) => {
            debug!("neuron::deploy: no logs for {container}: {e}");
            String::new()
        }
    };
    let kind = CrashKind::classify(&logs, state);
    error!("neuron::deploy: {container} stopped unexpectedly ({kind})\n{logs}");
    kind
}

/// States in which a launched worker will not become ready.
pub fn is_crash_state(state: WorkerState) -> bool {
    matches!(
        state,
        WorkerState::Exited | WorkerState::Dead | WorkerState::Restarting
    )
}
