// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Public operations on deployments.
//!
//! Everything up to and including the launch call is synchronous to the
//! caller: validation, allocation, persistence and the runtime `run`. The
//! readiness half runs detached under an [`AttemptTicket`] and only ever
//! mutates the record.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cache::HashStore;
use config::{WorkerConfig, STARTING_PROGRESS};
use model_runtime::{
    scan_hub_cache, CachedModel, ContainerRuntime, GpuTelemetry, ReadinessProbe, RuntimeError,
    WorkerHandle,
};
use protocol::{CatalogEntry, DeployRequest, ModelCatalog, ModelRecord, ModelStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::allocator::{port_holder, Allocator, GpuLoad};
use crate::deploy::{DeployTiming, StateMachine, MSG_INITIALIZING, MSG_LAUNCHED, MSG_STARTING};
use crate::error::SupervisorError;
use crate::launch::{container_name, resolve_settings, worker_spec};
use crate::monitor::CrashWatchdog;
use crate::publish::{publish_running, RoutePublisher};
use crate::reconcile::Reconciler;
use crate::registry::{ModelRegistry, RecordUpdate};
use crate::tasks::{AlreadyActive, AttemptTicket, DeploymentTasks};

/// How long stop and delete wait for a cancelled attempt to wind down.
const CANCEL_WAIT: Duration = Duration::from_secs(30);

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Static knobs of a supervisor.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port_base: u16,
    pub timing: DeployTiming,
    pub worker: WorkerConfig,
    pub catalog: ModelCatalog,
}

/// External capabilities the supervisor drives.
pub struct Collaborators {
    pub store: Arc<dyn HashStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub telemetry: Arc<dyn GpuTelemetry>,
    pub publisher: Arc<dyn RoutePublisher>,
}

/// A catalog entry and whether its weights are already on this host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableModel {
    #[serde(flatten)]
    pub entry: CatalogEntry,
    pub cached: bool,
}

/// A record and whether its weights are already on this host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelView {
    #[serde(flatten)]
    pub record: ModelRecord,
    pub cached: bool,
}

#[derive(Clone)]
pub struct Supervisor {
    settings: Arc<Settings>,
    registry: ModelRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    publisher: Arc<dyn RoutePublisher>,
    allocator: Allocator,
    machine: StateMachine,
    tasks: DeploymentTasks,
}

impl Supervisor {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            runtime,
            probe,
            telemetry,
            publisher,
        } = collaborators;
        let registry = ModelRegistry::new(store);
        let machine = StateMachine::new(
            registry.clone(),
            runtime.clone(),
            probe,
            publisher.clone(),
            settings.timing,
        );
        Self {
            allocator: Allocator::new(settings.port_base, telemetry),
            settings: Arc::new(settings),
            registry,
            runtime,
            publisher,
            machine,
            tasks: DeploymentTasks::new(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &DeploymentTasks {
        &self.tasks
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Startup reconciler over the same store and runtime.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.registry.clone(),
            self.runtime.clone(),
            self.publisher.clone(),
            self.settings.worker.container_prefix.clone(),
            self.settings.port_base,
        )
    }

    /// Crash watchdog that leaves in-flight attempts alone.
    pub fn watchdog(&self) -> CrashWatchdog {
        CrashWatchdog::new(
            self.registry.clone(),
            self.runtime.clone(),
            self.publisher.clone(),
            self.tasks.clone(),
            self.settings.worker.container_prefix.clone(),
        )
    }

    fn container(&self, abbr: &str) -> String {
        container_name(&self.settings.worker.container_prefix, abbr)
    }

    fn begin(&self, abbr: &str) -> Result<AttemptTicket> {
        self.tasks
            .begin(abbr)
            .map_err(|AlreadyActive(abbr)| SupervisorError::AttemptInFlight(abbr))
    }

    /// Start a new deployment and return the persisted `deploying` record.
    pub async fn deploy(&self, request: DeployRequest) -> Result<ModelRecord> {
        request.validate()?;
        let abbr = request.abbr.clone();
        let ticket = self.begin(&abbr)?;

        if let Some(existing) = self.registry.get(&abbr).await? {
            if existing.status.is_active() {
                return Err(SupervisorError::AlreadyActive {
                    abbr,
                    status: existing.status,
                });
            }
        }

        let active = self.registry.list_active().await?;
        let port = match request.port {
            Some(port) => {
                if let Some(holder) = port_holder(&active, port, &abbr) {
                    return Err(SupervisorError::PortInUse {
                        port,
                        holder: holder.abbr.clone(),
                    });
                }
                port
            }
            None => self
                .allocator
                .next_port(&active)
                .ok_or(SupervisorError::PortsExhausted(self.settings.port_base))?,
        };
        let gpu_device = match request.gpu_device {
            Some(gpu) => gpu,
            None => self.allocator.pick_gpu(&active).await,
        };

        let serving = resolve_settings(&request, &self.settings.catalog);
        let record = ModelRecord {
            abbr: abbr.clone(),
            name: request.name.clone(),
            model_type: request.model_type,
            quantization: serving.quantization,
            port,
            gpu_device,
            max_model_len: serving.max_model_len,
            gpu_memory_utilization: serving.gpu_memory_utilization,
            max_num_seqs: serving.max_num_seqs,
            status: ModelStatus::Deploying,
            progress: Some(0),
            progress_message: Some(MSG_INITIALIZING.to_string()),
            container_id: None,
        };
        self.registry.put(&record).await?;
        info!(
            "neuron::supervisor: deploying {abbr} ({}) on port {port}, gpu {gpu_device}",
            record.name
        );

        self.launch(ticket, record).await
    }

    /// Re-run a stopped or failed deployment with its stored settings.
    pub async fn restart(&self, abbr: &str) -> Result<ModelRecord> {
        let ticket = self.begin(abbr)?;
        let record = self.registry.require(abbr).await?;
        if !record.status.can_transition_to(ModelStatus::Deploying) {
            return Err(SupervisorError::InvalidTransition {
                abbr: abbr.to_string(),
                from: record.status,
                to: ModelStatus::Deploying,
            });
        }

        let active = self.registry.list_active().await?;
        let port = match port_holder(&active, record.port, abbr) {
            None => record.port,
            Some(holder) => {
                let port = self
                    .allocator
                    .next_port(&active)
                    .ok_or(SupervisorError::PortsExhausted(self.settings.port_base))?;
                info!(
                    "neuron::supervisor: port {} of {abbr} now held by {}, moving to {port}",
                    record.port, holder.abbr
                );
                port
            }
        };

        let update = RecordUpdate::new()
            .port(port)
            .progress(0)
            .message(MSG_INITIALIZING)
            .container_id("");
        let record = self
            .registry
            .transition(abbr, ModelStatus::Deploying, update)
            .await?;
        info!("neuron::supervisor: restarting {abbr} on port {port}");

        self.launch(ticket, record).await
    }

    /// Replace any stale worker, start a fresh one and hand the attempt to
    /// the state machine.
    async fn launch(&self, ticket: AttemptTicket, record: ModelRecord) -> Result<ModelRecord> {
        let abbr = record.abbr.clone();
        let container = self.container(&abbr);
        self.registry
            .update(
                &abbr,
                RecordUpdate::new()
                    .progress(STARTING_PROGRESS)
                    .message(MSG_STARTING),
            )
            .await?;

        let handle = match self.start_worker(&container, &record).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_launch(&abbr, &e).await;
                return Err(e);
            }
        };

        let update = RecordUpdate::new()
            .container_id(handle.id.clone())
            .progress(self.settings.timing.launch_progress)
            .message(MSG_LAUNCHED);
        self.registry.update(&abbr, update).await?;
        info!(
            "neuron::supervisor: {container} started ({}), waiting for readiness",
            handle.id
        );

        tokio::spawn(self.machine.clone().run(ticket, container, record.port));
        Ok(self.registry.require(&abbr).await?)
    }

    async fn start_worker(&self, container: &str, record: &ModelRecord) -> Result<WorkerHandle> {
        match self.runtime.remove(container, true).await {
            Ok(()) => debug!("neuron::supervisor: removed stale worker {container}"),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) if e.is_unreachable() => return Err(SupervisorError::RuntimeUnavailable(e)),
            Err(e) => warn!("neuron::supervisor: could not remove stale {container}: {e}"),
        }

        let spec = worker_spec(&self.settings.worker, record);
        let handle = self.runtime.run(&spec).await.map_err(|e| {
            if e.is_unreachable() {
                SupervisorError::RuntimeUnavailable(e)
            } else {
                SupervisorError::LaunchFailed(e.to_string())
            }
        })?;
        if handle.id.is_empty() {
            return Err(SupervisorError::LaunchFailed(format!(
                "runtime returned no id for {container}"
            )));
        }
        Ok(handle)
    }

    async fn fail_launch(&self, abbr: &str, cause: &SupervisorError) {
        warn!("neuron::supervisor: launch of {abbr} failed: {cause}");
        let update = RecordUpdate::new()
            .progress(0)
            .message(format!("Deployment failed: {cause}"));
        if let Err(e) = self
            .registry
            .transition(abbr, ModelStatus::Error, update)
            .await
        {
            warn!("neuron::supervisor: could not mark {abbr} as failed: {e}");
        }
    }

    /// Stop a running worker; the record keeps its port and settings.
    pub async fn stop(&self, abbr: &str) -> Result<ModelRecord> {
        let record = self.registry.require(abbr).await?;
        if record.status != ModelStatus::Running {
            return Err(SupervisorError::InvalidTransition {
                abbr: abbr.to_string(),
                from: record.status,
                to: ModelStatus::Stopped,
            });
        }
        // the attempt may still be inside its grace period.
        self.tasks.cancel_and_wait(abbr, CANCEL_WAIT).await;

        let container = self.container(abbr);
        match self.runtime.stop(&container).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(SupervisorError::RuntimeUnavailable(e)),
        }
        let record = self
            .registry
            .transition(abbr, ModelStatus::Stopped, RecordUpdate::new().clear_progress())
            .await?;
        info!("neuron::supervisor: stopped {abbr}");

        publish_running(&self.registry, self.publisher.as_ref()).await;
        Ok(record)
    }

    /// Cancel, tear down and forget a deployment.
    pub async fn delete(&self, abbr: &str) -> Result<()> {
        self.registry.require(abbr).await?;
        if !self.tasks.cancel_and_wait(abbr, CANCEL_WAIT).await {
            warn!("neuron::supervisor: deleting {abbr} while its attempt is still winding down");
        }

        let container = self.container(abbr);
        match self.runtime.remove(&container, true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(SupervisorError::RuntimeUnavailable(e)),
        }

        // read after cancelling; the attempt may have just settled.
        let was_running = self
            .registry
            .get(abbr)
            .await?
            .is_some_and(|r| r.status == ModelStatus::Running);
        self.registry.delete(abbr).await?;
        info!("neuron::supervisor: deleted {abbr}");

        if was_running {
            publish_running(&self.registry, self.publisher.as_ref()).await;
        }
        Ok(())
    }

    /// Last `lines` lines of the worker's output.
    pub async fn logs(&self, abbr: &str, lines: usize) -> Result<String> {
        self.registry.require(abbr).await?;
        match self.runtime.logs(&self.container(abbr), lines).await {
            Ok(logs) => Ok(logs),
            Err(RuntimeError::NotFound(_)) => Err(SupervisorError::NotFound(abbr.to_string())),
            Err(e) => Err(SupervisorError::RuntimeUnavailable(e)),
        }
    }

    pub async fn get(&self, abbr: &str) -> Result<ModelRecord> {
        Ok(self.registry.require(abbr).await?)
    }

    /// Every record, flagged with whether its model is in the local cache.
    pub async fn list_views(&self) -> Result<Vec<ModelView>> {
        let records = self.registry.list().await?;
        let cached = self.cached_names().await;
        Ok(records
            .into_iter()
            .map(|record| ModelView {
                cached: cached.contains(&record.name),
                record,
            })
            .collect())
    }

    /// Downloaded models in the host's hub cache.
    pub async fn cached_models(&self) -> Vec<CachedModel> {
        scan_hub_cache(self.settings.worker.hub_cache_dir()).await
    }

    async fn cached_names(&self) -> BTreeSet<String> {
        self.cached_models().await.into_iter().map(|m| m.name).collect()
    }

    /// Catalog entries in catalog order.
    pub async fn available_models(&self) -> Vec<AvailableModel> {
        let cached = self.cached_names().await;
        self.settings
            .catalog
            .predefined_models
            .iter()
            .map(|entry| AvailableModel {
                cached: cached.contains(&entry.name),
                entry: entry.clone(),
            })
            .collect()
    }

    pub async fn gpu_report(&self) -> Result<Vec<GpuLoad>> {
        let active = self.registry.list_active().await?;
        Ok(self.allocator.report(&active).await?)
    }

    pub async fn runtime_healthy(&self) -> bool {
        match self.runtime.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("neuron::supervisor: runtime ping failed: {e}");
                false
            }
        }
    }
}
