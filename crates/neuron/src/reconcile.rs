// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Startup repair of drift between persisted records and the workers the
//! container runtime actually has.
//!
//! The forward pass walks records and relabels the ones whose worker no
//! longer matches; the reverse pass adopts live managed workers that have no
//! record. Nothing here is fatal: each failure is logged and the pass moves
//! on, so a broken runtime or store never keeps the node from starting.
//! Running it twice in a row changes nothing the second time.

use std::sync::Arc;

use model_runtime::{ContainerRuntime, RuntimeError, WorkerInfo, WorkerState};
use protocol::{
    validate_abbr, ModelRecord, ModelStatus, ModelType, DEFAULT_GPU_MEMORY_UTILIZATION,
    DEFAULT_MAX_MODEL_LEN, DEFAULT_MAX_NUM_SEQS,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::allocator::next_free_port;
use crate::deploy::is_crash_state;
use crate::error::RegistryError;
use crate::launch::{container_name, labels};
use crate::publish::{publish_running, RoutePublisher};
use crate::registry::{ModelRegistry, RecordUpdate};

pub const MSG_INTERRUPTED: &str = "Deployment interrupted";
pub const MSG_EXITED: &str = "Container exited - check logs";

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// `deploying` records whose worker turned out to be serving.
    pub recovered: Vec<String>,
    /// `deploying` records whose worker is not serving and not crashed.
    pub interrupted: Vec<String>,
    /// `running` records whose worker is gone.
    pub stopped: Vec<String>,
    /// records whose worker exited.
    pub failed: Vec<String>,
    /// live workers without a record, now tracked as `running`.
    pub adopted: Vec<String>,
    /// mismatches left alone (logged only).
    pub drift: Vec<String>,
    pub errors: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> usize {
        self.recovered.len()
            + self.interrupted.len()
            + self.stopped.len()
            + self.failed.len()
            + self.adopted.len()
    }
}

#[derive(Clone)]
pub struct Reconciler {
    registry: ModelRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    publisher: Arc<dyn RoutePublisher>,
    container_prefix: String,
    port_base: u16,
}

impl Reconciler {
    pub fn new(
        registry: ModelRegistry,
        runtime: Arc<dyn ContainerRuntime>,
        publisher: Arc<dyn RoutePublisher>,
        container_prefix: impl Into<String>,
        port_base: u16,
    ) -> Self {
        Self {
            registry,
            runtime,
            publisher,
            container_prefix: container_prefix.into(),
            port_base,
        }
    }

    pub async fn run(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.forward_pass(&mut report).await;
        self.reverse_pass(&mut report).await;
        publish_running(&self.registry, self.publisher.as_ref()).await;

        info!(
            "neuron::reconcile: {} change(s): recovered={:?} interrupted={:?} stopped={:?} failed={:?} adopted={:?} ({} error(s))",
            report.changed(),
            report.recovered,
            report.interrupted,
            report.stopped,
            report.failed,
            report.adopted,
            report.errors
        );
        report
    }

    /// `Ok(None)` when the worker does not exist.
    async fn worker_state(&self, abbr: &str) -> Result<Option<WorkerState>, RuntimeError> {
        let container = container_name(&self.container_prefix, abbr);
        match self.runtime.status(&container).await {
            // an unreadable state only means "gone" once the runtime says so.
            Ok(WorkerState::Unknown) => match self.runtime.exists(&container).await? {
                true => Ok(Some(WorkerState::Unknown)),
                false => Ok(None),
            },
            Ok(state) => Ok(Some(state)),
            Err(RuntimeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn forward_pass(&self, report: &mut ReconcileReport) {
        let records = match self.registry.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!("neuron::reconcile: cannot list records: {e}");
                report.errors += 1;
                return;
            }
        };

        for record in records {
            let abbr = record.abbr.clone();
            let state = match self.worker_state(&abbr).await {
                Ok(state) => state,
                Err(e) => {
                    warn!("neuron::reconcile: cannot inspect worker for {abbr}: {e}");
                    report.errors += 1;
                    continue;
                }
            };

            let relabel = match (record.status, state) {
                (ModelStatus::Deploying, Some(WorkerState::Running)) => Some((
                    ModelStatus::Running,
                    RecordUpdate::new().clear_progress(),
                    &mut report.recovered,
                )),
                (ModelStatus::Deploying | ModelStatus::Running, Some(s)) if is_crash_state(s) => {
                    Some((
                        ModelStatus::Error,
                        RecordUpdate::new().progress(0).message(MSG_EXITED),
                        &mut report.failed,
                    ))
                }
                // no attempt survives a restart, so nothing else would settle it.
                (ModelStatus::Deploying, _) => Some((
                    ModelStatus::Error,
                    RecordUpdate::new().progress(0).message(MSG_INTERRUPTED),
                    &mut report.interrupted,
                )),
                (ModelStatus::Running, None | Some(WorkerState::Created)) => Some((
                    ModelStatus::Stopped,
                    RecordUpdate::new().clear_progress(),
                    &mut report.stopped,
                )),
                (ModelStatus::Stopped | ModelStatus::Error, Some(WorkerState::Running)) => {
                    warn!(
                        "neuron::reconcile: {abbr} is {} but its worker is running; leaving it",
                        record.status
                    );
                    report.drift.push(abbr.clone());
                    None
                }
                _ => None,
            };

            let Some((next, update, bucket)) = relabel else {
                continue;
            };
            match self.registry.transition(&abbr, next, update).await {
                Ok(_) => {
                    info!("neuron::reconcile: {abbr} {} -> {next}", record.status);
                    bucket.push(abbr);
                }
                Err(e) => {
                    warn!("neuron::reconcile: cannot relabel {abbr}: {e}");
                    report.errors += 1;
                }
            }
        }
    }

    async fn reverse_pass(&self, report: &mut ReconcileReport) {
        let workers = match self.runtime.list(&self.container_prefix).await {
            Ok(workers) => workers,
            Err(e) => {
                warn!("neuron::reconcile: cannot list workers: {e}");
                report.errors += 1;
                return;
            }
        };

        for worker in workers.iter().filter(|w| w.state == WorkerState::Running) {
            let Some(abbr) = self.abbr_of(worker) else {
                warn!("neuron::reconcile: ignoring worker {} with unusable name", worker.name);
                continue;
            };
            match self.registry.get(&abbr).await {
                Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(e) => {
                    warn!("neuron::reconcile: cannot read record for {abbr}: {e}");
                    report.errors += 1;
                    continue;
                }
            }

            match self.adopt(&abbr, worker).await {
                Ok(record) => {
                    info!(
                        "neuron::reconcile: adopted worker {} as {abbr} on port {}",
                        worker.name, record.port
                    );
                    report.adopted.push(abbr);
                }
                Err(e) => {
                    warn!("neuron::reconcile: cannot adopt {}: {e}", worker.name);
                    report.errors += 1;
                }
            }
        }
    }

    fn abbr_of(&self, worker: &WorkerInfo) -> Option<String> {
        let abbr = worker
            .labels
            .get(labels::ABBR)
            .cloned()
            .or_else(|| worker.name.strip_prefix(&self.container_prefix).map(str::to_string))?;
        validate_abbr(&abbr).ok()?;
        Some(abbr)
    }

    async fn adopt(
        &self,
        abbr: &str,
        worker: &WorkerInfo,
    ) -> Result<ModelRecord, RegistryError> {
        let label = |key: &str| worker.labels.get(key).filter(|v| !v.is_empty());

        let port = match label(labels::PORT).and_then(|p| p.parse().ok()) {
            Some(port) => port,
            None => {
                let active = self.registry.list_active().await?;
                next_free_port(&active, self.port_base).unwrap_or(self.port_base)
            }
        };
        let record = ModelRecord {
            abbr: abbr.to_string(),
            name: label(labels::NAME).cloned().unwrap_or_else(|| abbr.to_string()),
            model_type: label(labels::TYPE)
                .and_then(|t| t.parse().ok())
                .unwrap_or(ModelType::Llm),
            quantization: None,
            port,
            gpu_device: label(labels::GPU).and_then(|g| g.parse().ok()).unwrap_or(0),
            max_model_len: DEFAULT_MAX_MODEL_LEN,
            gpu_memory_utilization: DEFAULT_GPU_MEMORY_UTILIZATION,
            max_num_seqs: DEFAULT_MAX_NUM_SEQS,
            status: ModelStatus::Running,
            progress: None,
            progress_message: None,
            container_id: Some(worker.id.clone()).filter(|id| !id.is_empty()),
        };
        self.registry.put(&record).await?;
        Ok(record)
    }
}
