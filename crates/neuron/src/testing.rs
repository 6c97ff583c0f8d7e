// SPDX-License-Identifier: PolyForm-Shield-1.0

//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use cache::MemoryHashStore;
use config::WorkerConfig;
use model_runtime::{
    ContainerRuntime, GpuDevice, GpuTelemetry, ReadinessProbe, RuntimeError, TelemetryError, WorkerHandle,
    WorkerInfo, WorkerSpec, WorkerState,
};
use protocol::{
    ModelCatalog, ModelRecord, ModelStatus, ModelType, DEFAULT_GPU_MEMORY_UTILIZATION,
    DEFAULT_MAX_MODEL_LEN, DEFAULT_MAX_NUM_SEQS,
};

use crate::deploy::DeployTiming;
use crate::publish::RoutePublisher;
use crate::registry::ModelRegistry;
use crate::supervisor::{Collaborators, Settings, Supervisor};

pub const PREFIX: &str = "neuron-model-";

/// Unique, not yet existing directory under the system temp dir.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    env::temp_dir().join(format!("neuron-{tag}-{nanos}"))
}

pub fn record(abbr: &str, port: u16, status: ModelStatus) -> ModelRecord {
    ModelRecord {
        abbr: abbr.to_string(),
        name: format!("org/{abbr}"),
        model_type: ModelType::Llm,
        quantization: None,
        port,
        gpu_device: 0,
        max_model_len: DEFAULT_MAX_MODEL_LEN,
        gpu_memory_utilization: DEFAULT_GPU_MEMORY_UTILIZATION,
        max_num_seqs: DEFAULT_MAX_NUM_SEQS,
        status,
        progress: None,
        progress_message: None,
        container_id: None,
    }
}

struct FakeWorker {
    id: String,
    state: WorkerState,
    labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct RuntimeState {
    workers: BTreeMap<String, FakeWorker>,
    scripts: HashMap<String, VecDeque<WorkerState>>,
    logs: HashMap<String, String>,
    unreachable: bool,
    refuse_runs: Option<String>,
    empty_ids: bool,
    status_delay: Option<Duration>,
    calls: Vec<String>,
    next_id: u32,
}

/// Container runtime keeping workers in a map.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut RuntimeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_worker(&self, name: &str, state: WorkerState, labels: BTreeMap<String, String>) {
        self.with(|s| {
            s.next_id += 1;
            let id = format!("ctr-{}", s.next_id);
            s.workers
                .insert(name.to_string(), FakeWorker { id, state, labels });
        });
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.with(|s| s.unreachable = unreachable);
    }

    /// Successive `status` answers for `name`; the last one sticks.
    pub fn script_status(&self, name: &str, states: Vec<WorkerState>) {
        self.with(|s| {
            s.scripts.insert(name.to_string(), states.into());
        });
    }

    pub fn set_logs(&self, name: &str, logs: &str) {
        self.with(|s| {
            s.logs.insert(name.to_string(), logs.to_string());
        });
    }

    pub fn refuse_runs(&self, message: &str) {
        self.with(|s| s.refuse_runs = Some(message.to_string()));
    }

    pub fn hand_out_empty_ids(&self) {
        self.with(|s| s.empty_ids = true);
    }

    /// Every `status` call takes `delay` before answering.
    pub fn slow_status(&self, delay: Duration) {
        self.with(|s| s.status_delay = Some(delay));
    }

    /// `"<op> <name>"` for every mutating call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn state_of(&self, name: &str) -> Option<WorkerState> {
        self.with(|s| s.workers.get(name).map(|w| w.state))
    }

    pub fn labels_of(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.with(|s| s.workers.get(name).map(|w| w.labels.clone()))
    }

    fn reachable(s: &RuntimeState) -> Result<(), RuntimeError> {
        if s.unreachable {
            Err(RuntimeError::Unavailable("daemon not running".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.with(|s| Self::reachable(s))
    }

    async fn run(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RuntimeError> {
        self.with(|s| {
            s.calls.push(format!("run {}", spec.name));
            Self::reachable(s)?;
            if let Some(message) = &s.refuse_runs {
                return Err(RuntimeError::Rejected {
                    op: "run",
                    message: message.clone(),
                });
            }
            if s.workers.contains_key(&spec.name) {
                return Err(RuntimeError::Rejected {
                    op: "run",
                    message: format!("name {} is already in use", spec.name),
                });
            }
            s.next_id += 1;
            let id = if s.empty_ids {
                String::new()
            } else {
                format!("ctr-{}", s.next_id)
            };
            s.workers.insert(
                spec.name.clone(),
                FakeWorker {
                    id: id.clone(),
                    state: WorkerState::Running,
                    labels: spec.labels.clone(),
                },
            );
            Ok(WorkerHandle {
                id,
                name: spec.name.clone(),
            })
        })
    }

    async fn stop(&self, target: &str) -> Result<(), RuntimeError> {
        self.with(|s| {
            s.calls.push(format!("stop {target}"));
            Self::reachable(s)?;
            match s.workers.get_mut(target) {
                Some(w) => {
                    w.state = WorkerState::Exited;
                    Ok(())
                }
                None => Err(RuntimeError::NotFound(target.to_string())),
            }
        })
    }

    async fn remove(&self, target: &str, _force: bool) -> Result<(), RuntimeError> {
        self.with(|s| {
            s.calls.push(format!("remove {target}"));
            Self::reachable(s)?;
            match s.workers.remove(target) {
                Some(_) => Ok(()),
                None => Err(RuntimeError::NotFound(target.to_string())),
            }
        })
    }

    async fn status(&self, target: &str) -> Result<WorkerState, RuntimeError> {
        if let Some(delay) = self.with(|s| s.status_delay) {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            Self::reachable(s)?;
            if let Some(script) = s.scripts.get_mut(target) {
                let next = if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().copied()
                };
                if let (Some(next), Some(w)) = (next, s.workers.get_mut(target)) {
                    w.state = next;
                }
            }
            s.workers
                .get(target)
                .map(|w| w.state)
                .ok_or_else(|| RuntimeError::NotFound(target.to_string()))
        })
    }

    async fn logs(&self, target: &str, _tail: usize) -> Result<String, RuntimeError> {
        self.with(|s| {
            Self::reachable(s)?;
            if !s.workers.contains_key(target) {
                return Err(RuntimeError::NotFound(target.to_string()));
            }
            Ok(s.logs.get(target).cloned().unwrap_or_default())
        })
    }

    async fn exists(&self, target: &str) -> Result<bool, RuntimeError> {
        self.with(|s| {
            Self::reachable(s)?;
            Ok(s.workers.contains_key(target))
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<WorkerInfo>, RuntimeError> {
        self.with(|s| {
            Self::reachable(s)?;
            Ok(s.workers
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(name, w)| WorkerInfo {
                    id: w.id.clone(),
                    name: name.clone(),
                    state: w.state,
                    labels: w.labels.clone(),
                })
                .collect())
        })
    }
}

/// Probe that turns ready on a given call.
pub struct FakeProbe {
    ready_on: Option<u32>,
    calls: AtomicU32,
}

impl FakeProbe {
    /// Ready from the `n`th call (1-based) on.
    pub fn ready_after(n: u32) -> Self {
        Self {
            ready_on: Some(n),
            calls: AtomicU32::new(0),
        }
    }

    pub fn never() -> Self {
        Self {
            ready_on: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn is_ready(&self, _port: u16) -> bool {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.ready_on.is_some_and(|n| call >= n)
    }
}

pub struct FakeTelemetry {
    used: Option<BTreeMap<u32, u64>>,
}

impl FakeTelemetry {
    pub fn with(used: BTreeMap<u32, u64>) -> Self {
        Self { used: Some(used) }
    }

    pub fn failing() -> Self {
        Self { used: None }
    }
}

pub const FAKE_GPU_MB: u64 = 49_140;

#[async_trait]
impl GpuTelemetry for FakeTelemetry {
    async fn devices(&self) -> Result<Vec<GpuDevice>, TelemetryError> {
        let used = self
            .used
            .as_ref()
            .ok_or_else(|| TelemetryError::Unavailable("nvidia-smi not found".into()))?;
        Ok(used
            .iter()
            .map(|(&index, &memory_used_mb)| GpuDevice {
                index,
                name: "NVIDIA RTX A6000".into(),
                memory_used_mb,
                memory_total_mb: FAKE_GPU_MB,
                memory_free_mb: FAKE_GPU_MB.saturating_sub(memory_used_mb),
                utilization_percent: 0,
                temperature_celsius: 40,
            })
            .collect())
    }
}

/// Remembers every published route set as sorted abbrs.
#[derive(Default)]
pub struct FakePublisher {
    published: Mutex<Vec<Vec<String>>>,
}

impl FakePublisher {
    pub fn calls(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn last(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RoutePublisher for FakePublisher {
    async fn publish(&self, running: &[ModelRecord]) -> Result<()> {
        let mut abbrs: Vec<String> = running.iter().map(|r| r.abbr.clone()).collect();
        abbrs.sort();
        self.published.lock().unwrap().push(abbrs);
        Ok(())
    }
}

/// A supervisor wired to fakes, with handles on each of them.
pub struct Harness {
    pub supervisor: Supervisor,
    pub registry: ModelRegistry,
    pub runtime: Arc<FakeRuntime>,
    pub probe: Arc<FakeProbe>,
    pub publisher: Arc<FakePublisher>,
}

impl Harness {
    pub fn new(probe: FakeProbe) -> Self {
        Self::with_telemetry(probe, FakeTelemetry::with(BTreeMap::from([(0, 1000), (1, 500)])))
    }

    pub fn with_telemetry(probe: FakeProbe, telemetry: FakeTelemetry) -> Self {
        Self::assemble(probe, telemetry, |_| {})
    }

    /// Default fakes with adjusted settings.
    pub fn configured(probe: FakeProbe, configure: impl FnOnce(&mut Settings)) -> Self {
        Self::assemble(
            probe,
            FakeTelemetry::with(BTreeMap::from([(0, 1000), (1, 500)])),
            configure,
        )
    }

    fn assemble(
        probe: FakeProbe,
        telemetry: FakeTelemetry,
        configure: impl FnOnce(&mut Settings),
    ) -> Self {
        let store = Arc::new(MemoryHashStore::new());
        let runtime = Arc::new(FakeRuntime::new());
        let probe = Arc::new(probe);
        let publisher = Arc::new(FakePublisher::default());
        let mut settings = Settings {
            port_base: 8100,
            timing: DeployTiming::default(),
            worker: WorkerConfig {
                container_prefix: PREFIX.to_string(),
                host_cache_dir: scratch_dir("no-cache"),
                ..WorkerConfig::default()
            },
            catalog: ModelCatalog::default(),
        };
        configure(&mut settings);
        let supervisor = Supervisor::new(
            settings,
            Collaborators {
                store: store.clone(),
                runtime: runtime.clone(),
                probe: probe.clone(),
                telemetry: Arc::new(telemetry),
                publisher: publisher.clone(),
            },
        );
        Self {
            registry: ModelRegistry::new(store),
            supervisor,
            runtime,
            probe,
            publisher,
        }
    }

    pub fn container(abbr: &str) -> String {
        format!("{PREFIX}{abbr}")
    }

    pub async fn status(&self, abbr: &str) -> ModelStatus {
        self.registry.require(abbr).await.unwrap().status
    }
}
