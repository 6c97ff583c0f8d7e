// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Periodic crash detection for workers that already reached `running`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use model_runtime::{ContainerRuntime, RuntimeError};
use protocol::ModelStatus;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::deploy::diagnose;
use crate::launch::container_name;
use crate::publish::{publish_running, RoutePublisher};
use crate::registry::{ModelRegistry, RecordUpdate};
use crate::tasks::DeploymentTasks;

#[derive(Clone)]
pub struct CrashWatchdog {
    registry: ModelRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    publisher: Arc<dyn RoutePublisher>,
    tasks: DeploymentTasks,
    container_prefix: String,
}

impl CrashWatchdog {
    pub fn new(
        registry: ModelRegistry,
        runtime: Arc<dyn ContainerRuntime>,
        publisher: Arc<dyn RoutePublisher>,
        tasks: DeploymentTasks,
        container_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            runtime,
            publisher,
            tasks,
            container_prefix: container_prefix.into(),
        }
    }

    /// Check every `running` record once; returns the abbrs moved to `error`.
    pub async fn sweep(&self) -> Vec<String> {
        let running = match self.registry.list_with_status(ModelStatus::Running).await {
            Ok(running) => running,
            Err(e) => {
                warn!("neuron::monitor: cannot list running models: {e}");
                return Vec::new();
            }
        };

        // an attempt still in its grace period owns the record.
        let running: Vec<_> = running
            .into_iter()
            .filter(|r| !self.tasks.is_active(&r.abbr))
            .collect();
        let probes = running.iter().map(|record| async move {
            let container = container_name(&self.container_prefix, &record.abbr);
            let state = self.runtime.status(&container).await;
            (container, state)
        });
        let observed = join_all(probes).await;

        let mut crashed = Vec::new();
        for (record, (container, status)) in running.into_iter().zip(observed) {
            let state = match status {
                Ok(state) if state.is_terminal() => Some(state),
                Ok(_) => continue,
                Err(RuntimeError::NotFound(_)) => None,
                Err(e) => {
                    debug!("neuron::monitor: skipping {}: {e}", record.abbr);
                    continue;
                }
            };

            let kind = diagnose(self.runtime.as_ref(), &container, state).await;
            let update = RecordUpdate::new()
                .progress(0)
                .message(format!("Worker crashed: {kind}"));
            match self
                .registry
                .transition(&record.abbr, ModelStatus::Error, update)
                .await
            {
                Ok(_) => {
                    warn!("neuron::monitor: {} crashed ({kind})", record.abbr);
                    crashed.push(record.abbr);
                }
                Err(e) => warn!("neuron::monitor: cannot mark {} as crashed: {e}", record.abbr),
            }
        }

        if !crashed.is_empty() {
            publish_running(&self.registry, self.publisher.as_ref()).await;
        }
        crashed
    }

    /// Sweep every `interval` until the returned handle is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        info!("neuron::monitor: checking running workers every {interval:?}");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately; reconcile just covered it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}
