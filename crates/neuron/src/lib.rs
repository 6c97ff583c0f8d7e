// SPDX-License-Identifier: PolyForm-Shield-1.0

//! GPU worker deployment supervisor.
//!
//! A neuron node turns deploy requests into containerised inference workers
//! on the local GPUs, tracks each worker's lifecycle in a [`ModelRegistry`]
//! and publishes the set of serving workers to a routing layer.

use std::sync::Arc;

use anyhow::{Context, Result};
use cache::{HashStore, JsonHashStore, JsonStore, MemoryHashStore};
use config::{NeuronConfig, PublisherKind, StoreBackend};
use model_runtime::{DockerCli, HttpProbe, NvidiaSmi, TimedRuntime};
use tracing::{info, warn};

pub mod allocator;
pub mod api;
pub mod deploy;
pub mod error;
pub mod launch;
pub mod monitor;
pub mod publish;
pub mod reconcile;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{CrashKind, RegistryError, SupervisorError};
pub use registry::ModelRegistry;
pub use supervisor::{AvailableModel, Collaborators, ModelView, Settings, Supervisor};

use deploy::DeployTiming;
use publish::{JsonRoutePublisher, LogPublisher, RoutePublisher};

const ROUTES_STORE: &str = "routes";
const STATE_DIR: &str = "state";

async fn open_store(config: &NeuronConfig) -> Result<Arc<dyn HashStore>> {
    let store = &config.store;
    match store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryHashStore::new())),
        StoreBackend::Json => {
            let dir = match &store.path {
                Some(path) => path.clone(),
                None => cache::neuron_cache_root()?.join(STATE_DIR),
            };
            let hashes = JsonHashStore::open(&dir)
                .with_context(|| format!("failed to open state store at {}", dir.display()))?;
            info!("neuron: state store at {}", dir.display());
            Ok(Arc::new(hashes))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = store
                .redis_url
                .as_deref()
                .context("store.redis_url is required for the redis backend")?;
            let redis = cache::RedisHashStore::connect(url)
                .await
                .with_context(|| format!("failed to connect to redis at {url}"))?;
            info!("neuron: state store at {url}");
            Ok(Arc::new(redis))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => anyhow::bail!("this build has no redis support (enable the `redis` feature)"),
    }
}

fn open_publisher(config: &NeuronConfig) -> Result<Arc<dyn RoutePublisher>> {
    let publisher = &config.publisher;
    Ok(match publisher.kind {
        PublisherKind::Log => Arc::new(LogPublisher),
        PublisherKind::Json => {
            let store = match &publisher.path {
                Some(path) => JsonStore::at_path(path.clone()),
                None => JsonStore::new(ROUTES_STORE)?,
            };
            info!("neuron: route table at {}", store.path().display());
            Arc::new(JsonRoutePublisher::new(store, publisher.upstream_host.clone()))
        }
    })
}

/// Wire a supervisor against the real collaborators named by `config`.
pub async fn build(config: &NeuronConfig) -> Result<Supervisor> {
    let runtime = TimedRuntime::new(
        DockerCli::new(config.runtime.docker_bin.clone()),
        config.runtime.call_timeout(),
    );
    let probe = HttpProbe::new(
        config.probe.host.clone(),
        config.probe.path.clone(),
        config.probe.timeout(),
    )?;

    let settings = Settings {
        port_base: config.allocator.port_base,
        timing: DeployTiming::from(&config.deploy),
        worker: config.worker.clone(),
        catalog: config.load_catalog()?,
    };
    if !settings.catalog.is_empty() {
        info!("neuron: {} catalog model(s) loaded", settings.catalog.len());
    }

    Ok(Supervisor::new(
        settings,
        Collaborators {
            store: open_store(config).await?,
            runtime: Arc::new(runtime),
            probe: Arc::new(probe),
            telemetry: Arc::new(NvidiaSmi::default()),
            publisher: open_publisher(config)?,
        },
    ))
}

/// Reconcile, start the crash watchdog and serve the management API until
/// a shutdown signal arrives.
pub async fn run(config: NeuronConfig) -> Result<()> {
    info!("starting neuron node: {:?}", config.node_id);

    let supervisor = build(&config).await?;
    if !supervisor.runtime_healthy().await {
        warn!("neuron: container runtime is not reachable yet; continuing");
    }

    supervisor.reconciler().run().await;

    let watchdog = config
        .monitor
        .interval()
        .map(|interval| supervisor.watchdog().spawn(interval));

    let served = api::serve(config.server.listen, supervisor, shutdown::wait_for_signal()).await;

    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    served
}
