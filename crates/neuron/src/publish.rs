// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Routing publication.
//!
//! A publisher receives the full set of `running` records every time a
//! worker settles into or out of `running`. What it does with them (rewrite
//! a proxy config, push to a gateway) is up to the implementation.

use anyhow::Result;
use async_trait::async_trait;
use cache::JsonStore;
use protocol::{ModelRecord, ModelType};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::registry::ModelRegistry;

#[async_trait]
pub trait RoutePublisher: Send + Sync {
    async fn publish(&self, running: &[ModelRecord]) -> Result<()>;
}

/// One upstream entry of the route table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub abbr: String,
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    /// public path prefix, e.g. `/api/v1/phi`.
    pub endpoint: String,
    /// `host:port` the proxy forwards to.
    pub upstream: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTable {
    pub routes: Vec<Route>,
}

impl RouteTable {
    pub fn from_records(running: &[ModelRecord], upstream_host: &str) -> Self {
        Self {
            routes: running
                .iter()
                .map(|r| Route {
                    abbr: r.abbr.clone(),
                    name: r.name.clone(),
                    model_type: r.model_type,
                    endpoint: r.endpoint(),
                    upstream: format!("{upstream_host}:{}", r.port),
                })
                .collect(),
        }
    }
}

/// Logs the route table; for hosts without a proxy in front.
#[derive(Debug, Clone, Default)]
pub struct LogPublisher;

#[async_trait]
impl RoutePublisher for LogPublisher {
    async fn publish(&self, running: &[ModelRecord]) -> Result<()> {
        info!("neuron::publish: {} running model(s)", running.len());
        for r in running {
            info!(
                "neuron::publish: {} -> port {} ({}, gpu {})",
                r.endpoint(),
                r.port,
                r.name,
                r.gpu_device
            );
        }
        Ok(())
    }
}

/// Writes the route table as JSON for an external proxy to pick up.
pub struct JsonRoutePublisher {
    store: JsonStore,
    upstream_host: String,
}

impl JsonRoutePublisher {
    pub fn new(store: JsonStore, upstream_host: impl Into<String>) -> Self {
        Self {
            store,
            upstream_host: upstream_host.into(),
        }
    }

    pub fn store(&self) -> &JsonStore {
        &self.store
    }
}

#[async_trait]
impl RoutePublisher for JsonRoutePublisher {
    async fn publish(&self, running: &[ModelRecord]) -> Result<()> {
        let table = RouteTable::from_records(running, &self.upstream_host);
        self.store.save(&table)?;
        info!(
            "neuron::publish: wrote {} route(s) to {}",
            table.routes.len(),
            self.store.path().display()
        );
        Ok(())
    }
}

/// Publish the current `running` set; failures are logged, never returned.
pub async fn publish_running(registry: &ModelRegistry, publisher: &dyn RoutePublisher) {
    let running = match registry.list_with_status(protocol::ModelStatus::Running).await {
        Ok(running) => running,
        Err(e) => {
            warn!("neuron::publish: cannot list running models: {e}");
            return;
        }
    };
    if let Err(e) = publisher.publish(&running).await {
        warn!("neuron::publish: route publication failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;
    use protocol::ModelStatus;
    use std::fs;

    #[tokio::test]
    async fn json_publisher_writes_route_table() {
        let dir = std::env::temp_dir().join(format!("neuron-routes-{}", std::process::id()));
        let store = JsonStore::with_root(&dir, "routes").unwrap();
        let publisher = JsonRoutePublisher::new(store, "10.0.0.5");

        publisher
            .publish(&[record("phi", 8100, ModelStatus::Running)])
            .await
            .unwrap();

        let table: RouteTable = publisher.store().load_or_default().unwrap();
        assert_eq!(table.routes.len(), 1);
        assert_eq!(table.routes[0].endpoint, "/api/v1/phi");
        assert_eq!(table.routes[0].upstream, "10.0.0.5:8100");

        publisher.publish(&[]).await.unwrap();
        let table: RouteTable = publisher.store().load_or_default().unwrap();
        assert!(table.routes.is_empty());

        fs::remove_dir_all(dir).ok();
    }
}
