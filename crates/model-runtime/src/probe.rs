// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

/// Decides whether a worker listening on `port` can serve requests.
///
/// Probes never fail: anything other than a positive answer is "not yet".
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, port: u16) -> bool;
}

/// `GET http://{host}:{port}{path}`; ready on `200 OK`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    host: String,
    path: String,
}

impl HttpProbe {
    pub fn new(host: impl Into<String>, path: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build readiness probe http client")?;
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Ok(Self {
            client,
            host: host.into(),
            path,
        })
    }

    pub fn url_for(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, self.path)
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn is_ready(&self, port: u16) -> bool {
        let url = self.url_for(port);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                debug!("neuron::probe: {url} not ready: {e}");
                false
            }
        }
    }
}
