// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::container::{
    ContainerRuntime, RuntimeError, WorkerHandle, WorkerInfo, WorkerSpec, WorkerState,
};

/// Caps every call on the wrapped runtime at a fixed duration.
///
/// An elapsed call is reported as [`RuntimeError::Timeout`]; the inner
/// future is dropped.
pub struct TimedRuntime<R> {
    inner: R,
    limit: Duration,
}

impl<R> TimedRuntime<R> {
    pub fn new(inner: R, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    async fn guard<T, F>(&self, op: &'static str, fut: F) -> Result<T, RuntimeError>
    where
        F: Future<Output = Result<T, RuntimeError>>,
    {
        tokio::time::timeout(self.limit, fut)
            .await
            .map_err(|_| RuntimeError::Timeout {
                op,
                after: self.limit,
            })?
    }
}

#[async_trait]
impl<R: ContainerRuntime> ContainerRuntime for TimedRuntime<R> {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.guard("ping", self.inner.ping()).await
    }

    async fn run(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RuntimeError> {
        self.guard("run", self.inner.run(spec)).await
    }

    async fn stop(&self, target: &str) -> Result<(), RuntimeError> {
        self.guard("stop", self.inner.stop(target)).await
    }

    async fn remove(&self, target: &str, force: bool) -> Result<(), RuntimeError> {
        self.guard("remove", self.inner.remove(target, force)).await
    }

    async fn status(&self, target: &str) -> Result<WorkerState, RuntimeError> {
        self.guard("status", self.inner.status(target)).await
    }

    async fn logs(&self, target: &str, tail: usize) -> Result<String, RuntimeError> {
        self.guard("logs", self.inner.logs(target, tail)).await
    }

    async fn exists(&self, target: &str) -> Result<bool, RuntimeError> {
        self.guard("exists", self.inner.exists(target)).await
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<WorkerInfo>, RuntimeError> {
        self.guard("list", self.inner.list(name_prefix)).await
    }
}
