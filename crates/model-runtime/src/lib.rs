// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Capabilities neuron needs from the outside world, each behind a trait so
//! the supervisor can be driven by fakes in tests:
//!
//! - [`ContainerRuntime`]: launch, inspect and tear down worker containers.
//!   [`DockerCli`] shells out to the `docker` binary; [`TimedRuntime`] puts a
//!   caller-side ceiling on every call.
//! - [`ReadinessProbe`]: decides when a launched worker can serve.
//!   [`HttpProbe`] issues `GET <health path>` against the worker port.
//! - [`GpuTelemetry`]: per-device memory, utilisation and temperature for
//!   placement decisions and reporting. [`NvidiaSmi`] reads it from
//!   `nvidia-smi`.
//! - [`scan_hub_cache`]: which models already have weights in the host's
//!   Hugging Face cache.

pub mod container;
pub mod docker;
pub mod gpu;
pub mod hub;
pub mod probe;
pub mod timeout;

pub use container::{
    ContainerRuntime, GpuRequest, Mount, PortMapping, RestartPolicy, RuntimeError, WorkerHandle,
    WorkerInfo, WorkerSpec, WorkerState,
};
pub use docker::DockerCli;
pub use gpu::{GpuDevice, GpuTelemetry, NvidiaSmi, TelemetryError};
pub use hub::{scan_hub_cache, CachedModel};
pub use probe::{HttpProbe, ReadinessProbe};
pub use timeout::TimedRuntime;
