// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Port and GPU placement.
//!
//! Both decisions are pure functions of the active record set (plus GPU
//! memory telemetry); nothing is reserved. Two deploys racing between
//! allocation and persistence can still pick the same port.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use model_runtime::{GpuDevice, GpuTelemetry, TelemetryError};
use protocol::ModelRecord;
use serde::Serialize;
use tracing::warn;

use crate::error::AllocationUnavailable;

/// Score added per active model on a device, in MiB-equivalents.
pub const MODEL_LOAD_PENALTY: u64 = 10_000;

/// Smallest port `>= base` not held by an active record.
pub fn next_free_port(active: &[ModelRecord], base: u16) -> Option<u16> {
    let used: BTreeSet<u16> = active
        .iter()
        .filter(|r| r.status.is_active())
        .map(|r| r.port)
        .collect();
    (base..=u16::MAX).find(|p| !used.contains(p))
}

/// The active record (other than `abbr`) currently holding `port`.
pub fn port_holder<'a>(active: &'a [ModelRecord], port: u16, abbr: &str) -> Option<&'a ModelRecord> {
    active
        .iter()
        .find(|r| r.status.is_active() && r.port == port && r.abbr != abbr)
}

/// `memory_used + MODEL_LOAD_PENALTY * active models` per reported device.
pub fn gpu_scores(memory_used: &BTreeMap<u32, u64>, active: &[ModelRecord]) -> BTreeMap<u32, u64> {
    let mut counts: BTreeMap<u32, u64> = BTreeMap::new();
    for record in active.iter().filter(|r| r.status.is_active()) {
        *counts.entry(record.gpu_device).or_default() += 1;
    }
    memory_used
        .iter()
        .map(|(&gpu, &used)| {
            let models = counts.get(&gpu).copied().unwrap_or(0);
            (gpu, used + MODEL_LOAD_PENALTY * models)
        })
        .collect()
}

/// Lowest score wins; ties go to the lowest index.
pub fn select_gpu(scores: &BTreeMap<u32, u64>) -> Option<u32> {
    scores
        .iter()
        .min_by_key(|&(&gpu, &score)| (score, gpu))
        .map(|(&gpu, _)| gpu)
}

/// Device statistics joined with the models placed on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuLoad {
    #[serde(flatten)]
    pub device: GpuDevice,
    pub models: Vec<String>,
    pub score: u64,
}

#[derive(Clone)]
pub struct Allocator {
    port_base: u16,
    telemetry: Arc<dyn GpuTelemetry>,
}

impl Allocator {
    pub fn new(port_base: u16, telemetry: Arc<dyn GpuTelemetry>) -> Self {
        Self {
            port_base,
            telemetry,
        }
    }

    pub fn port_base(&self) -> u16 {
        self.port_base
    }

    pub fn next_port(&self, active: &[ModelRecord]) -> Option<u16> {
        next_free_port(active, self.port_base)
    }

    /// Least loaded device; GPU 0 when telemetry is unavailable.
    pub async fn pick_gpu(&self, active: &[ModelRecord]) -> u32 {
        let unavailable = match self.telemetry.memory_used().await {
            Ok(used) => match select_gpu(&gpu_scores(&used, active)) {
                Some(gpu) => return gpu,
                None => AllocationUnavailable("no devices reported".into()),
            },
            Err(e) => AllocationUnavailable(e.to_string()),
        };
        warn!("neuron::allocator: {unavailable}");
        0
    }

    /// Per-device statistics, assigned models and placement score.
    pub async fn report(&self, active: &[ModelRecord]) -> Result<Vec<GpuLoad>, TelemetryError> {
        let devices = self.telemetry.devices().await?;
        let used = devices.iter().map(|d| (d.index, d.memory_used_mb)).collect();
        let scores = gpu_scores(&used, active);
        Ok(devices
            .into_iter()
            .map(|device| GpuLoad {
                models: active
                    .iter()
                    .filter(|r| r.status.is_active() && r.gpu_device == device.index)
                    .map(|r| r.abbr.clone())
                    .collect(),
                score: scores
                    .get(&device.index)
                    .copied()
                    .unwrap_or(device.memory_used_mb),
                device,
            })
            .collect())
    }
}
