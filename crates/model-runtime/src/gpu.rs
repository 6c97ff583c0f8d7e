// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("gpu telemetry unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected gpu telemetry output: {0}")]
    Malformed(String),
}

/// Point-in-time statistics of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
    pub utilization_percent: u32,
    pub temperature_celsius: u32,
}

/// Source of per-device statistics.
#[async_trait]
pub trait GpuTelemetry: Send + Sync {
    /// Every visible device, ordered by index.
    async fn devices(&self) -> Result<Vec<GpuDevice>, TelemetryError>;

    /// Memory in use, in MiB, keyed by device index.
    async fn memory_used(&self) -> Result<BTreeMap<u32, u64>, TelemetryError> {
        Ok(self
            .devices()
            .await?
            .into_iter()
            .map(|d| (d.index, d.memory_used_mb))
            .collect())
    }
}

/// Reads device statistics from `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    bin: String,
    timeout: Duration,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new("nvidia-smi", Duration::from_secs(10))
    }
}

impl NvidiaSmi {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }
}

const QUERY: &str =
    "--query-gpu=index,name,memory.used,memory.total,memory.free,utilization.gpu,temperature.gpu";

/// `[N/A]` and friends parse as `None`.
fn number<T: std::str::FromStr>(col: &str, line: &str) -> Result<Option<T>, TelemetryError> {
    if col.starts_with('[') {
        return Ok(None);
    }
    col.parse()
        .map(Some)
        .map_err(|_| TelemetryError::Malformed(line.to_string()))
}

/// Parse rows of [`QUERY`] (`--format=csv,noheader,nounits`).
///
/// Unreported memory counts as idle; unreported free memory is derived
/// from total and used.
pub fn parse_gpu_csv(text: &str) -> Result<Vec<GpuDevice>, TelemetryError> {
    let mut devices = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let cols: Vec<&str> = line.split(',').map(str::trim).collect();
        let [index, name, used, total, free, util, temp] = cols[..] else {
            return Err(TelemetryError::Malformed(line.to_string()));
        };
        let index: u32 = number(index, line)?.ok_or_else(|| TelemetryError::Malformed(line.to_string()))?;
        let memory_used_mb: u64 = number(used, line)?.unwrap_or(0);
        let memory_total_mb: u64 = number(total, line)?.unwrap_or(0);
        devices.push(GpuDevice {
            index,
            name: name.to_string(),
            memory_used_mb,
            memory_total_mb,
            memory_free_mb: number(free, line)?
                .unwrap_or_else(|| memory_total_mb.saturating_sub(memory_used_mb)),
            utilization_percent: number(util, line)?.unwrap_or(0),
            temperature_celsius: number(temp, line)?.unwrap_or(0),
        });
    }
    devices.sort_by_key(|d| d.index);
    Ok(devices)
}

#[async_trait]
impl GpuTelemetry for NvidiaSmi {
    async fn devices(&self) -> Result<Vec<GpuDevice>, TelemetryError> {
        let run = Command::new(&self.bin)
            .args([QUERY, "--format=csv,noheader,nounits"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                TelemetryError::Unavailable(format!("{} timed out after {:?}", self.bin, self.timeout))
            })?
            .map_err(|e| TelemetryError::Unavailable(format!("failed to run {}: {e}", self.bin)))?;
        if !output.status.success() {
            return Err(TelemetryError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_gpu_csv(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_rows() {
        let devices = parse_gpu_csv(
            "1, NVIDIA RTX A6000, 1000, 49140, 48140, 3, 41\n0, NVIDIA RTX A6000, 8000, 49140, 41140, 97, 70\n",
        )
        .unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[0].name, "NVIDIA RTX A6000");
        assert_eq!(devices[0].memory_free_mb, 41140);
        assert_eq!(devices[0].utilization_percent, 97);
        assert_eq!(devices[1].temperature_celsius, 41);
    }

    #[test]
    fn unreported_columns_fall_back() {
        let devices = parse_gpu_csv("2, GRID T4, [N/A], 15360, [N/A], [N/A], [N/A]").unwrap();
        let d = &devices[0];
        assert_eq!(d.memory_used_mb, 0);
        assert_eq!(d.memory_free_mb, 15360);
        assert_eq!(d.utilization_percent, 0);
        assert_eq!(d.temperature_celsius, 0);
    }

    #[test]
    fn empty_output_means_no_devices() {
        assert!(parse_gpu_csv("\n").unwrap().is_empty());
    }

    #[test]
    fn malformed_rows_are_rejected() {
        assert!(parse_gpu_csv("0, 100").is_err());
        assert!(parse_gpu_csv("gpu0, A6000, 1, 2, 3, 4, 5").is_err());
        assert!(parse_gpu_csv("[N/A], A6000, 1, 2, 3, 4, 5").is_err());
    }

    struct Fixed(Vec<GpuDevice>);

    #[async_trait]
    impl GpuTelemetry for Fixed {
        async fn devices(&self) -> Result<Vec<GpuDevice>, TelemetryError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn memory_used_is_keyed_by_index() {
        let devices = parse_gpu_csv("0, A, 8000, 9000, 1000, 0, 0\n1, B, 1000, 9000, 8000, 0, 0").unwrap();
        let used = Fixed(devices).memory_used().await.unwrap();
        assert_eq!(used, BTreeMap::from([(0, 8000), (1, 1000)]));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let smi = NvidiaSmi::new("/nonexistent/nvidia-smi", Duration::from_secs(1));
        assert!(matches!(
            smi.memory_used().await,
            Err(TelemetryError::Unavailable(_))
        ));
    }
}
