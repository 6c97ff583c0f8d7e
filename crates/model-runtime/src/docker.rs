// SPDX-License-Identifier: PolyForm-Shield-1.0

//! [`ContainerRuntime`] backed by the `docker` command line client.
//!
//! Every call spawns one short-lived `docker` process. Children are created
//! with `kill_on_drop`, so wrapping a call in a timeout (see
//! [`crate::TimedRuntime`]) also reaps the client process.

use std::collections::BTreeMap;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::container::{
    ContainerRuntime, GpuRequest, RuntimeError, WorkerHandle, WorkerInfo, WorkerSpec, WorkerState,
};

#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn invoke(&self, args: &[String]) -> Result<Output, RuntimeError> {
        debug!("neuron::docker: {} {}", self.bin, args.join(" "));
        Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("failed to spawn {}: {e}", self.bin)))
    }

    /// Run one client command and return its stdout.
    async fn exec(
        &self,
        op: &'static str,
        target: &str,
        args: &[String],
    ) -> Result<String, RuntimeError> {
        let output = self.invoke(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(op, target, &stderr))
        }
    }
}

/// Map client stderr onto the error kinds callers branch on.
fn classify_failure(op: &'static str, target: &str, stderr: &str) -> RuntimeError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container") || lower.contains("no such object") {
        RuntimeError::NotFound(target.to_string())
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("permission denied while trying to connect")
    {
        RuntimeError::Unavailable(stderr.trim().to_string())
    } else {
        RuntimeError::Rejected {
            op,
            message: stderr.trim().to_string(),
        }
    }
}

/// Translate a [`WorkerSpec`] into `docker run` arguments.
fn run_args(spec: &WorkerSpec) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--name".into(), spec.name.clone()];

    if let Some(network) = &spec.network {
        args.push("--network".into());
        args.push(network.clone());
    }
    args.push("--restart".into());
    args.push(spec.restart.as_str().into());

    match &spec.gpus {
        GpuRequest::None => {}
        GpuRequest::All => {
            args.push("--gpus".into());
            args.push("all".into());
        }
        GpuRequest::Devices(ids) => {
            let ids: Vec<String> = ids.iter().map(u32::to_string).collect();
            args.push("--gpus".into());
            args.push(format!("\"device={}\"", ids.join(",")));
        }
    }

    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        let mode = if mount.read_only { "ro" } else { "rw" };
        args.push("-v".into());
        args.push(format!("{}:{}:{mode}", mount.host.display(), mount.container));
    }
    for port in &spec.ports {
        args.push("-p".into());
        args.push(format!("{}:{}", port.host, port.container));
    }
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_ps(stdout: &str, name_prefix: &str) -> Result<Vec<WorkerInfo>, RuntimeError> {
    let mut workers = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let row: PsLine = serde_json::from_str(line)
            .map_err(|e| RuntimeError::Malformed(format!("docker ps line {line:?}: {e}")))?;
        // the name filter is a substring match; keep only true prefixes.
        let Some(name) = row
            .names
            .split(',')
            .map(|n| n.trim().trim_start_matches('/'))
            .find(|n| n.starts_with(name_prefix))
        else {
            continue;
        };
        workers.push(WorkerInfo {
            id: row.id,
            name: name.to_string(),
            state: WorkerState::parse(&row.state),
            labels: parse_labels(&row.labels),
        });
    }
    workers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(workers)
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let args = vec![
            "version".into(),
            "--format".into(),
            "{{.Server.Version}}".into(),
        ];
        let version = self.exec("ping", "", &args).await?;
        debug!("neuron::docker: daemon version {}", version.trim());
        Ok(())
    }

    async fn run(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RuntimeError> {
        info!(
            "neuron::docker: launching {} from image {}",
            spec.name, spec.image
        );
        let stdout = self.exec("run", &spec.name, &run_args(spec)).await?;
        Ok(WorkerHandle {
            id: stdout.trim().to_string(),
            name: spec.name.clone(),
        })
    }

    async fn stop(&self, target: &str) -> Result<(), RuntimeError> {
        self.exec("stop", target, &["stop".into(), target.into()])
            .await
            .map(drop)
    }

    async fn remove(&self, target: &str, force: bool) -> Result<(), RuntimeError> {
        let mut args: Vec<String> = vec!["rm".into()];
        if force {
            args.push("-f".into());
        }
        args.push(target.into());
        self.exec("remove", target, &args).await.map(drop)
    }

    async fn status(&self, target: &str) -> Result<WorkerState, RuntimeError> {
        let args = vec![
            "inspect".into(),
            "--type".into(),
            "container".into(),
            "-f".into(),
            "{{.State.Status}}".into(),
            target.into(),
        ];
        let stdout = self.exec("status", target, &args).await?;
        Ok(WorkerState::parse(&stdout))
    }

    async fn logs(&self, target: &str, tail: usize) -> Result<String, RuntimeError> {
        let args: Vec<String> = vec![
            "logs".into(),
            "--tail".into(),
            tail.to_string(),
            target.into(),
        ];
        let output = self.invoke(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("logs", target, &stderr));
        }
        // the client replays the container's stderr on its own stderr.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn exists(&self, target: &str) -> Result<bool, RuntimeError> {
        match self.status(target).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<WorkerInfo>, RuntimeError> {
        let args: Vec<String> = vec![
            "ps".into(),
            "-a".into(),
            "--no-trunc".into(),
            "--filter".into(),
            format!("name={name_prefix}"),
            "--format".into(),
            "{{json .}}".into(),
        ];
        let stdout = self.exec("list", name_prefix, &args).await?;
        parse_ps(&stdout, name_prefix)
    }
}
