// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Configuration for a neuron supervisor node.
//!
//! Everything has a default, so an empty (or absent) TOML file yields a
//! working single-host setup:
//!
//! ```toml
//! node_id = "gpu-host-1"
//! catalog = "/etc/neuron/models.json"
//!
//! [server]
//! listen = "0.0.0.0:8001"
//!
//! [allocator]
//! port_base = 8100
//!
//! [deploy]
//! poll_interval_secs = 5
//! max_polls = 60
//!
//! [store]
//! backend = "json"          # json | memory | redis
//! path = "/var/lib/neuron/state"
//! ```

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use protocol::ModelCatalog;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NeuronConfig {
    pub node_id: Option<String>,
    /// optional path to a model catalog (`models.json`).
    pub catalog: Option<PathBuf>,
    pub server: ServerConfig,
    pub allocator: AllocatorConfig,
    pub deploy: DeployConfig,
    pub worker: WorkerConfig,
    pub runtime: RuntimeConfig,
    pub probe: ProbeConfig,
    pub store: StoreConfig,
    pub publisher: PublisherConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// address of the management api.
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8001)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// first host port handed out to workers.
    pub port_base: u16,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self { port_base: 8100 }
    }
}

/// Progress written while the runtime is creating the worker.
pub const STARTING_PROGRESS: u8 = 10;

/// Readiness polling budget and progress reporting.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub poll_interval_secs: u64,
    pub max_polls: u32,
    /// delay between reaching `running` and clearing progress fields.
    pub ready_grace_secs: u64,
    /// progress reported once the runtime accepted the launch; at least
    /// [`STARTING_PROGRESS`].
    pub launch_progress: u8,
    /// progress never exceeds this value before the worker is ready.
    pub progress_ceiling: u8,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_polls: 60,
            ready_grace_secs: 3,
            launch_progress: 30,
            progress_ceiling: 95,
        }
    }
}

impl DeployConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn ready_grace(&self) -> Duration {
        Duration::from_secs(self.ready_grace_secs)
    }
}

/// How worker containers are built.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub image: String,
    /// prefix marking containers owned by this node, followed by the abbr.
    pub container_prefix: String,
    pub network: Option<String>,
    /// port the serving process listens on inside the container.
    pub container_port: u16,
    pub host_models_dir: PathBuf,
    pub models_mount: String,
    pub host_cache_dir: PathBuf,
    pub cache_mount: String,
    /// weight download directory passed to the serving process.
    pub download_dir: String,
    /// falls back to the `HF_TOKEN` environment variable.
    pub hf_token: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            image: "vllm/vllm-openai:latest".into(),
            container_prefix: "neuron-model-".into(),
            network: None,
            container_port: 8000,
            host_models_dir: PathBuf::from("./models"),
            models_mount: "/models".into(),
            host_cache_dir: PathBuf::from("~/.cache"),
            cache_mount: "/root/.cache".into(),
            download_dir: "/root/.cache/huggingface/hub".into(),
            hf_token: None,
        }
    }
}

impl WorkerConfig {
    /// Hugging Face hub cache on the host, inside the mounted cache dir.
    pub fn hub_cache_dir(&self) -> PathBuf {
        self.host_cache_dir.join("huggingface").join("hub")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub docker_bin: String,
    /// ceiling for any single container runtime call.
    pub call_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            call_timeout_secs: 30,
        }
    }
}

impl RuntimeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// host the readiness probe dials; workers publish their port here.
    pub host: String,
    pub path: String,
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            path: "/health".into(),
            timeout_secs: 3,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Json,
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// directory for the json backend; defaults to the cache root.
    pub path: Option<PathBuf>,
    pub redis_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Json,
            path: None,
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherKind {
    /// log the route table only.
    Log,
    /// write the route table as JSON for an external proxy to pick up.
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub kind: PublisherKind,
    /// route table file for the json publisher; defaults to the cache root.
    pub path: Option<PathBuf>,
    /// host the proxy should dial for worker upstreams.
    pub upstream_host: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            kind: PublisherKind::Log,
            path: None,
            upstream_host: "127.0.0.1".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// 0 disables the crash watchdog.
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

/// Load, expand and validate a config file.
pub fn load_from_file(path: &Path) -> Result<NeuronConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config = parse(&text)
        .with_context(|| format!("invalid config file at {}", path.display()))?;
    Ok(config)
}

/// Load `path` when given, otherwise start from defaults.
pub fn load(path: Option<&Path>) -> Result<NeuronConfig> {
    match path {
        Some(path) => load_from_file(path),
        None => finish(NeuronConfig::default()),
    }
}

/// Parse TOML text into a finished config.
pub fn parse(text: &str) -> Result<NeuronConfig> {
    let config: NeuronConfig = toml::from_str(text).context("failed to parse TOML")?;
    finish(config)
}

fn finish(mut config: NeuronConfig) -> Result<NeuronConfig> {
    if config.worker.hf_token.is_none() {
        config.worker.hf_token = env::var("HF_TOKEN").ok().filter(|t| !t.is_empty());
    }
    config.worker.host_models_dir = expand_home(&config.worker.host_models_dir);
    config.worker.host_cache_dir = expand_home(&config.worker.host_cache_dir);
    config.validate()?;
    Ok(config)
}

impl NeuronConfig {
    pub fn validate(&self) -> Result<()> {
        let deploy = &self.deploy;
        if deploy.max_polls == 0 {
            bail!("deploy.max_polls must be at least 1");
        }
        if deploy.poll_interval_secs == 0 {
            bail!("deploy.poll_interval_secs must be at least 1");
        }
        if deploy.progress_ceiling > 100
            || deploy.launch_progress < STARTING_PROGRESS
            || deploy.launch_progress >= deploy.progress_ceiling
        {
            bail!(
                "deploy progress must satisfy {STARTING_PROGRESS} <= launch_progress < progress_ceiling <= 100 (got {} / {})",
                deploy.launch_progress,
                deploy.progress_ceiling
            );
        }
        if self.worker.container_prefix.is_empty() {
            bail!("worker.container_prefix must not be empty");
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            bail!("store.redis_url is required for the redis backend");
        }
        Ok(())
    }

    /// Load the model catalog, or an empty one when none is configured.
    pub fn load_catalog(&self) -> Result<ModelCatalog> {
        let Some(path) = &self.catalog else {
            return Ok(ModelCatalog::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read model catalog at {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse model catalog at {}", path.display()))
    }
}

/// Expand a leading `~` using `$HOME`; other paths are returned unchanged.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
