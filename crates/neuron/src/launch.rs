// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Turning a model record into a concrete worker container.

use std::collections::BTreeMap;

use config::WorkerConfig;
use model_runtime::{GpuRequest, Mount, PortMapping, RestartPolicy, WorkerSpec};
use protocol::{DeployRequest, ModelCatalog, ModelRecord, ModelType};

/// Container labels carrying enough identity to rebuild a record.
pub mod labels {
    pub const ABBR: &str = "model.abbr";
    pub const NAME: &str = "model.name";
    pub const TYPE: &str = "model.type";
    pub const GPU: &str = "model.gpu";
    pub const PORT: &str = "model.port";
}

const QUANTIZED: &[&str] = &["awq", "gptq"];
/// name fragments of models small enough to skip CUDA graph capture.
const SMALL_MODELS: &[&str] = &["1.5b", "3b"];

/// Serving knobs handed to the inference server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServingSettings {
    pub gpu_memory_utilization: f64,
    pub max_model_len: u32,
    pub max_num_seqs: u32,
    pub quantization: Option<String>,
}

/// Settings for a request: catalog recommendations when the model is known,
/// otherwise size heuristics on top of the requested values.
pub fn resolve_settings(request: &DeployRequest, catalog: &ModelCatalog) -> ServingSettings {
    let requested = ServingSettings {
        gpu_memory_utilization: request.gpu_memory_utilization,
        max_model_len: request.max_model_len,
        max_num_seqs: request.max_num_seqs,
        quantization: request.quantization(),
    };

    if let Some(entry) = catalog.lookup(&request.abbr, &request.name) {
        let recommended = &entry.recommended_settings;
        return ServingSettings {
            gpu_memory_utilization: recommended
                .gpu_memory_utilization
                .unwrap_or(requested.gpu_memory_utilization),
            max_model_len: entry.max_model_len.unwrap_or(requested.max_model_len),
            max_num_seqs: recommended.max_num_seqs.unwrap_or(requested.max_num_seqs),
            quantization: entry
                .quantization
                .as_deref()
                .map(str::to_lowercase)
                .filter(|q| !q.is_empty() && q != "none")
                .or(requested.quantization),
        };
    }

    let name = request.name.to_lowercase();
    let (util, len, seqs) = if is_quantized(requested.quantization.as_deref()) {
        (0.25, 2048, 256)
    } else if request.model_type == ModelType::Embedding {
        (0.05, 512, 1024)
    } else if name.contains("7b") {
        (0.5, 4096, 128)
    } else if name.contains("13b") {
        (0.7, 4096, 64)
    } else {
        return requested;
    };
    ServingSettings {
        gpu_memory_utilization: util,
        max_model_len: len,
        max_num_seqs: seqs,
        quantization: requested.quantization,
    }
}

fn is_quantized(quantization: Option<&str>) -> bool {
    quantization.is_some_and(|q| QUANTIZED.contains(&q))
}

pub fn container_name(prefix: &str, abbr: &str) -> String {
    format!("{prefix}{abbr}")
}

/// Arguments for the `vllm/vllm-openai` entrypoint.
pub fn vllm_args(record: &ModelRecord, download_dir: &str, container_port: u16) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        record.name.clone(),
        "--served-model-name".into(),
        record.abbr.clone(),
        "--max-model-len".into(),
        record.max_model_len.to_string(),
        "--gpu-memory-utilization".into(),
        record.gpu_memory_utilization.to_string(),
        "--max-num-seqs".into(),
        record.max_num_seqs.to_string(),
        "--port".into(),
        container_port.to_string(),
        "--host".into(),
        "0.0.0.0".into(),
        "--download-dir".into(),
        download_dir.to_string(),
    ];

    if let Some(q) = &record.quantization {
        args.push("--quantization".into());
        args.push(q.clone());
    }

    let name = record.name.to_lowercase();
    let eager = is_quantized(record.quantization.as_deref())
        || SMALL_MODELS.iter().any(|s| name.contains(s));
    if eager {
        args.push("--enforce-eager".into());
    } else if record.model_type == ModelType::Llm {
        args.push("--enable-prefix-caching".into());
        args.push("--enable-chunked-prefill".into());
    }
    args
}

/// Full container description for `record`.
pub fn worker_spec(worker: &WorkerConfig, record: &ModelRecord) -> WorkerSpec {
    let gpu = record.gpu_device.to_string();
    let mut env = vec![
        ("CUDA_VISIBLE_DEVICES".to_string(), gpu.clone()),
        ("NVIDIA_VISIBLE_DEVICES".to_string(), gpu.clone()),
    ];
    if let Some(token) = &worker.hf_token {
        env.push(("HF_TOKEN".into(), token.clone()));
        env.push(("HUGGING_FACE_HUB_TOKEN".into(), token.clone()));
    }

    let labels = BTreeMap::from([
        (labels::ABBR.to_string(), record.abbr.clone()),
        (labels::NAME.to_string(), record.name.clone()),
        (labels::TYPE.to_string(), record.model_type.to_string()),
        (labels::GPU.to_string(), gpu),
        (labels::PORT.to_string(), record.port.to_string()),
    ]);

    WorkerSpec {
        name: container_name(&worker.container_prefix, &record.abbr),
        image: worker.image.clone(),
        command: vllm_args(record, &worker.download_dir, worker.container_port),
        env,
        mounts: vec![
            Mount {
                host: worker.host_models_dir.clone(),
                container: worker.models_mount.clone(),
                read_only: false,
            },
            Mount {
                host: worker.host_cache_dir.clone(),
                container: worker.cache_mount.clone(),
                read_only: false,
            },
        ],
        network: worker.network.clone(),
        gpus: GpuRequest::All,
        restart: RestartPolicy::UnlessStopped,
        ports: vec![PortMapping {
            host: record.port,
            container: worker.container_port,
        }],
        labels,
    }
}
