// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Models already downloaded into a Hugging Face hub cache.
//!
//! The hub stores each repository as `models--<org>--<name>/`, with one
//! directory per downloaded revision under `snapshots/`. A repository only
//! counts as cached once at least one snapshot exists.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const REPO_PREFIX: &str = "models--";
const SEPARATOR: &str = "--";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedModel {
    /// repository id, e.g. `Qwen/Qwen2.5-1.5B-Instruct`.
    pub name: String,
    pub cache_path: PathBuf,
    pub size_mb: f64,
}

/// `models--Qwen--Qwen2.5-1.5B-Instruct` -> `Qwen/Qwen2.5-1.5B-Instruct`.
pub fn repo_id(dir_name: &str) -> Option<String> {
    let parts: Vec<&str> = dir_name.strip_prefix(REPO_PREFIX)?.split(SEPARATOR).collect();
    if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(parts.join("/"))
}

fn has_snapshot(repo: &Path) -> bool {
    fs::read_dir(repo.join("snapshots")).is_ok_and(|mut entries| entries.next().is_some())
}

/// Bytes under `dir`; symlinks count as themselves, not their targets.
fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = fs::symlink_metadata(entry.path())?;
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

/// Blocking scan of `hub`; a missing directory holds no models.
pub fn read_hub_cache(hub: &Path) -> io::Result<Vec<CachedModel>> {
    let entries = match fs::read_dir(hub) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("neuron::hub: no cache at {}", hub.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let mut models = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).and_then(repo_id) else {
            continue;
        };
        if !path.is_dir() || !has_snapshot(&path) {
            continue;
        }
        match dir_size(&path) {
            Ok(bytes) => models.push(CachedModel {
                name,
                size_mb: (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
                cache_path: path,
            }),
            Err(e) => warn!("neuron::hub: cannot size {}: {e}", path.display()),
        }
    }
    models.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(models)
}

/// Scan `hub` off the async runtime; failures are logged and yield nothing.
pub async fn scan_hub_cache(hub: PathBuf) -> Vec<CachedModel> {
    let shown = hub.display().to_string();
    match tokio::task::spawn_blocking(move || read_hub_cache(&hub)).await {
        Ok(Ok(models)) => models,
        Ok(Err(e)) => {
            warn!("neuron::hub: cannot scan {shown}: {e}");
            Vec::new()
        }
        Err(e) => {
            warn!("neuron::hub: scan of {shown} aborted: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        env::temp_dir().join(format!("neuron-hub-{tag}-{nanos}"))
    }

    #[test]
    fn repo_ids_come_from_directory_names() {
        assert_eq!(
            repo_id("models--Qwen--Qwen2.5-1.5B-Instruct").as_deref(),
            Some("Qwen/Qwen2.5-1.5B-Instruct")
        );
        assert_eq!(repo_id("models--gpt2"), None);
        assert_eq!(repo_id("datasets--org--set"), None);
        assert_eq!(repo_id("models--org--"), None);
    }

    #[tokio::test]
    async fn only_repositories_with_snapshots_count() {
        let hub = scratch("scan");
        let snapshot = hub.join("models--Qwen--Qwen2.5-1.5B-Instruct/snapshots/abc123");
        fs::create_dir_all(&snapshot).unwrap();
        fs::write(snapshot.join("model.safetensors"), vec![0u8; 3 * 1024 * 1024]).unwrap();
        fs::create_dir_all(hub.join("models--org--partial/snapshots")).unwrap();
        fs::create_dir_all(hub.join("datasets--org--set/snapshots/x")).unwrap();
        fs::write(hub.join("version.txt"), "1").unwrap();

        let models = scan_hub_cache(hub.clone()).await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "Qwen/Qwen2.5-1.5B-Instruct");
        assert_eq!(models[0].size_mb, 3.0);
        assert!(models[0].cache_path.ends_with("models--Qwen--Qwen2.5-1.5B-Instruct"));

        fs::remove_dir_all(&hub).unwrap();
    }

    #[tokio::test]
    async fn missing_cache_is_empty() {
        assert!(scan_hub_cache(scratch("missing")).await.is_empty());
    }
}
