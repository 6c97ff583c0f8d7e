// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Persistence primitives for neuron.
//!
//! Two shapes of storage live here:
//!
//! - [`JsonStore`]: a single serde value persisted as one JSON file, used
//!   for snapshots such as the published route table.
//! - [`HashStore`]: a keyed-hash mapping (string key → string fields) with
//!   per-key get/set/delete and prefix enumeration. This is the durable home
//!   of model records. Backends make no cross-key atomicity promises.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod file_hash;
pub mod hash;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use file_hash::JsonHashStore;
pub use hash::{Fields, HashStore, MemoryHashStore};
#[cfg(feature = "redis")]
pub use redis_store::RedisHashStore;

/// Error type for cache and state-store operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to determine cache directory")]
    NoCacheDir,
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("state store backend error: {0}")]
    Backend(String),
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Returns the base cache directory, `${HOME}/.cache/neuron/`.
///
/// systemd units that set `WorkingDirectory` to the service user's home
/// (e.g. `/var/lib/neuron`) therefore write under
/// `/var/lib/neuron/.cache/neuron/`, and interactive users get a per-user
/// directory.
pub fn neuron_cache_root() -> Result<PathBuf, CacheError> {
    let home = env::var_os("HOME").ok_or(CacheError::NoCacheDir)?;
    let mut path = PathBuf::from(home);
    path.push(".cache");
    path.push("neuron");
    Ok(path)
}

/// Write `bytes` to `path` via a sibling temporary file and a rename, so a
/// crash mid-write never leaves a truncated file behind.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// JSON-backed store for a single logical value.
///
/// ```ignore
/// let store = JsonStore::new("routes")?;
/// store.save(&table)?;
/// let table: RouteTable = store.load_or_default()?;
/// ```
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Store named `{store_name}.json` under [`neuron_cache_root`].
    pub fn new(store_name: &str) -> Result<Self> {
        let root = neuron_cache_root()?;
        Self::with_root(root, store_name)
    }

    /// Store named `{store_name}.json` under an explicit directory.
    pub fn with_root<P: AsRef<Path>>(root: P, store_name: &str) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create cache root at {}", root.display()))?;
        Ok(Self::at_path(root.join(format!("{store_name}.json"))))
    }

    /// Store backed by an exact file path; the parent is created on save.
    pub fn at_path<P: Into<PathBuf>>(path: P) -> Self {
        JsonStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the value if the file exists and is non-empty.
    pub fn load_optional<T>(&self) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse JSON from {}", self.path.display()))?;
        Ok(Some(value))
    }

    pub fn load_or_default<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        Ok(self.load_optional()?.unwrap_or_default())
    }

    /// Persist `value` as pretty-printed JSON.
    pub fn save<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let json = serde_json::to_vec_pretty(value).context("failed to serialise value to JSON")?;
        write_atomic(&self.path, &json)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    /// Remove the backing file if present.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }
}

/// Unique scratch directory for tests.
#[cfg(test)]
pub(crate) fn temp_root(tag: &str) -> PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    env::temp_dir().join(format!("neuron-{tag}-{nanos}"))
}
