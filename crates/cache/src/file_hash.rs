// SPDX-License-Identifier: PolyForm-Shield-1.0

//! File-backed [`HashStore`]: one JSON object per key inside a directory.
//!
//! Keys are percent-escaped into file names (`model:phi` becomes
//! `model%3Aphi.json`), so every entry survives independently and a torn
//! write can only ever affect a single key.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::hash::{Fields, HashStore};
use crate::{write_atomic, CacheError};

const SUFFIX: &str = ".json";

pub struct JsonHashStore {
    dir: PathBuf,
    /// serialises read-modify-write cycles of `set`.
    write_lock: Mutex<()>,
}

impl JsonHashStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{SUFFIX}", escape_key(key)))
    }
}

fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn read_fields(path: &Path) -> Result<Option<Fields>, CacheError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io(path, e)),
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| CacheError::Json {
            path: path.to_path_buf(),
            source,
        })
}

async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Backend(format!("blocking store task failed: {e}")))?
}

#[async_trait]
impl HashStore for JsonHashStore {
    async fn get(&self, key: &str) -> Result<Option<Fields>, CacheError> {
        let path = self.path_for(key);
        blocking(move || read_fields(&path)).await
    }

    async fn set(&self, key: &str, fields: &Fields) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        let update = fields.clone();
        blocking(move || {
            let mut merged = read_fields(&path)?.unwrap_or_default();
            merged.extend(update);
            let json = serde_json::to_vec_pretty(&merged).map_err(|source| CacheError::Json {
                path: path.clone(),
                source,
            })?;
            write_atomic(&path, &json).map_err(|e| CacheError::io(&path, e))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(&path, e)),
        })
        .await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let dir = self.dir.clone();
        let prefix = prefix.to_string();
        blocking(move || {
            let entries = fs::read_dir(&dir).map_err(|e| CacheError::io(&dir, e))?;
            let mut keys = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| CacheError::io(&dir, e))?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                // leftovers from interrupted writes end in `.json.tmp`
                let Some(stem) = name.strip_suffix(SUFFIX) else { continue };
                if let Some(key) = unescape_key(stem) {
                    if key.starts_with(&prefix) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp_root;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn key_escaping_is_reversible() {
        for key in ["model:phi", "model:qwen-7b_awq", "weird/key%"] {
            let escaped = escape_key(key);
            assert!(!escaped.contains(':') && !escaped.contains('/'));
            assert_eq!(unescape_key(&escaped).as_deref(), Some(key));
        }
    }

    #[tokio::test]
    async fn entries_persist_across_reopen() {
        let root = temp_root("hash-store");
        {
            let store = JsonHashStore::open(&root).unwrap();
            store
                .set("model:phi", &fields(&[("status", "deploying"), ("port", "8100")]))
                .await
                .unwrap();
            store
                .set("model:phi", &fields(&[("status", "running")]))
                .await
                .unwrap();
        }

        let reopened = JsonHashStore::open(&root).unwrap();
        let entry = reopened.get("model:phi").await.unwrap().unwrap();
        assert_eq!(entry["status"], "running");
        assert_eq!(entry["port"], "8100");
        assert_eq!(reopened.keys("model:").await.unwrap(), vec!["model:phi"]);

        fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn delete_and_prefix_listing() {
        let root = temp_root("hash-delete");
        let store = JsonHashStore::open(&root).unwrap();
        store.set("model:a", &fields(&[("x", "1")])).await.unwrap();
        store.set("other:a", &fields(&[("x", "1")])).await.unwrap();
        fs::write(root.join("model%3Ab.json.tmp"), "{}").unwrap();

        assert_eq!(store.keys("model:").await.unwrap(), vec!["model:a"]);
        assert!(store.delete("model:a").await.unwrap());
        assert!(!store.delete("model:a").await.unwrap());
        assert!(store.get("model:a").await.unwrap().is_none());

        fs::remove_dir_all(root).ok();
    }
}
