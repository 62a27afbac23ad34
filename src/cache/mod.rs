//! Content-addressed blob store with LRU eviction (§4.2).
//!
//! Layout on disk:
//! ```text
//! <cache_root>/
//!   index.json            # digest -> entry metadata
//!   blobs/sha256/<hex>    # content-addressed blob files
//!   layers/<sidecar>.json # source tuples per layer digest
//! ```

mod sidecar;

pub use sidecar::{LayerSidecar, SourceEntry};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::error::{io_err, BuildError, Result};
use crate::oci::Digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    Layer,
    Config,
    Manifest,
    BaseLayer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub size: u64,
    pub last_access: u64,
    pub kind: BlobKind,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndexFile {
    entries: HashMap<String, CacheEntryMeta>,
}

pub struct BlobStore {
    root: PathBuf,
    index: RwLock<CacheIndexFile>,
    pinned: Mutex<HashSet<String>>,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl BlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("blobs/sha256"))
            .await
            .map_err(|e| io_err(&root, e))?;
        tokio::fs::create_dir_all(root.join("layers"))
            .await
            .map_err(|e| io_err(&root, e))?;

        let index_path = root.join("index.json");
        let index = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => CacheIndexFile::default(),
        };

        Ok(Arc::new(Self {
            root,
            index: RwLock::new(index),
            pinned: Mutex::new(HashSet::new()),
        }))
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs/sha256").join(digest.hex())
    }

    pub fn sidecar_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("layers").join(format!("{}.json", digest.hex()))
    }

    async fn persist_index(&self) -> Result<()> {
        let index = self.index.read().await;
        let bytes = serde_json::to_vec_pretty(&*index)?;
        let tmp = self.root.join(format!("index.json.tmp.{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| io_err(&tmp, e))?;
        tokio::fs::rename(&tmp, self.root.join("index.json"))
            .await
            .map_err(|e| io_err(&self.root, e))?;
        Ok(())
    }

    pub async fn has(&self, digest: &Digest) -> bool {
        self.index.read().await.entries.contains_key(digest.hex())
    }

    /// Open a read stream, updating last-access. Returns `None` if absent.
    pub async fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        if !self.has(digest).await {
            return Ok(None);
        }
        self.pinned.lock().await.insert(digest.hex().to_string());
        let path = self.blob_path(digest);
        let bytes = tokio::fs::read(&path).await.map_err(|e| io_err(&path, e))?;

        {
            let mut index = self.index.write().await;
            if let Some(entry) = index.entries.get_mut(digest.hex()) {
                entry.last_access = now_secs();
            }
        }
        self.persist_index().await?;
        self.pinned.lock().await.remove(digest.hex());
        Ok(Some(bytes))
    }

    /// Stream-write bytes to a temp file, hash while writing, then atomically
    /// rename to the final content-addressed path. A concurrent writer for
    /// the same digest simply discards its temp file once it loses the race.
    pub async fn put_bytes(&self, bytes: &[u8], kind: BlobKind) -> Result<Digest> {
        let digest = crate::digest::digest_bytes(bytes);
        let final_path = self.blob_path(&digest);

        if tokio::fs::metadata(&final_path).await.is_err() {
            let tmp = self
                .root
                .join("blobs/sha256")
                .join(format!(".tmp.{}", uuid::Uuid::new_v4()));
            {
                let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| io_err(&tmp, e))?;
                file.write_all(bytes).await.map_err(|e| io_err(&tmp, e))?;
                file.flush().await.map_err(|e| io_err(&tmp, e))?;
            }
            match tokio::fs::rename(&tmp, &final_path).await {
                Ok(()) => {}
                Err(_) if tokio::fs::metadata(&final_path).await.is_ok() => {
                    // Lost the race to another writer for the same digest; discard ours.
                    let _ = tokio::fs::remove_file(&tmp).await;
                }
                Err(e) => return Err(io_err(&final_path, e)),
            }
        }

        {
            let mut index = self.index.write().await;
            index.entries.insert(
                digest.hex().to_string(),
                CacheEntryMeta {
                    size: bytes.len() as u64,
                    last_access: now_secs(),
                    kind,
                },
            );
        }
        self.persist_index().await?;
        Ok(digest)
    }

    /// Evict least-recently-used entries until total size is at most `target_bytes`.
    /// Entries pinned by a live reader are never evicted.
    pub async fn sweep(&self, target_bytes: u64) -> Result<()> {
        let pinned = self.pinned.lock().await.clone();
        let mut index = self.index.write().await;

        let mut total: u64 = index.entries.values().map(|e| e.size).sum();
        if total <= target_bytes {
            return Ok(());
        }

        let mut by_access: Vec<(String, u64, u64)> = index
            .entries
            .iter()
            .map(|(digest, meta)| (digest.clone(), meta.last_access, meta.size))
            .collect();
        by_access.sort_by_key(|(_, last_access, _)| *last_access);

        for (digest_hex, _last_access, size) in by_access {
            if total <= target_bytes {
                break;
            }
            if pinned.contains(&digest_hex) {
                continue;
            }
            let path = self.root.join("blobs/sha256").join(&digest_hex);
            if tokio::fs::remove_file(&path).await.is_ok() {
                index.entries.remove(&digest_hex);
                total = total.saturating_sub(size);
            }
        }
        drop(index);
        self.persist_index().await?;
        self.remove_orphan_temp_files().await
    }

    async fn remove_orphan_temp_files(&self) -> Result<()> {
        let grace = std::time::Duration::from_secs(3600);
        let dir = self.root.join("blobs/sha256");
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| io_err(&dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir, e))? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(".tmp.") {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                if let Ok(modified) = meta.modified() {
                    if modified.elapsed().unwrap_or_default() > grace {
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// The size of a cached blob, if present.
    pub async fn entry_size(&self, digest: &Digest) -> Option<u64> {
        self.index.read().await.entries.get(digest.hex()).map(|e| e.size)
    }

    /// A stable-identity pointer from a layer's build identity (e.g.
    /// `"app:/app"`) to the digest it last produced, letting the layer
    /// builder look up a candidate digest before re-reading any file
    /// contents. Distinct from the per-digest source sidecar, which records
    /// *what* produced a given digest so it can be compared against.
    fn pointer_path(&self, identity: &str) -> PathBuf {
        let safe = identity.replace(['/', ':'], "_");
        self.root.join("layers").join(format!("pointer.{safe}.json"))
    }

    pub async fn read_layer_pointer(&self, identity: &str) -> Option<Digest> {
        let bytes = tokio::fs::read(self.pointer_path(identity)).await.ok()?;
        let text = String::from_utf8(bytes).ok()?;
        Digest::parse(text.trim()).ok()
    }

    pub async fn write_layer_pointer(&self, identity: &str, digest: &Digest) -> Result<()> {
        let path = self.pointer_path(identity);
        tokio::fs::write(&path, digest.canonical()).await.map_err(|e| io_err(&path, e))
    }

    /// Read a layer's source sidecar, if present; absence means "cold" (§4.2).
    pub async fn read_sidecar(&self, digest: &Digest) -> Option<LayerSidecar> {
        let bytes = tokio::fs::read(self.sidecar_path(digest)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn write_sidecar(&self, digest: &Digest, sidecar: &LayerSidecar) -> Result<()> {
        let path = self.sidecar_path(digest);
        let bytes = serde_json::to_vec(sidecar)?;
        tokio::fs::write(&path, bytes).await.map_err(|e| io_err(&path, e))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Validate a cache-relative filename never escapes the cache root, used by
/// any code that derives a path from a possibly-untrusted digest string.
pub fn validate_hex_digest(hex: &str) -> Result<()> {
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BuildError::InvalidConfig(format!("not a sha256 hex digest: {hex}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let digest = store.put_bytes(b"hello", BlobKind::Layer).await.unwrap();
        assert!(store.has(&digest).await);
        let bytes = store.get(&digest).await.unwrap().unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn duplicate_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let d1 = store.put_bytes(b"same", BlobKind::Config).await.unwrap();
        let d2 = store.put_bytes(b"same", BlobKind::Config).await.unwrap();
        assert_eq!(d1, d2);
    }

    #[tokio::test]
    async fn sweep_respects_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let d1 = store.put_bytes(b"aaaaaaaaaa", BlobKind::Layer).await.unwrap();
        let d2 = store.put_bytes(b"bbbbbbbbbb", BlobKind::Layer).await.unwrap();

        store.sweep(10).await.unwrap();

        // one of the two should have been evicted (LRU), not both
        let remaining = store.has(&d1).await as u8 + store.has(&d2).await as u8;
        assert_eq!(remaining, 1);
    }
}
