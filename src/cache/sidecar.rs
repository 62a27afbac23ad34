//! Per-layer source sidecars: the `(size, mtime, content hash)` tuples a
//! layer was built from, used to decide whether a cached layer blob can be
//! reused (§4.2).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::oci::Digest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub path: String,
    pub size: u64,
    pub mtime: u64,
    pub content_hash: Digest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerSidecar {
    pub sources: Vec<SourceEntry>,
}

impl LayerSidecar {
    pub fn from_entries(entries: Vec<SourceEntry>) -> Self {
        Self { sources: entries }
    }

    /// §9 open question resolved: a sidecar hit requires identical `size`
    /// *and* identical file bytes (compared by content hash, not mtime) —
    /// an mtime-only touch must not bust the cache (Scenario F), but a
    /// content-preserving-size edit (same byte count, different bytes) must.
    /// We therefore compare path, size, and content hash here, ignoring only
    /// mtime.
    pub fn matches_ignoring_mtime(&self, other: &[SourceEntry]) -> bool {
        if self.sources.len() != other.len() {
            return false;
        }
        self.sources
            .iter()
            .zip(other.iter())
            .all(|(a, b)| a.path == b.path && a.size == b.size && a.content_hash == b.content_hash)
    }
}

/// Stat and hash `relative` under `root`, producing the tuple the layer
/// cache compares builds against.
pub fn stat_entry(root: &Path, relative: &Path) -> std::io::Result<SourceEntry> {
    let full = root.join(relative);
    let meta = std::fs::metadata(&full)?;
    let mtime = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let bytes = std::fs::read(&full)?;
    Ok(SourceEntry {
        path: relative.to_string_lossy().replace('\\', "/"),
        size: meta.len(),
        mtime,
        content_hash: crate::digest::digest_bytes(&bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(bytes: &[u8]) -> Digest {
        crate::digest::digest_bytes(bytes)
    }

    #[test]
    fn mtime_only_change_does_not_bust_cache() {
        let hash = hash_of(b"print(1)");
        let sidecar = LayerSidecar::from_entries(vec![SourceEntry {
            path: "main.py".into(),
            size: 10,
            mtime: 100,
            content_hash: hash.clone(),
        }]);
        let new_stat = vec![SourceEntry {
            path: "main.py".into(),
            size: 10,
            mtime: 999,
            content_hash: hash,
        }];
        assert!(sidecar.matches_ignoring_mtime(&new_stat));
    }

    #[test]
    fn size_change_busts_cache() {
        let sidecar = LayerSidecar::from_entries(vec![SourceEntry {
            path: "main.py".into(),
            size: 10,
            mtime: 100,
            content_hash: hash_of(b"print(1)"),
        }]);
        let new_stat = vec![SourceEntry {
            path: "main.py".into(),
            size: 20,
            mtime: 100,
            content_hash: hash_of(b"print(1)!!!!!!!!!!"),
        }];
        assert!(!sidecar.matches_ignoring_mtime(&new_stat));
    }

    #[test]
    fn same_size_different_content_busts_cache() {
        let sidecar = LayerSidecar::from_entries(vec![SourceEntry {
            path: "main.py".into(),
            size: 10,
            mtime: 100,
            content_hash: hash_of(b"print(111)"),
        }]);
        let new_stat = vec![SourceEntry {
            path: "main.py".into(),
            size: 10,
            mtime: 100,
            content_hash: hash_of(b"print(222)"),
        }];
        assert!(!sidecar.matches_ignoring_mtime(&new_stat));
    }
}
