//! Deterministic tar writer (§4.1).
//!
//! The output byte stream is a pure function of logical contents — archive
//! path, bytes, mode, and entry kind — nothing else. Entries are appended in
//! lexicographic path order, mtimes are pinned to a single timestamp, and
//! ownership is always `0:root`.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{BuildError, Result};
use crate::oci::Digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Executable,
    Directory,
    Symlink,
}

pub struct PendingEntry {
    pub archive_path: String,
    pub kind: EntryKind,
    pub bytes: Vec<u8>,
    pub link_target: Option<String>,
}

/// Collects entries, then emits a single deterministic (optionally gzipped)
/// tar stream, producing both the uncompressed diff_id and the on-wire
/// (possibly compressed) descriptor digest from one pass over the bytes.
pub struct DeterministicTarWriter {
    root_prefix: String,
    mtime: u64,
    entries: BTreeMap<String, PendingEntry>,
}

pub struct FinishedLayer {
    pub diff_id: Digest,
    pub descriptor_digest: Digest,
    pub compressed_bytes: Vec<u8>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

impl DeterministicTarWriter {
    /// `root_prefix` is the archive-internal directory entries are rooted
    /// under, e.g. `"app"` (no leading/trailing slash).
    pub fn new(root_prefix: impl Into<String>, mtime: u64) -> Self {
        Self {
            root_prefix: root_prefix.into(),
            mtime,
            entries: BTreeMap::new(),
        }
    }

    fn normalize(&self, relative_path: &Path) -> Result<String> {
        let mut normalized = String::new();
        for component in relative_path.components() {
            use std::path::Component;
            match component {
                Component::Normal(part) => {
                    if !normalized.is_empty() {
                        normalized.push('/');
                    }
                    normalized.push_str(&part.to_string_lossy());
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(BuildError::UnsafePath(relative_path.to_path_buf()));
                }
            }
        }
        let archive_path = if self.root_prefix.is_empty() {
            normalized
        } else {
            format!("{}/{}", self.root_prefix, normalized)
        };
        Ok(archive_path)
    }

    /// Add a regular file or an executable by reading it fully from `reader`.
    pub fn add_file(
        &mut self,
        relative_path: &Path,
        mut reader: impl Read,
        kind: EntryKind,
    ) -> Result<()> {
        let archive_path = self.normalize(relative_path)?;
        if self.entries.contains_key(&archive_path) {
            return Err(BuildError::DuplicateEntry(PathBuf::from(&archive_path)));
        }
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| crate::error::io_err(relative_path, e))?;
        self.entries.insert(
            archive_path.clone(),
            PendingEntry {
                archive_path,
                kind,
                bytes,
                link_target: None,
            },
        );
        Ok(())
    }

    /// Add a symlink entry; `target` is stored verbatim (§9 open question:
    /// we reject symlinks whose *resolved* target escapes the context tree
    /// at collection time, before they ever reach the tar writer — see
    /// layer_builder.rs).
    pub fn add_symlink(&mut self, relative_path: &Path, target: &str) -> Result<()> {
        let archive_path = self.normalize(relative_path)?;
        if self.entries.contains_key(&archive_path) {
            return Err(BuildError::DuplicateEntry(PathBuf::from(&archive_path)));
        }
        self.entries.insert(
            archive_path.clone(),
            PendingEntry {
                archive_path,
                kind: EntryKind::Symlink,
                bytes: Vec::new(),
                link_target: Some(target.to_string()),
            },
        );
        Ok(())
    }

    fn mode_for(kind: EntryKind) -> u32 {
        match kind {
            EntryKind::Directory => 0o755,
            EntryKind::Regular => 0o644,
            EntryKind::Executable => 0o755,
            EntryKind::Symlink => 0o777,
        }
    }

    /// True if the file's permission bits have any execute bit set, or its
    /// name ends in `.sh` — the stable executable predicate from §4.1.
    pub fn is_executable(path: &Path, metadata: &std::fs::Metadata) -> bool {
        path.extension().is_some_and(|ext| ext == "sh")
            || metadata.permissions().mode() & 0o111 != 0
    }

    /// Write the collected entries as a deterministic tar stream, optionally
    /// gzip-compressed, and return both digests.
    ///
    /// Source bytes are already resident in memory (read once, in
    /// `add_file`); the tar assembly pass hashes the uncompressed stream to
    /// get the diff_id, and — if `gzip` is set — a second pass compresses
    /// and hashes that output to get the on-wire descriptor digest, per the
    /// "read once, hashed twice" rule in §5.
    pub fn finish(self, gzip: bool) -> Result<FinishedLayer> {
        let tar_bytes = {
            let mut buf = Vec::new();
            let mut builder = tar::Builder::new(&mut buf);
            builder.mode(tar::HeaderMode::Deterministic);

            for entry in self.entries.values() {
                Self::append_entry(&mut builder, entry, self.mtime)?;
            }

            builder
                .into_inner()
                .map_err(|e| crate::error::io_err("<tar>", e))?;
            buf
        };
        let diff_id = crate::digest::digest_bytes(&tar_bytes);
        let uncompressed_size = tar_bytes.len() as u64;

        let (compressed_bytes, descriptor_digest) = if gzip {
            let mut gz_buf = Vec::new();
            {
                let mut encoder = GzEncoder::new(&mut gz_buf, Compression::default());
                encoder
                    .write_all(&tar_bytes)
                    .map_err(|e| crate::error::io_err("<gzip>", e))?;
                encoder.finish().map_err(|e| crate::error::io_err("<gzip>", e))?;
            }
            let digest = crate::digest::digest_bytes(&gz_buf);
            (gz_buf, digest)
        } else {
            (tar_bytes.clone(), diff_id.clone())
        };
        let compressed_size = compressed_bytes.len() as u64;

        Ok(FinishedLayer {
            diff_id,
            descriptor_digest,
            compressed_bytes,
            uncompressed_size,
            compressed_size,
        })
    }

    fn append_entry<W: Write>(
        builder: &mut tar::Builder<W>,
        entry: &PendingEntry,
        mtime: u64,
    ) -> Result<()> {
        let mut header = tar::Header::new_ustar();
        header.set_mtime(mtime);
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("root").ok();
        header.set_groupname("root").ok();
        header.set_mode(Self::mode_for(entry.kind));

        match entry.kind {
            EntryKind::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                let path = format!("{}/", entry.archive_path);
                header
                    .set_path(&path)
                    .map_err(|e| crate::error::io_err(PathBuf::from(&entry.archive_path), e))?;
                header.set_cksum();
                builder
                    .append(&header, std::io::empty())
                    .map_err(|e| crate::error::io_err(PathBuf::from(&entry.archive_path), e))
            }
            EntryKind::Symlink => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                let target = entry.link_target.as_deref().unwrap_or("");
                builder
                    .append_link(&mut header, &entry.archive_path, target)
                    .map_err(|e| crate::error::io_err(PathBuf::from(&entry.archive_path), e))
            }
            EntryKind::Regular | EntryKind::Executable => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(entry.bytes.len() as u64);
                header.set_cksum();
                builder
                    .append_data(&mut header, &entry.archive_path, entry.bytes.as_slice())
                    .map_err(|e| crate::error::io_err(PathBuf::from(&entry.archive_path), e))
            }
        }
    }
}
