//! Image Layout writer (§4.7, §3): assembles the on-disk OCI Image Layout
//! from blobs already resident in the cache.
//!
//! ```text
//! <root>/
//!   oci-layout
//!   index.json
//!   blobs/sha256/<hex>
//!   refs/tags/<tag>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::BlobStore;
use crate::error::{io_err, Result};
use crate::oci::{canonical_json, Descriptor, Digest, ImageIndex, MEDIA_TYPE_MANIFEST};

const OCI_LAYOUT_MARKER: &[u8] = br#"{"imageLayoutVersion":"1.0.0"}"#;
const TAG_ANNOTATION: &str = "org.opencontainers.image.ref.name";

pub struct LayoutResult {
    pub root: PathBuf,
    pub manifest_digest: Digest,
}

/// Write blob bytes to `<root>/blobs/sha256/<hex>` through a temp file and
/// rename, so a failure mid-write never leaves a partial blob at its final
/// name.
async fn write_blob(root: &Path, digest: &Digest, bytes: &[u8]) -> Result<()> {
    let dir = root.join("blobs/sha256");
    tokio::fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
    let final_path = dir.join(digest.hex());
    if tokio::fs::metadata(&final_path).await.is_ok() {
        return Ok(());
    }
    let tmp = dir.join(format!(".tmp.{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes).await.map_err(|e| io_err(&tmp, e))?;
    tokio::fs::rename(&tmp, &final_path).await.map_err(|e| io_err(&final_path, e))?;
    Ok(())
}

/// Copy a blob already present in the cache into the layout, preferring a
/// hardlink (both live on content-addressed, immutable storage) and falling
/// back to a copy across filesystem boundaries.
async fn link_or_copy_blob(root: &Path, cache: &Arc<BlobStore>, digest: &Digest) -> Result<()> {
    let dir = root.join("blobs/sha256");
    tokio::fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
    let final_path = dir.join(digest.hex());
    if tokio::fs::metadata(&final_path).await.is_ok() {
        return Ok(());
    }

    let cache_path = cache.root().join("blobs/sha256").join(digest.hex());
    let tmp = dir.join(format!(".tmp.{}", uuid::Uuid::new_v4()));
    match tokio::fs::hard_link(&cache_path, &tmp).await {
        Ok(()) => {}
        Err(_) => {
            let bytes = tokio::fs::read(&cache_path).await.map_err(|e| io_err(&cache_path, e))?;
            tokio::fs::write(&tmp, &bytes).await.map_err(|e| io_err(&tmp, e))?;
        }
    }
    tokio::fs::rename(&tmp, &final_path).await.map_err(|e| io_err(&final_path, e))
}

/// Write the complete image layout at `root` for one tagged image:
/// config blob, layer blobs (already in `cache`), manifest blob, `index.json`,
/// the `oci-layout` marker, and — unless `tag` is empty — a `refs/tags/<tag>`
/// pointer. Each write goes through a temp-then-rename step so a failure
/// partway through never corrupts a previously valid layout.
pub async fn write(
    root: &Path,
    cache: &Arc<BlobStore>,
    config_bytes: &[u8],
    config_digest: &Digest,
    layer_descriptors: &[Descriptor],
    manifest_bytes: &[u8],
    manifest_digest: &Digest,
    tag: &str,
) -> Result<LayoutResult> {
    tokio::fs::create_dir_all(root).await.map_err(|e| io_err(root, e))?;

    write_blob(root, config_digest, config_bytes).await?;

    for descriptor in layer_descriptors {
        link_or_copy_blob(root, cache, &descriptor.digest).await?;
    }

    write_blob(root, manifest_digest, manifest_bytes).await?;

    let manifest_descriptor = Descriptor::new(MEDIA_TYPE_MANIFEST, manifest_digest.clone(), manifest_bytes.len() as u64)
        .with_annotation(TAG_ANNOTATION, tag);
    let index = ImageIndex::new(vec![manifest_descriptor]);
    let index_bytes = canonical_json(&index)?;
    let index_tmp = root.join(".tmp-index.json");
    tokio::fs::write(&index_tmp, &index_bytes).await.map_err(|e| io_err(&index_tmp, e))?;
    tokio::fs::rename(&index_tmp, root.join("index.json"))
        .await
        .map_err(|e| io_err(root, e))?;

    let layout_marker = root.join("oci-layout");
    if tokio::fs::metadata(&layout_marker).await.is_err() {
        let tmp = root.join(".tmp-oci-layout");
        tokio::fs::write(&tmp, OCI_LAYOUT_MARKER).await.map_err(|e| io_err(&tmp, e))?;
        tokio::fs::rename(&tmp, &layout_marker).await.map_err(|e| io_err(&layout_marker, e))?;
    }

    if !tag.is_empty() {
        let refs_dir = root.join("refs/tags");
        tokio::fs::create_dir_all(&refs_dir).await.map_err(|e| io_err(&refs_dir, e))?;
        let ref_tmp = refs_dir.join(format!(".tmp.{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&ref_tmp, manifest_digest.canonical()).await.map_err(|e| io_err(&ref_tmp, e))?;
        tokio::fs::rename(&ref_tmp, refs_dir.join(sanitize_tag(tag)))
            .await
            .map_err(|e| io_err(&refs_dir, e))?;
    }

    Ok(LayoutResult {
        root: root.to_path_buf(),
        manifest_digest: manifest_digest.clone(),
    })
}

/// `tag` may be a full `host/repo:tag` reference; `/` would otherwise be
/// read as path separators under `refs/tags/`, so it's flattened to `_`.
fn sanitize_tag(tag: &str) -> String {
    tag.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlobKind;

    #[tokio::test]
    async fn writes_a_minimal_valid_layout() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = BlobStore::open(cache_dir.path()).await.unwrap();
        let layer_digest = cache.put_bytes(b"layer-bytes", BlobKind::Layer).await.unwrap();
        let layer_descriptor = Descriptor::new(crate::oci::MEDIA_TYPE_LAYER_TAR_GZIP, layer_digest.clone(), 11);

        let config_bytes = br#"{"os":"linux"}"#;
        let config_digest = crate::digest::digest_bytes(config_bytes);
        let manifest_bytes = br#"{"schemaVersion":2}"#;
        let manifest_digest = crate::digest::digest_bytes(manifest_bytes);

        let out_dir = tempfile::tempdir().unwrap();
        let result = write(
            out_dir.path(),
            &cache,
            config_bytes,
            &config_digest,
            &[layer_descriptor],
            manifest_bytes,
            &manifest_digest,
            "demo:latest",
        )
        .await
        .unwrap();

        assert!(out_dir.path().join("oci-layout").is_file());
        assert!(out_dir.path().join("index.json").is_file());
        assert!(out_dir.path().join("blobs/sha256").join(config_digest.hex()).is_file());
        assert!(out_dir.path().join("blobs/sha256").join(layer_digest.hex()).is_file());
        assert!(out_dir.path().join("blobs/sha256").join(manifest_digest.hex()).is_file());
        assert!(out_dir.path().join("refs/tags/demo:latest").is_file());
        assert_eq!(result.manifest_digest, manifest_digest);

        let layout_text = std::fs::read_to_string(out_dir.path().join("oci-layout")).unwrap();
        assert_eq!(layout_text, r#"{"imageLayoutVersion":"1.0.0"}"#);
    }

    #[tokio::test]
    async fn index_json_references_tag_annotation() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = BlobStore::open(cache_dir.path()).await.unwrap();
        let config_bytes = b"{}";
        let config_digest = crate::digest::digest_bytes(config_bytes);
        let manifest_bytes = b"{}";
        let manifest_digest = crate::digest::digest_bytes(manifest_bytes);

        let out_dir = tempfile::tempdir().unwrap();
        write(
            out_dir.path(),
            &cache,
            config_bytes,
            &config_digest,
            &[],
            manifest_bytes,
            &manifest_digest,
            "myimage:v1",
        )
        .await
        .unwrap();

        let index_text = std::fs::read_to_string(out_dir.path().join("index.json")).unwrap();
        assert!(index_text.contains("myimage:v1"));
        assert!(index_text.contains(&manifest_digest.canonical()));
    }
}
