//! Base image resolution (§4.10): pulls the base manifest (selecting a
//! platform out of an index if needed), parses its config, and downloads
//! its layer blobs into the cache.

use std::sync::Arc;

use crate::cache::{BlobKind, BlobStore};
use crate::config::BuildPlan;
use crate::error::Result;
use crate::oci::{Descriptor, Digest, ImageConfig, ImageIndex, ImageManifest, Platform, RawImageConfig};
use crate::oci::{MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST};
use crate::output::OutputManager;
use crate::registry::{reference, RegistryClient};

pub struct ResolvedBase {
    pub layer_descriptors: Vec<Descriptor>,
    pub diff_ids: Vec<Digest>,
    pub config: ImageConfig,
}

impl ResolvedBase {
    pub fn is_shell_less(&self) -> bool {
        self.config.is_shell_less()
    }
}

/// The derived default base image for a project with no explicit
/// `base_image`: `docker.io/library/python:<X>.<Y>-slim`, falling back to
/// `python:3-slim` when no interpreter range was declared.
pub fn default_base_image(declared_range: Option<(u32, u32)>) -> String {
    match declared_range {
        Some((major, minor)) => format!("docker.io/library/python:{major}.{minor}-slim"),
        None => "docker.io/library/python:3-slim".to_string(),
    }
}

pub async fn resolve(
    base_reference: &str,
    wanted_platform: &Platform,
    cache: &Arc<BlobStore>,
    plan: &BuildPlan,
    output: &OutputManager,
) -> Result<ResolvedBase> {
    let image_ref = reference::parse(base_reference)?;
    let client = Arc::new(RegistryClient::new(&image_ref.host, plan, output)?);

    let (bytes, media_type, _) = client
        .get_manifest(
            &image_ref.repo,
            &image_ref.as_reference_str(),
            &[MEDIA_TYPE_MANIFEST, MEDIA_TYPE_INDEX],
        )
        .await?;

    let manifest_bytes = if media_type == MEDIA_TYPE_INDEX || looks_like_index(&bytes) {
        let index: ImageIndex = serde_json::from_slice(&bytes)?;
        let descriptor = index.select_platform(wanted_platform)?;
        let (manifest_bytes, _, _) = client
            .get_manifest(&image_ref.repo, &descriptor.digest.canonical(), &[MEDIA_TYPE_MANIFEST])
            .await?;
        manifest_bytes
    } else {
        bytes
    };

    let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
    let config_bytes = client.get_blob(&image_ref.repo, &manifest.config.digest).await?;
    // Real registries nest env/entrypoint/cmd/labels/user under a `config`
    // object with Docker's capitalized keys; parse that wire shape and fold
    // it into our own flat `ImageConfig` rather than deserializing into it
    // directly.
    let raw: RawImageConfig = serde_json::from_slice(&config_bytes)?;
    let config: ImageConfig = raw.into();

    let missing: Vec<Descriptor> = {
        let mut missing = Vec::new();
        for descriptor in &manifest.layers {
            if !cache.has(&descriptor.digest).await {
                missing.push(descriptor.clone());
            }
        }
        missing
    };

    let downloads = missing.into_iter().map(|descriptor| {
        let client = Arc::clone(&client);
        let cache = Arc::clone(cache);
        let repo = image_ref.repo.clone();
        async move {
            let bytes = client.get_blob(&repo, &descriptor.digest).await?;
            cache.put_bytes(&bytes, BlobKind::BaseLayer).await?;
            Ok::<(), crate::error::BuildError>(())
        }
    });
    futures::future::try_join_all(downloads).await?;

    Ok(ResolvedBase {
        layer_descriptors: manifest.layers,
        diff_ids: config.rootfs.diff_ids.clone(),
        config,
    })
}

fn looks_like_index(bytes: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("manifests").cloned())
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_base_image_uses_declared_range() {
        assert_eq!(default_base_image(Some((3, 11))), "docker.io/library/python:3.11-slim");
    }

    #[test]
    fn default_base_image_falls_back() {
        assert_eq!(default_base_image(None), "docker.io/library/python:3-slim");
    }

    #[test]
    fn looks_like_index_detects_manifests_field() {
        assert!(looks_like_index(br#"{"manifests":[]}"#));
        assert!(!looks_like_index(br#"{"config":{},"layers":[]}"#));
    }
}
