//! In-memory OCI types — descriptors, manifest, index, image config — and
//! canonical JSON serialization.
//!
//! Canonical JSON here means: UTF-8, sorted object keys, no insignificant
//! whitespace, no trailing newline. We get sorted keys for free by routing
//! every value through `serde_json::Value` before emitting it: without the
//! `preserve_order` feature, `serde_json::Map` is backed by a `BTreeMap`, so
//! `to_value` followed by `to_vec` sorts keys alphabetically by construction
//! rather than by hand-maintained field order.

mod config;
mod index;
mod manifest;

pub use config::{History, ImageConfig, RawImageConfig, RootFs};
pub use index::ImageIndex;
pub use manifest::ImageManifest;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BuildError, Result};

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// A SHA-256 digest, always rendered as `sha256:<64 lowercase hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Build a digest from a bare hex string (no `sha256:` prefix).
    pub fn new(hex: impl Into<String>) -> Self {
        Digest(hex.into())
    }

    /// Parse a canonical `sha256:<hex>` string.
    pub fn parse(s: &str) -> Result<Self> {
        let hex = s
            .strip_prefix("sha256:")
            .ok_or_else(|| BuildError::InvalidConfig(format!("unsupported digest algorithm: {s}")))?;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BuildError::InvalidConfig(format!("malformed digest: {s}")));
        }
        Ok(Digest(hex.to_ascii_lowercase()))
    }

    pub fn hex(&self) -> &str {
        &self.0
    }

    /// The canonical `sha256:<hex>` string form.
    pub fn canonical(&self) -> String {
        format!("sha256:{}", self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl TryFrom<String> for Digest {
    type Error = BuildError;
    fn try_from(value: String) -> Result<Self> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.canonical()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Parse `"<os>/<arch>[/<variant>]"` as used by the `platform` build-plan option.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split('/');
        let os = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BuildError::InvalidConfig(format!("invalid platform: {spec}")))?;
        let arch = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BuildError::InvalidConfig(format!("invalid platform: {spec}")))?;
        let variant = parts.next().map(|s| s.to_string());
        if parts.next().is_some() {
            return Err(BuildError::InvalidConfig(format!("invalid platform: {spec}")));
        }
        Ok(Platform {
            os: os.to_string(),
            architecture: arch.to_string(),
            variant,
        })
    }

    /// True if `other` (an offered platform) satisfies this wanted platform.
    pub fn matches(&self, other: &Platform) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && (self.variant.is_none() || self.variant == other.variant)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "annotations")]
    pub annotations: Option<std::collections::BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            platform: None,
            annotations: None,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
        self
    }
}

/// Serialize `value` as canonical JSON: UTF-8, sorted keys, no insignificant
/// whitespace, no trailing newline.
pub fn canonical_json(value: &impl Serialize) -> Result<Vec<u8>> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&v)?)
}
