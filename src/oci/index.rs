use serde::{Deserialize, Serialize};

use super::{Descriptor, MEDIA_TYPE_INDEX};
use crate::error::{BuildError, Result};

/// A manifest-of-manifests associating platform tuples with image manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_INDEX.to_string(),
            manifests,
        }
    }

    /// Select the first manifest descriptor whose platform matches `wanted`.
    pub fn select_platform(&self, wanted: &super::Platform) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| wanted.matches(p)))
            .ok_or_else(|| BuildError::NoMatchingPlatform {
                wanted: wanted.to_string(),
                offered: self
                    .manifests
                    .iter()
                    .filter_map(|d| d.platform.as_ref().map(|p| p.to_string()))
                    .collect(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{Digest, Platform, MEDIA_TYPE_MANIFEST};

    fn digest(n: u8) -> Digest {
        Digest::new(format!("{:064x}", n))
    }

    #[test]
    fn selects_matching_platform() {
        let amd64 = Descriptor::new(MEDIA_TYPE_MANIFEST, digest(1), 10)
            .with_platform(Platform::new("linux", "amd64"));
        let arm64 = Descriptor::new(MEDIA_TYPE_MANIFEST, digest(2), 10)
            .with_platform(Platform::new("linux", "arm64"));
        let index = ImageIndex::new(vec![amd64, arm64.clone()]);

        let wanted = Platform::parse("linux/arm64").unwrap();
        let selected = index.select_platform(&wanted).unwrap();
        assert_eq!(selected.digest, digest(2));
    }

    #[test]
    fn no_matching_platform_is_an_error() {
        let amd64 = Descriptor::new(MEDIA_TYPE_MANIFEST, digest(1), 10)
            .with_platform(Platform::new("linux", "amd64"));
        let index = ImageIndex::new(vec![amd64]);
        let wanted = Platform::parse("linux/arm64").unwrap();
        assert!(matches!(
            index.select_platform(&wanted),
            Err(BuildError::NoMatchingPlatform { .. })
        ));
    }
}
