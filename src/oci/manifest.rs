use serde::{Deserialize, Serialize};

use super::{Descriptor, MEDIA_TYPE_MANIFEST};

/// `{ schema_version=2, media_type, config: Descriptor, layers: [Descriptor] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<std::collections::BTreeMap<String, String>>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            config,
            layers,
            annotations: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{canonical_json, Digest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER_TAR_GZIP};

    fn digest(n: u8) -> Digest {
        Digest::new(format!("{:064x}", n))
    }

    #[test]
    fn manifest_roundtrips_through_canonical_json() {
        let config = Descriptor::new(MEDIA_TYPE_CONFIG, digest(1), 100);
        let layer = Descriptor::new(MEDIA_TYPE_LAYER_TAR_GZIP, digest(2), 200);
        let manifest = ImageManifest::new(config, vec![layer]);

        let bytes = canonical_json(&manifest).unwrap();
        let parsed: ImageManifest = serde_json::from_slice(&bytes).unwrap();
        let bytes_again = canonical_json(&parsed).unwrap();

        assert_eq!(bytes, bytes_again, "serialize(parse(serialize(x))) == serialize(x)");
        assert!(!bytes.ends_with(b"\n"));
        assert!(!String::from_utf8(bytes).unwrap().contains("  "));
    }
}
