use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::Digest;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub typ: String,
    pub diff_ids: Vec<Digest>,
}

impl RootFs {
    pub fn layers(diff_ids: Vec<Digest>) -> Self {
        Self {
            typ: "layers".to_string(),
            diff_ids,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "empty_layer")]
    pub empty_layer: Option<bool>,
}

/// The image config: target platform, env/entrypoint/cmd/labels/user, and
/// the rootfs diff_id chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

impl ImageConfig {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
            env: Vec::new(),
            working_dir: None,
            entrypoint: None,
            cmd: None,
            labels: IndexMap::new(),
            user: None,
            rootfs: RootFs::default(),
            history: Vec::new(),
        }
    }

    /// Whether this image's labels mark it as shell-less (distroless).
    pub fn is_shell_less(&self) -> bool {
        self.labels
            .get("dev.pycontainer.shellless")
            .is_some_and(|v| v == "true")
            || self
                .labels
                .get("org.opencontainers.image.base.name")
                .is_some_and(|v| v.contains("distroless"))
    }

    /// Env as an ordered `key -> value` map, preserving first-occurrence order.
    pub fn env_map(&self) -> IndexMap<String, String> {
        let mut map = IndexMap::new();
        for entry in &self.env {
            if let Some((k, v)) = entry.split_once('=') {
                map.insert(k.to_string(), v.to_string());
            }
        }
        map
    }

}

/// The on-the-wire shape of a pulled image config, as registries actually
/// publish it: runtime fields (`Env`, `Entrypoint`, `Cmd`, `Labels`, `User`,
/// `WorkingDir`) nest under a `config` object with Docker's capitalized key
/// casing, separate from the top-level `os`/`architecture`/`rootfs`. This
/// type exists only to parse that wire format; `ImageConfig` remains the
/// shape this crate emits for its own images. Docker frequently emits
/// explicit JSON `null` for unset runtime fields rather than omitting the
/// key, so every field here tolerates both absence and null.
#[derive(Debug, Clone, Deserialize)]
pub struct RawImageConfig {
    pub os: String,
    pub architecture: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default, deserialize_with = "null_to_default")]
    pub config: RawRuntimeConfig,
    #[serde(default, deserialize_with = "null_to_default")]
    pub rootfs: RootFs,
    #[serde(default, deserialize_with = "null_to_default")]
    pub history: Vec<History>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRuntimeConfig {
    #[serde(rename = "Env", default, deserialize_with = "null_to_default")]
    pub env: Vec<String>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Labels", default, deserialize_with = "null_to_default")]
    pub labels: IndexMap<String, String>,
    #[serde(rename = "User", default)]
    pub user: Option<String>,
}

/// Treats a present `null` the same as an absent key, falling back to `T`'s
/// `Default`. Docker image configs routinely set unset runtime fields to
/// `null` instead of omitting them.
fn null_to_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

impl From<RawImageConfig> for ImageConfig {
    fn from(raw: RawImageConfig) -> Self {
        // Docker represents "unset" working_dir/user as "" as often as it
        // does by omitting the key; fold both into `None`.
        let working_dir = raw.config.working_dir.filter(|s| !s.is_empty());
        let user = raw.config.user.filter(|s| !s.is_empty());
        ImageConfig {
            os: raw.os,
            architecture: raw.architecture,
            variant: raw.variant,
            env: raw.config.env,
            working_dir,
            entrypoint: raw.config.entrypoint,
            cmd: raw.config.cmd,
            labels: raw.config.labels,
            user,
            rootfs: raw.rootfs,
            history: raw.history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_real_world_wire_format() {
        let json = br#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/local/bin:/usr/bin"],
                "Entrypoint": null,
                "Cmd": ["python3"],
                "WorkingDir": "",
                "Labels": null,
                "User": ""
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": ["sha256:aaaa"]
            },
            "history": []
        }"#;
        let raw: RawImageConfig = serde_json::from_slice(json).unwrap();
        let cfg: ImageConfig = raw.into();
        assert_eq!(cfg.env, vec!["PATH=/usr/local/bin:/usr/bin".to_string()]);
        assert_eq!(cfg.cmd, Some(vec!["python3".to_string()]));
        assert_eq!(cfg.entrypoint, None);
        assert_eq!(cfg.working_dir, None);
        assert_eq!(cfg.user, None);
        assert!(cfg.labels.is_empty());
        assert_eq!(cfg.rootfs.diff_ids.len(), 1);
    }

    #[test]
    fn env_map_preserves_order_and_parses_kv() {
        let mut cfg = ImageConfig::new("linux", "amd64");
        cfg.env = vec!["B=2".into(), "A=1".into()];
        let map = cfg.env_map();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["B", "A"]);
    }

    #[test]
    fn shell_less_detection() {
        let mut cfg = ImageConfig::new("linux", "amd64");
        cfg.labels.insert(
            "org.opencontainers.image.base.name".to_string(),
            "gcr.io/distroless/python3".to_string(),
        );
        assert!(cfg.is_shell_less());

        let plain = ImageConfig::new("linux", "amd64");
        assert!(!plain.is_shell_less());
    }
}
