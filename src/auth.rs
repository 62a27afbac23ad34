//! Auth provider chain (§4.9): explicit -> environment -> platform
//! credentials file -> cloud CLI, evaluated per `(host, scope)`. Dispatch is
//! by `match` over a fixed ordered list of tagged variants, not a trait
//! object hierarchy.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;

use crate::config::BuildPlan;
use crate::output::OutputManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCredential {
    Basic { user: String, secret: String },
    Bearer { token: String },
}

#[derive(Debug, Clone, Copy)]
enum ProviderKind {
    Explicit,
    Environment,
    CredFile,
    CloudCli,
}

const PROVIDER_ORDER: [ProviderKind; 4] = [
    ProviderKind::Explicit,
    ProviderKind::Environment,
    ProviderKind::CredFile,
    ProviderKind::CloudCli,
];

const GHCR_HOST: &str = "ghcr.io";
const CLOUD_CLI_TIMEOUT: Duration = Duration::from_secs(15);

pub struct AuthChain<'a> {
    plan: &'a BuildPlan,
    output: &'a OutputManager,
}

impl<'a> AuthChain<'a> {
    pub fn new(plan: &'a BuildPlan, output: &'a OutputManager) -> Self {
        Self { plan, output }
    }

    /// Returns the first non-absent credential in provider order.
    pub async fn resolve(&self, host: &str) -> Option<AuthCredential> {
        for kind in PROVIDER_ORDER {
            if let Some(cred) = self.try_provider(kind, host).await {
                return Some(cred);
            }
        }
        None
    }

    async fn try_provider(&self, kind: ProviderKind, host: &str) -> Option<AuthCredential> {
        match kind {
            ProviderKind::Explicit => self.explicit(host),
            ProviderKind::Environment => self.environment(host),
            ProviderKind::CredFile => self.cred_file(host).await,
            ProviderKind::CloudCli => self.cloud_cli(host).await,
        }
    }

    fn explicit(&self, host: &str) -> Option<AuthCredential> {
        if self.plan.push_registry_host() != host {
            return None;
        }
        match (&self.plan.explicit_username, &self.plan.explicit_password) {
            (Some(user), Some(secret)) => Some(AuthCredential::Basic {
                user: user.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        }
    }

    fn environment(&self, host: &str) -> Option<AuthCredential> {
        if host == GHCR_HOST {
            if let Ok(token) = std::env::var("GHCR_TOKEN") {
                if !token.is_empty() {
                    return Some(AuthCredential::Bearer { token });
                }
            }
        }
        if let Ok(token) = std::env::var("REGISTRY_TOKEN") {
            if !token.is_empty() {
                return Some(AuthCredential::Bearer { token });
            }
        }
        if let (Ok(user), Ok(secret)) = (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            if !user.is_empty() {
                return Some(AuthCredential::Basic { user, secret });
            }
        }
        None
    }

    async fn cred_file(&self, host: &str) -> Option<AuthCredential> {
        let path = docker_config_path();
        let bytes = tokio::fs::read(&path).await.ok()?;
        let file: DockerConfigFile = serde_json::from_slice(&bytes).ok()?;

        let candidate_keys = [
            host.to_string(),
            format!("https://{host}"),
            format!("https://{host}/v1/"),
        ];
        let entry = candidate_keys
            .iter()
            .find_map(|key| file.auths.get(key))
            .or_else(|| file.auths.iter().find(|(k, _)| k.contains(host)).map(|(_, v)| v))?;

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(entry.auth.as_ref()?)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, secret) = decoded.split_once(':')?;
        Some(AuthCredential::Basic {
            user: user.to_string(),
            secret: secret.to_string(),
        })
    }

    async fn cloud_cli(&self, host: &str) -> Option<AuthCredential> {
        if !(host.ends_with(".pkg.dev") || host == "gcr.io" || host.ends_with(".gcr.io")) {
            return None;
        }
        let invocation = tokio::process::Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output();

        match tokio::time::timeout(CLOUD_CLI_TIMEOUT, invocation).await {
            Ok(Ok(output)) if output.status.success() => {
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if token.is_empty() {
                    None
                } else {
                    Some(AuthCredential::Basic {
                        user: "oauth2accesstoken".to_string(),
                        secret: token,
                    })
                }
            }
            Ok(Ok(output)) => {
                self.output
                    .verbose_msg(&format!("gcloud auth print-access-token exited with {}", output.status));
                None
            }
            Ok(Err(e)) => {
                self.output.verbose_msg(&format!("gcloud CLI unavailable: {e}"));
                None
            }
            Err(_) => {
                self.output.verbose_msg("gcloud auth print-access-token timed out");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    auth: Option<String>,
}

fn docker_config_path() -> std::path::PathBuf {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        if !dir.is_empty() {
            return std::path::PathBuf::from(dir).join("config.json");
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    std::path::PathBuf::from(home).join(".docker").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with_tag(tag: &str) -> BuildPlan {
        let dir = tempfile::tempdir().unwrap();
        // leak the tempdir path for the duration of this unit test process;
        // the directory itself just needs to exist for validation.
        let path = Box::leak(Box::new(dir)).path().to_path_buf();
        crate::config::BuildPlan::assemble(
            crate::config::BuildPlanOverrides {
                tag: Some(tag.to_string()),
                ..Default::default()
            },
            &path,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn explicit_credential_only_matches_its_host() {
        let mut plan = plan_with_tag("ghcr.io/org/demo:latest");
        plan.explicit_username = Some("u".to_string());
        plan.explicit_password = Some("p".to_string());
        let output = OutputManager::quiet();
        let chain = AuthChain::new(&plan, &output);

        assert_eq!(
            chain.resolve("ghcr.io").await,
            Some(AuthCredential::Basic {
                user: "u".to_string(),
                secret: "p".to_string()
            })
        );
        // A different host falls through to the rest of the chain (which,
        // absent env vars and a cred file in this test sandbox, is absent).
        assert!(chain.explicit("otherhost.example").is_none());
    }

    #[test]
    fn docker_config_path_respects_docker_config_env() {
        std::env::set_var("DOCKER_CONFIG", "/tmp/dockercfg");
        assert_eq!(docker_config_path(), std::path::PathBuf::from("/tmp/dockercfg/config.json"));
        std::env::remove_var("DOCKER_CONFIG");
    }
}
