//! Build plan assembly: merges CLI overrides, a project-local config file,
//! and implementation defaults into one validated `BuildPlan`. Unknown keys
//! in the config file are a hard `InvalidConfig` — "unknown keys fail fast".

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{BuildError, Result};
use crate::oci::Platform;

pub const CONFIG_FILENAME: &str = "pycontainer.toml";
pub const DEFAULT_WORKDIR: &str = "/app";
pub const DEFAULT_REQUIREMENTS_FILE: &str = "requirements.txt";
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbomFormat {
    CycloneDx,
    Spdx,
}

impl SbomFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cyclonedx" => Ok(SbomFormat::CycloneDx),
            "spdx" => Ok(SbomFormat::Spdx),
            other => Err(BuildError::InvalidConfig(format!(
                "unrecognized SBOM format: {other} (expected cyclonedx or spdx)"
            ))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SbomFormat::CycloneDx => "cyclonedx",
            SbomFormat::Spdx => "spdx",
        }
    }
}

/// The fully merged and validated configuration for one build. Constructed
/// once per build and immutable thereafter.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub tag: String,
    pub context_path: PathBuf,
    pub workdir: String,
    pub env: IndexMap<String, String>,
    pub labels: IndexMap<String, String>,
    pub base_image: Option<String>,
    pub include_deps: bool,
    pub requirements_file: String,
    pub entrypoint: Option<Vec<String>>,
    pub platform: Platform,
    pub push: bool,
    pub registry: Option<String>,
    pub cache_dir: PathBuf,
    pub no_cache: bool,
    pub reproducible: bool,
    pub generate_sbom: Option<SbomFormat>,
    pub verbose: bool,
    pub dry_run: bool,
    pub exclude: Vec<String>,
    pub explicit_username: Option<String>,
    pub explicit_password: Option<String>,
}

/// Every field the CLI (or any other embedder) may supply; `None` means
/// "not set by this source", letting the merge fall through to the config
/// file and then to defaults.
#[derive(Debug, Clone, Default)]
pub struct BuildPlanOverrides {
    pub tag: Option<String>,
    pub context_path: Option<PathBuf>,
    pub workdir: Option<String>,
    pub env: IndexMap<String, String>,
    pub labels: IndexMap<String, String>,
    pub base_image: Option<String>,
    pub include_deps: Option<bool>,
    pub requirements_file: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub platform: Option<String>,
    pub push: Option<bool>,
    pub registry: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub no_cache: Option<bool>,
    pub reproducible: Option<bool>,
    pub generate_sbom: Option<String>,
    pub verbose: Option<bool>,
    pub dry_run: Option<bool>,
    pub exclude: Vec<String>,
    pub explicit_username: Option<String>,
    pub explicit_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    build: BuildSection,
    #[serde(default)]
    registry: RegistrySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildSection {
    tag: Option<String>,
    context_path: Option<PathBuf>,
    workdir: Option<String>,
    #[serde(default)]
    env: IndexMap<String, String>,
    #[serde(default)]
    labels: IndexMap<String, String>,
    base_image: Option<String>,
    include_deps: Option<bool>,
    requirements_file: Option<String>,
    entrypoint: Option<Vec<String>>,
    platform: Option<String>,
    push: Option<bool>,
    registry: Option<String>,
    cache_dir: Option<PathBuf>,
    no_cache: Option<bool>,
    reproducible: Option<bool>,
    generate_sbom: Option<String>,
    verbose: Option<bool>,
    dry_run: Option<bool>,
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistrySection {
    username: Option<String>,
    password: Option<String>,
}

fn default_cache_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("pycontainer");
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".cache").join("pycontainer")
}

impl BuildPlan {
    /// Load `pycontainer.toml` from `context_path` if present, overlay
    /// `overrides`, apply defaults, and validate the result.
    pub fn assemble(overrides: BuildPlanOverrides, context_path: &Path) -> Result<Self> {
        let config_path = context_path.join(CONFIG_FILENAME);
        let file = if config_path.is_file() {
            let text = std::fs::read_to_string(&config_path)
                .map_err(|e| crate::error::io_err(&config_path, e))?;
            toml::from_str(&text)?
        } else {
            ConfigFile::default()
        };

        let tag = overrides
            .tag
            .or(file.build.tag)
            .ok_or_else(|| BuildError::InvalidConfig("tag is required".to_string()))?;

        let context_path = overrides
            .context_path
            .or(file.build.context_path)
            .unwrap_or_else(|| PathBuf::from("."));

        let workdir = overrides
            .workdir
            .or(file.build.workdir)
            .unwrap_or_else(|| DEFAULT_WORKDIR.to_string());

        let mut env = file.build.env;
        env.extend(overrides.env);

        let mut labels = file.build.labels;
        labels.extend(overrides.labels);

        let platform_spec = overrides
            .platform
            .or(file.build.platform)
            .unwrap_or_else(|| DEFAULT_PLATFORM.to_string());
        let platform = Platform::parse(&platform_spec)?;

        let generate_sbom = match overrides.generate_sbom.or(file.build.generate_sbom) {
            Some(spec) => Some(SbomFormat::parse(&spec)?),
            None => None,
        };

        let mut exclude = file.build.exclude;
        exclude.extend(overrides.exclude);

        let plan = BuildPlan {
            tag,
            context_path,
            workdir,
            env,
            labels,
            base_image: overrides.base_image.or(file.build.base_image),
            include_deps: overrides.include_deps.or(file.build.include_deps).unwrap_or(false),
            requirements_file: overrides
                .requirements_file
                .or(file.build.requirements_file)
                .unwrap_or_else(|| DEFAULT_REQUIREMENTS_FILE.to_string()),
            entrypoint: overrides.entrypoint.or(file.build.entrypoint),
            platform,
            push: overrides.push.or(file.build.push).unwrap_or(false),
            registry: overrides.registry.or(file.build.registry),
            cache_dir: overrides
                .cache_dir
                .or(file.build.cache_dir)
                .unwrap_or_else(default_cache_dir),
            no_cache: overrides.no_cache.or(file.build.no_cache).unwrap_or(false),
            reproducible: overrides.reproducible.or(file.build.reproducible).unwrap_or(true),
            generate_sbom,
            verbose: overrides.verbose.or(file.build.verbose).unwrap_or(false),
            dry_run: overrides.dry_run.or(file.build.dry_run).unwrap_or(false),
            exclude,
            explicit_username: overrides.explicit_username.or(file.registry.username),
            explicit_password: overrides.explicit_password.or(file.registry.password),
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if self.tag.trim().is_empty() {
            return Err(BuildError::InvalidConfig("tag must not be empty".to_string()));
        }
        if !self.context_path.is_dir() {
            return Err(BuildError::ProjectNotFound(self.context_path.clone()));
        }
        if (self.explicit_username.is_some()) != (self.explicit_password.is_some()) {
            return Err(BuildError::InvalidConfig(
                "registry username and password must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// The registry authority this build pushes to: the explicit override,
    /// else the authority embedded in `tag`.
    pub fn push_registry_host(&self) -> &str {
        self.registry
            .as_deref()
            .unwrap_or_else(|| crate::registry::reference::host_of(&self.tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_tag() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = BuildPlanOverrides::default();
        let err = BuildPlan::assemble(overrides, dir.path()).unwrap_err();
        assert!(matches!(err, BuildError::InvalidConfig(_)));
    }

    #[test]
    fn defaults_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = BuildPlanOverrides {
            tag: Some("demo:latest".to_string()),
            ..Default::default()
        };
        let plan = BuildPlan::assemble(overrides, dir.path()).unwrap();
        assert_eq!(plan.workdir, DEFAULT_WORKDIR);
        assert!(plan.reproducible);
        assert!(!plan.push);
        assert_eq!(plan.platform.os, "linux");
    }

    #[test]
    fn config_file_is_overridden_by_explicit_plan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            "[build]\ntag = \"from-file:latest\"\nworkdir = \"/srv\"\n",
        )
        .unwrap();
        let overrides = BuildPlanOverrides {
            tag: Some("from-cli:latest".to_string()),
            ..Default::default()
        };
        let plan = BuildPlan::assemble(overrides, dir.path()).unwrap();
        assert_eq!(plan.tag, "from-cli:latest");
        assert_eq!(plan.workdir, "/srv");
    }

    #[test]
    fn unknown_config_key_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILENAME), "[build]\nbogus = 1\n").unwrap();
        let overrides = BuildPlanOverrides {
            tag: Some("demo:latest".to_string()),
            ..Default::default()
        };
        assert!(BuildPlan::assemble(overrides, dir.path()).is_err());
    }
}
