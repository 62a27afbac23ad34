//! Project introspection: reads the project manifest in the context root and
//! derives the include set, dependency source, declared interpreter range,
//! and entry point.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{BuildError, Result};

pub const PYPROJECT_FILENAME: &str = "pyproject.toml";
const VENV_CANDIDATES: [&str; 3] = ["venv", ".venv", "env"];
const PYTHON_INTERPRETER: &str = "python";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependenciesSource {
    Virtualenv(PathBuf),
    RequirementsFile(PathBuf),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    FastApi,
    Flask,
    Django,
    None,
}

impl Framework {
    /// The default container port this framework exposes, if any.
    pub fn default_port(self) -> Option<u16> {
        match self {
            Framework::FastApi => Some(8000),
            Framework::Flask => Some(5000),
            Framework::Django => Some(8000),
            Framework::None => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectMetadata {
    pub name: String,
    pub version: String,
    pub declared_interpreter_range: Option<(u32, u32)>,
    pub script_map: IndexMap<String, String>,
    pub dependencies_source: DependenciesSource,
    pub framework: Framework,
    pub include_paths: Vec<PathBuf>,
    pub context_root: PathBuf,
}

impl ProjectMetadata {
    /// The entry point argv derived from the first declared script, or a
    /// framework/fallback default. `None` only when the user has disabled
    /// all fallbacks and neither a script nor a framework was found.
    pub fn derived_entrypoint(&self, interpreter: &str) -> Option<Vec<String>> {
        if let Some((_, target)) = self.script_map.first() {
            return Some(script_target_to_argv(target, interpreter));
        }
        if self.framework != Framework::None {
            return None; // caller applies the framework default instead
        }
        Some(vec![interpreter.to_string(), "-m".to_string(), "app".to_string()])
    }
}

/// `pkg.mod:func` -> `["<interpreter>", "-m", "pkg.mod"]`.
fn script_target_to_argv(target: &str, interpreter: &str) -> Vec<String> {
    let module = target.split(':').next().unwrap_or(target);
    vec![interpreter.to_string(), "-m".to_string(), module.to_string()]
}

/// `pyproject.toml` is an extensible format owned by other tools (build
/// backends, linters, etc.) — unlike the project's own config file, unknown
/// tables/keys here are never an error; we only ever read the handful of
/// `[project]` keys this introspector actually needs.
#[derive(Debug, Deserialize)]
struct PyProjectRaw {
    project: Option<ProjectSection>,
}

#[derive(Debug, Deserialize)]
struct ProjectSection {
    name: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(rename = "requires-python", default)]
    requires_python: Option<String>,
    #[serde(default)]
    scripts: IndexMap<String, String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

/// Parse the first `>=X.Y` clause out of a PEP 440-ish specifier string.
/// Later comma-separated clauses (e.g. `<4.0`) are ignored, matching the
/// "only the first >= clause is honored" rule.
fn parse_interpreter_range(spec: &str) -> Option<(u32, u32)> {
    spec.split(',').find_map(|clause| {
        let clause = clause.trim();
        let rest = clause.strip_prefix(">=")?;
        let mut parts = rest.splitn(3, '.');
        let major: u32 = parts.next()?.trim().parse().ok()?;
        let minor: u32 = parts.next().unwrap_or("0").trim().parse().ok()?;
        Some((major, minor))
    })
}

/// Reads `pyproject.toml` under `context_root` and produces `ProjectMetadata`.
/// Missing fields fail fast with `ProjectMetadataMissing`; a missing file
/// yields a metadata record with only filesystem-derived defaults.
pub fn introspect(context_root: &Path, requirements_filename: &str) -> Result<ProjectMetadata> {
    if !context_root.is_dir() {
        return Err(BuildError::ProjectNotFound(context_root.to_path_buf()));
    }

    let manifest_path = context_root.join(PYPROJECT_FILENAME);
    let (name, version, declared_interpreter_range, script_map, dependencies) =
        match std::fs::read_to_string(&manifest_path) {
            Ok(text) => {
                let raw: PyProjectRaw = toml::from_str(&text)
                    .map_err(|e| BuildError::ProjectMetadataMissing(e.to_string()))?;
                let project = raw.project.ok_or_else(|| {
                    BuildError::ProjectMetadataMissing("missing [project] table".to_string())
                })?;
                let range = project
                    .requires_python
                    .as_deref()
                    .and_then(parse_interpreter_range);
                (
                    project.name,
                    project.version,
                    range,
                    project.scripts,
                    project.dependencies,
                )
            }
            Err(_) => (
                context_root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "app".to_string()),
                "0.0.0".to_string(),
                None,
                IndexMap::new(),
                Vec::new(),
            ),
        };

    let include_paths = detect_include_paths(context_root, &name, &manifest_path, requirements_filename);
    let dependencies_source = detect_dependencies_source(context_root, requirements_filename);
    let framework = crate::framework::detect(context_root, &dependencies, &include_paths);

    Ok(ProjectMetadata {
        name,
        version,
        declared_interpreter_range,
        script_map,
        dependencies_source,
        framework,
        include_paths,
        context_root: context_root.to_path_buf(),
    })
}

/// `src/` else `app/` else a directory matching the project name; the
/// project manifest and a requirements file (if present) are always
/// included on top of that.
fn detect_include_paths(
    context_root: &Path,
    project_name: &str,
    manifest_path: &Path,
    requirements_filename: &str,
) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if context_root.join("src").is_dir() {
        paths.push(PathBuf::from("src"));
    } else if context_root.join("app").is_dir() {
        paths.push(PathBuf::from("app"));
    } else if !project_name.is_empty() && context_root.join(project_name).is_dir() {
        paths.push(PathBuf::from(project_name));
    }

    if manifest_path.is_file() {
        paths.push(PathBuf::from(PYPROJECT_FILENAME));
    }
    let requirements_path = context_root.join(requirements_filename);
    if requirements_path.is_file() {
        paths.push(PathBuf::from(requirements_filename));
    }
    paths
}

fn detect_dependencies_source(context_root: &Path, requirements_filename: &str) -> DependenciesSource {
    for candidate in VENV_CANDIDATES {
        let venv_path = context_root.join(candidate);
        if venv_path.is_dir() {
            return DependenciesSource::Virtualenv(venv_path);
        }
    }
    let requirements_path = context_root.join(requirements_filename);
    if requirements_path.is_file() {
        return DependenciesSource::RequirementsFile(requirements_path);
    }
    DependenciesSource::None
}

/// The interpreter binary name used in derived entrypoints and the `-m`
/// site-packages path; fixed to `python` (the pipeline targets CPython base
/// images exclusively).
pub fn interpreter_name() -> &'static str {
    PYTHON_INTERPRETER
}
