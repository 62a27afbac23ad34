//! SBOM emitter (§4.12): enumerates the packages that would land in the
//! dependency layer and serializes them as CycloneDX or SPDX. Scope is
//! limited to the project's own ecosystem — OS packages inside base image
//! layers are never enumerated (§1 Non-goals).

use std::path::Path;

use serde::Serialize;

use crate::config::SbomFormat;
use crate::error::{BuildError, Result};
use crate::oci::canonical_json;
use crate::project::{DependenciesSource, ProjectMetadata};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: Option<String>,
}

/// Enumerate packages from whichever dependencies source §4.6 would also
/// build the dependency layer from.
pub fn enumerate_packages(project: &ProjectMetadata) -> Result<Vec<Package>> {
    match &project.dependencies_source {
        DependenciesSource::Virtualenv(venv_path) => enumerate_from_virtualenv(venv_path),
        DependenciesSource::RequirementsFile(path) => enumerate_from_requirements(path),
        DependenciesSource::None => Ok(Vec::new()),
    }
}

/// Packages are named by their `<name>-<version>.dist-info` directories
/// under `site-packages/`, the layout every PEP 427 wheel install leaves.
fn enumerate_from_virtualenv(venv_path: &Path) -> Result<Vec<Package>> {
    let lib_dir = venv_path.join("lib");
    let mut site_packages = None;
    if let Ok(entries) = std::fs::read_dir(&lib_dir) {
        let mut candidates: Vec<_> = entries
            .flatten()
            .map(|e| e.path().join("site-packages"))
            .filter(|p| p.is_dir())
            .collect();
        candidates.sort();
        site_packages = candidates.into_iter().next();
    }
    let Some(site_packages) = site_packages else {
        return Ok(Vec::new());
    };

    let mut packages = Vec::new();
    let entries = std::fs::read_dir(&site_packages).map_err(|e| crate::error::io_err(&site_packages, e))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(stem) = name.strip_suffix(".dist-info") else {
            continue;
        };
        if let Some((pkg_name, version)) = stem.rsplit_once('-') {
            packages.push(Package {
                name: pkg_name.to_string(),
                version: Some(version.to_string()),
            });
        }
    }
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(packages)
}

fn enumerate_from_requirements(path: &Path) -> Result<Vec<Package>> {
    let text = std::fs::read_to_string(path).map_err(|e| crate::error::io_err(path, e))?;
    let mut packages = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            continue;
        }
        let (name, version) = split_requirement_line(line);
        packages.push(Package { name, version });
    }
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(packages)
}

fn split_requirement_line(line: &str) -> (String, Option<String>) {
    if let Some((name, version)) = line.split_once("==") {
        (name.trim().to_string(), Some(version.trim().to_string()))
    } else {
        let cut = line
            .find(|c: char| matches!(c, '<' | '>' | '!' | '~' | ';' | '['))
            .unwrap_or(line.len());
        (line[..cut].trim().to_string(), None)
    }
}

#[derive(Serialize)]
struct CycloneDxComponent {
    #[serde(rename = "type")]
    component_type: &'static str,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Serialize)]
struct CycloneDxDocument {
    #[serde(rename = "bomFormat")]
    bom_format: &'static str,
    #[serde(rename = "specVersion")]
    spec_version: &'static str,
    version: u32,
    components: Vec<CycloneDxComponent>,
}

#[derive(Serialize)]
struct SpdxPackage {
    name: String,
    #[serde(rename = "SPDXID")]
    spdx_id: String,
    #[serde(rename = "versionInfo", skip_serializing_if = "Option::is_none")]
    version_info: Option<String>,
    #[serde(rename = "downloadLocation")]
    download_location: &'static str,
}

#[derive(Serialize)]
struct SpdxDocument {
    #[serde(rename = "spdxVersion")]
    spdx_version: &'static str,
    #[serde(rename = "dataLicense")]
    data_license: &'static str,
    #[serde(rename = "SPDXID")]
    spdx_id: &'static str,
    name: String,
    packages: Vec<SpdxPackage>,
}

/// Serialize `packages` under `format` as a single canonical-JSON document.
pub fn serialize(project_name: &str, packages: &[Package], format: SbomFormat) -> Result<Vec<u8>> {
    match format {
        SbomFormat::CycloneDx => {
            let doc = CycloneDxDocument {
                bom_format: "CycloneDX",
                spec_version: "1.5",
                version: 1,
                components: packages
                    .iter()
                    .map(|p| CycloneDxComponent {
                        component_type: "library",
                        name: p.name.clone(),
                        version: p.version.clone(),
                    })
                    .collect(),
            };
            canonical_json(&doc)
        }
        SbomFormat::Spdx => {
            let doc = SpdxDocument {
                spdx_version: "SPDX-2.3",
                data_license: "CC0-1.0",
                spdx_id: "SPDXRef-DOCUMENT",
                name: project_name.to_string(),
                packages: packages
                    .iter()
                    .map(|p| SpdxPackage {
                        name: p.name.clone(),
                        spdx_id: format!("SPDXRef-Package-{}", sanitize_spdx_id(&p.name)),
                        version_info: p.version.clone(),
                        download_location: "NOASSERTION",
                    })
                    .collect(),
            };
            canonical_json(&doc)
        }
    }
}

fn sanitize_spdx_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Write the SBOM document alongside an image layout at `<root>/sbom.<ext>.json`.
/// Failures here are never fatal to the build (§7: `SBOMGenerationFailed` is
/// the one recoverable error kind) — callers report and continue.
pub fn emit(root: &Path, project: &ProjectMetadata, format: SbomFormat) -> Result<std::path::PathBuf> {
    let packages = enumerate_packages(project).map_err(|e| BuildError::SBOMGenerationFailed(e.to_string()))?;
    let bytes = serialize(&project.name, &packages, format).map_err(|e| BuildError::SBOMGenerationFailed(e.to_string()))?;
    let path = root.join(format!("sbom.{}.json", format.extension()));
    std::fs::write(&path, &bytes).map_err(|e| BuildError::SBOMGenerationFailed(e.to_string()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_line_parses_pinned_version() {
        assert_eq!(
            split_requirement_line("fastapi==0.111.0"),
            ("fastapi".to_string(), Some("0.111.0".to_string()))
        );
    }

    #[test]
    fn requirements_line_without_version() {
        assert_eq!(split_requirement_line("uvicorn[standard]"), ("uvicorn".to_string(), None));
    }

    #[test]
    fn cyclonedx_output_is_canonical_json() {
        let packages = vec![Package {
            name: "fastapi".to_string(),
            version: Some("0.111.0".to_string()),
        }];
        let bytes = serialize("demo", &packages, SbomFormat::CycloneDx).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"bomFormat\":\"CycloneDX\""));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn spdx_output_contains_package_list() {
        let packages = vec![Package {
            name: "flask".to_string(),
            version: None,
        }];
        let bytes = serialize("demo", &packages, SbomFormat::Spdx).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"spdxVersion\":\"SPDX-2.3\""));
        assert!(text.contains("flask"));
    }

    #[test]
    fn enumerate_from_requirements_skips_comments_and_options() {
        let dir = tempfile::tempdir().unwrap();
        let req = dir.path().join("requirements.txt");
        std::fs::write(&req, "# comment\n-r base.txt\nflask==2.3.0\nrequests\n").unwrap();
        let packages = enumerate_from_requirements(&req).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "flask");
    }
}
