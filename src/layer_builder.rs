//! Layer builder (§4.6): produces the dependency and application layers.
//!
//! The base layer is never built here — its descriptors and diff_ids come
//! straight from the base image resolver (§4.10); this module only ever
//! materializes the two layers this project's source tree actually owns.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::sidecar::{stat_entry, LayerSidecar, SourceEntry};
use crate::cache::{BlobKind, BlobStore};
use crate::config::BuildPlan;
use crate::error::Result;
use crate::layer_tar::{DeterministicTarWriter, EntryKind};
use crate::oci::{Descriptor, Digest, MEDIA_TYPE_LAYER_TAR, MEDIA_TYPE_LAYER_TAR_GZIP};
use crate::project::{DependenciesSource, ProjectMetadata};

/// Directories and files excluded from the application layer by default
/// (§4.6): compiled cache directories, VCS metadata, editor artifacts.
const DEFAULT_EXCLUDES: &[&str] = &[
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    ".git",
    ".hg",
    ".svn",
    ".DS_Store",
    ".idea",
    ".vscode",
];

pub struct BuiltLayer {
    pub descriptor: Descriptor,
    pub diff_id: Digest,
}

fn trim_leading_slash(workdir: &str) -> String {
    workdir.trim_start_matches('/').to_string()
}

/// Layers are always gzip-compressed on the wire; `reproducible` only
/// governs the mtime baked into the tar, never this.
const GZIP_LAYERS: bool = true;

fn media_type(gzip: bool) -> &'static str {
    if gzip {
        MEDIA_TYPE_LAYER_TAR_GZIP
    } else {
        MEDIA_TYPE_LAYER_TAR
    }
}

/// Collect `(relative_path, kind)` pairs for every regular file and symlink
/// under `root`, skipping directories matched by `excludes` at any depth.
/// Rejects symlinks whose target escapes `root` as `UnsafePath` (§9 open
/// question, resolved conservatively).
fn collect_tree(
    root: &Path,
    current: &Path,
    excludes: &[String],
    out: &mut Vec<(PathBuf, std::fs::Metadata)>,
) -> Result<()> {
    let full = root.join(current);
    let entries = match std::fs::read_dir(&full) {
        Ok(e) => e,
        Err(e) => return Err(crate::error::io_err(&full, e)),
    };
    let mut names: Vec<_> = entries.collect::<std::io::Result<Vec<_>>>().map_err(|e| crate::error::io_err(&full, e))?;
    names.sort_by_key(|e| e.file_name());

    for entry in names {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if excludes.iter().any(|ex| ex == name_str.as_ref()) {
            continue;
        }
        let relative = current.join(&name);
        let metadata = entry.metadata().map_err(|e| crate::error::io_err(root.join(&relative), e))?;
        if metadata.is_dir() {
            collect_tree(root, &relative, excludes, out)?;
        } else {
            out.push((relative, metadata));
        }
    }
    Ok(())
}

fn resolve_symlink_target(root: &Path, relative: &Path) -> Result<String> {
    let full = root.join(relative);
    let target = std::fs::read_link(&full).map_err(|e| crate::error::io_err(&full, e))?;
    let resolved = if target.is_absolute() {
        target.clone()
    } else {
        full.parent().unwrap_or(root).join(&target)
    };
    let normalized = normalize_lexically(&resolved);
    if !normalized.starts_with(&normalize_lexically(root)) {
        return Err(crate::error::BuildError::UnsafePath(full));
    }
    Ok(target.to_string_lossy().replace('\\', "/"))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Write a set of `(relative_path, metadata)` entries into a tar under
/// `archive_root`, returning the finished (hashed, optionally gzipped) layer.
fn materialize(
    context_root: &Path,
    entries: &[(PathBuf, std::fs::Metadata)],
    archive_root: &str,
    mtime: u64,
    gzip: bool,
) -> Result<(crate::layer_tar::FinishedLayer, Vec<SourceEntry>)> {
    let mut writer = DeterministicTarWriter::new(archive_root, mtime);
    let mut sources = Vec::with_capacity(entries.len());

    for (relative, metadata) in entries {
        if metadata.file_type().is_symlink() {
            let target = resolve_symlink_target(context_root, relative)?;
            writer.add_symlink(relative, &target)?;
        } else {
            let kind = if DeterministicTarWriter::is_executable(relative, metadata) {
                EntryKind::Executable
            } else {
                EntryKind::Regular
            };
            let file = std::fs::File::open(context_root.join(relative))
                .map_err(|e| crate::error::io_err(context_root.join(relative), e))?;
            writer.add_file(relative, file, kind)?;
        }
        sources.push(stat_entry(context_root, relative).map_err(|e| crate::error::io_err(context_root.join(relative), e))?);
    }

    let finished = writer.finish(gzip)?;
    Ok((finished, sources))
}

/// Check the cache for a layer already built from an identical source set
/// (ignoring mtime-only changes, §9) and return its digest if so.
/// `no_cache` always forces a rebuild, but — per §9's resolution of the
/// `no_cache` + warm-sidecar open question — the rebuilt result is still
/// installed into the cache afterwards, to preserve the content-addressed
/// invariant.
async fn find_cache_hit(
    cache: &Arc<BlobStore>,
    identity: &str,
    current_sources: &[SourceEntry],
    no_cache: bool,
) -> Option<Digest> {
    if no_cache {
        return None;
    }
    let candidate = cache.read_layer_pointer(identity).await?;
    let sidecar = cache.read_sidecar(&candidate).await?;
    if sidecar.matches_ignoring_mtime(current_sources) && cache.has(&candidate).await {
        Some(candidate)
    } else {
        None
    }
}

async fn install(
    cache: &Arc<BlobStore>,
    identity: &str,
    finished: crate::layer_tar::FinishedLayer,
    sources: Vec<SourceEntry>,
    gzip: bool,
) -> Result<BuiltLayer> {
    let descriptor_digest = cache
        .put_bytes(&finished.compressed_bytes, BlobKind::Layer)
        .await?;
    debug_assert_eq!(descriptor_digest, finished.descriptor_digest);
    cache
        .write_sidecar(&finished.descriptor_digest, &LayerSidecar::from_entries(sources))
        .await?;
    cache.write_layer_pointer(identity, &finished.descriptor_digest).await?;

    Ok(BuiltLayer {
        descriptor: Descriptor::new(media_type(gzip), finished.descriptor_digest, finished.compressed_size),
        diff_id: finished.diff_id,
    })
}

/// Build the dependency layer, if `plan.include_deps` is set and a
/// dependencies source was detected. Packs a virtualenv's site-packages
/// under `<workdir>/site-packages/`, or a requirements file verbatim under
/// `<workdir>/` — the pipeline performs no resolution of its own.
pub async fn build_dependency_layer(
    plan: &BuildPlan,
    project: &ProjectMetadata,
    cache: &Arc<BlobStore>,
    mtime: u64,
) -> Result<Option<BuiltLayer>> {
    if !plan.include_deps {
        return Ok(None);
    }

    let workdir_prefix = trim_leading_slash(&plan.workdir);
    let (archive_root, source_root, relative_entries) = match &project.dependencies_source {
        DependenciesSource::Virtualenv(venv_path) => {
            let site_packages = find_site_packages(venv_path)?;
            let mut entries = Vec::new();
            collect_tree(&site_packages, Path::new(""), &[], &mut entries)?;
            (
                format!("{workdir_prefix}/site-packages"),
                site_packages,
                entries,
            )
        }
        DependenciesSource::RequirementsFile(req_path) => {
            let parent = req_path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let file_name = req_path.file_name().unwrap_or_default();
            let metadata = std::fs::metadata(req_path).map_err(|e| crate::error::io_err(req_path, e))?;
            (
                workdir_prefix.clone(),
                parent,
                vec![(PathBuf::from(file_name), metadata)],
            )
        }
        DependenciesSource::None => return Ok(None),
    };

    let identity = format!("deps:{}", plan.workdir);
    let current_sources: Vec<SourceEntry> = relative_entries
        .iter()
        .map(|(path, _)| stat_entry(&source_root, path))
        .collect::<std::io::Result<_>>()
        .map_err(|e| crate::error::io_err(&source_root, e))?;

    if let Some(digest) = find_cache_hit(cache, &identity, &current_sources, plan.no_cache).await {
        let size = cache.entry_size(&digest).await.unwrap_or(0);
        return Ok(Some(BuiltLayer {
            descriptor: Descriptor::new(MEDIA_TYPE_LAYER_TAR_GZIP, digest.clone(), size),
            diff_id: digest,
        }));
    }

    let (finished, sources) = materialize(&source_root, &relative_entries, &archive_root, mtime, GZIP_LAYERS)?;
    Ok(Some(install(cache, &identity, finished, sources, GZIP_LAYERS).await?))
}

/// Build the application layer from the project's include paths, packed
/// under `<workdir>/`.
pub async fn build_application_layer(
    plan: &BuildPlan,
    project: &ProjectMetadata,
    cache: &Arc<BlobStore>,
    mtime: u64,
) -> Result<BuiltLayer> {
    let workdir_prefix = trim_leading_slash(&plan.workdir);
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(plan.exclude.iter().cloned());

    let mut entries = Vec::new();
    for include_path in &project.include_paths {
        let full = project.context_root.join(include_path);
        let metadata = std::fs::metadata(&full).map_err(|e| crate::error::io_err(&full, e))?;
        if metadata.is_dir() {
            collect_tree(&project.context_root, include_path, &excludes, &mut entries)?;
        } else {
            entries.push((include_path.clone(), metadata));
        }
    }

    let identity = format!("app:{}", plan.workdir);
    let current_sources: Vec<SourceEntry> = entries
        .iter()
        .map(|(path, _)| stat_entry(&project.context_root, path))
        .collect::<std::io::Result<_>>()
        .map_err(|e| crate::error::io_err(&project.context_root, e))?;

    if let Some(digest) = find_cache_hit(cache, &identity, &current_sources, plan.no_cache).await {
        let size = cache.entry_size(&digest).await.unwrap_or(0);
        return Ok(BuiltLayer {
            descriptor: Descriptor::new(MEDIA_TYPE_LAYER_TAR_GZIP, digest.clone(), size),
            diff_id: digest,
        });
    }

    let (finished, sources) = materialize(&project.context_root, &entries, &workdir_prefix, mtime, GZIP_LAYERS)?;
    install(cache, &identity, finished, sources, GZIP_LAYERS).await
}

/// Find `<venv>/lib/python*/site-packages`, taking the first (lexicographically
/// earliest) match if more than one interpreter's directory exists.
fn find_site_packages(venv_path: &Path) -> Result<PathBuf> {
    let lib_dir = venv_path.join("lib");
    let mut candidates = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&lib_dir) {
        for entry in entries.flatten() {
            let path = entry.path().join("site-packages");
            if path.is_dir() {
                candidates.push(path);
            }
        }
    }
    candidates.sort();
    candidates.into_iter().next().ok_or_else(|| {
        crate::error::BuildError::ProjectMetadataMissing(format!(
            "no site-packages directory found under {}",
            lib_dir.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildPlan, BuildPlanOverrides};
    use crate::project::Framework;
    use indexmap::IndexMap;

    fn plan_for(dir: &Path, include_deps: bool) -> BuildPlan {
        let mut plan = BuildPlan::assemble(
            BuildPlanOverrides {
                tag: Some("demo:latest".to_string()),
                ..Default::default()
            },
            dir,
        )
        .unwrap();
        plan.include_deps = include_deps;
        plan
    }

    fn project_for(dir: &Path, include_paths: Vec<PathBuf>) -> ProjectMetadata {
        ProjectMetadata {
            name: "demo".to_string(),
            version: "0.1.0".to_string(),
            declared_interpreter_range: None,
            script_map: IndexMap::new(),
            dependencies_source: DependenciesSource::None,
            framework: Framework::None,
            include_paths,
            context_root: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn application_layer_is_deterministic_and_reusable() {
        let context = tempfile::tempdir().unwrap();
        std::fs::write(context.path().join("main.py"), "print('hi')\n").unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = BlobStore::open(cache_dir.path()).await.unwrap();

        let plan = plan_for(context.path(), false);
        let project = project_for(context.path(), vec![PathBuf::from("main.py")]);

        let first = build_application_layer(&plan, &project, &cache, 0).await.unwrap();
        let second = build_application_layer(&plan, &project, &cache, 0).await.unwrap();

        assert_eq!(first.diff_id, second.diff_id);
        assert_eq!(first.descriptor.digest, second.descriptor.digest);
    }

    #[tokio::test]
    async fn excluded_directories_never_reach_the_layer() {
        let context = tempfile::tempdir().unwrap();
        std::fs::write(context.path().join("main.py"), "print('hi')\n").unwrap();
        std::fs::create_dir(context.path().join("__pycache__")).unwrap();
        std::fs::write(context.path().join("__pycache__/main.cpython-311.pyc"), b"x").unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = BlobStore::open(cache_dir.path()).await.unwrap();
        let plan = plan_for(context.path(), false);
        let project = project_for(context.path(), vec![PathBuf::from(".")]);

        let with_cache_dir = build_application_layer(&plan, &project, &cache, 0).await.unwrap();

        std::fs::remove_dir_all(context.path().join("__pycache__")).unwrap();
        let cache_dir2 = tempfile::tempdir().unwrap();
        let cache2 = BlobStore::open(cache_dir2.path()).await.unwrap();
        let without_cache_dir = build_application_layer(&plan, &project, &cache2, 0).await.unwrap();

        assert_eq!(with_cache_dir.descriptor.digest, without_cache_dir.descriptor.digest);
    }

    #[test]
    fn rejects_symlink_escaping_context_root() {
        let context = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.py"), "x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(outside.path().join("secret.py"), context.path().join("link.py")).unwrap();

        #[cfg(unix)]
        {
            let err = resolve_symlink_target(context.path(), Path::new("link.py")).unwrap_err();
            assert!(matches!(err, crate::error::BuildError::UnsafePath(_)));
        }
    }
}
