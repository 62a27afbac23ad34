//! Build orchestrator (§4.11): the serial backbone that wires project
//! introspection, base image resolution, layer building, config/manifest
//! synthesis, the layout writer, the optional push, and the optional SBOM
//! into one build.

use std::path::PathBuf;
use std::sync::Arc;

use crate::base_image::{self, ResolvedBase};
use crate::cache::BlobStore;
use crate::config::BuildPlan;
use crate::config_merger;
use crate::error::{BuildError, Result};
use crate::layer_builder;
use crate::layout;
use crate::oci::{canonical_json, Descriptor, ImageManifest, MEDIA_TYPE_CONFIG};
use crate::output::OutputManager;
use crate::project::{self, ProjectMetadata};
use crate::registry::{reference, RegistryClient};
use crate::sbom;

pub struct BuildOutcome {
    pub layout_path: PathBuf,
    pub pushed_refs: Option<Vec<String>>,
    pub sbom_path: Option<PathBuf>,
}

/// `reproducible=true` pins every entry's mtime to epoch zero; otherwise the
/// wall-clock time the build ran at stands in for "mtimes come from the
/// source filesystem" (§4.1) — the deterministic tar writer bakes in one
/// mtime for the whole archive rather than per-file timestamps, so this is
/// the closest faithful approximation of "not reproducible" available to it.
fn effective_mtime(plan: &BuildPlan) -> u64 {
    if plan.reproducible {
        0
    } else {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

pub async fn run_build(plan: &BuildPlan, output: &OutputManager) -> Result<BuildOutcome> {
    output.section("Project introspection");
    let project = project::introspect(&plan.context_path, &plan.requirements_file)?;
    output.verbose_msg(&format!(
        "name={} framework={:?} deps={:?}",
        project.name, project.framework, project.dependencies_source
    ));

    let base_reference = plan
        .base_image
        .clone()
        .unwrap_or_else(|| base_image::default_base_image(project.declared_interpreter_range));

    if plan.dry_run {
        output.info(&format!("dry run: would build from base image {base_reference}"));
        output.info(&format!("dry run: tag={} workdir={} push={}", plan.tag, plan.workdir, plan.push));
        return Ok(BuildOutcome {
            layout_path: plan.context_path.join(".pycontainer-out").join(sanitize_dir_name(&plan.tag)),
            pushed_refs: None,
            sbom_path: None,
        });
    }

    let cache = BlobStore::open(&plan.cache_dir).await?;
    let mtime = effective_mtime(plan);

    // Base manifest pull runs concurrently with dependency/application layer
    // collection (§5) — the three draw from independent I/O and only meet
    // again below, in the fixed base->deps->app diff_id order.
    output.section("Base image & layer build");
    let (resolved_base, dependency_layer, app_layer) = tokio::try_join!(
        resolve_base(&base_reference, plan, &cache, output),
        layer_builder::build_dependency_layer(plan, &project, &cache, mtime),
        layer_builder::build_application_layer(plan, &project, &cache, mtime),
    )?;
    output.verbose_msg(&format!(
        "app layer digest={} size={}",
        app_layer.descriptor.digest, app_layer.descriptor.size
    ));

    output.section("Config & manifest synthesis");
    let config = config_merger::merge(
        plan,
        &project,
        resolved_base.as_ref(),
        dependency_layer.as_ref().map(|l| l.diff_id.clone()),
        app_layer.diff_id.clone(),
    )?;
    let config_bytes = canonical_json(&config)?;
    let config_digest = crate::digest::digest_bytes(&config_bytes);
    let config_descriptor = Descriptor::new(MEDIA_TYPE_CONFIG, config_digest.clone(), config_bytes.len() as u64);

    let mut layer_descriptors: Vec<Descriptor> = resolved_base
        .as_ref()
        .map(|b| b.layer_descriptors.clone())
        .unwrap_or_default();
    layer_descriptors.extend(dependency_layer.as_ref().map(|l| l.descriptor.clone()));
    layer_descriptors.push(app_layer.descriptor.clone());

    let manifest = ImageManifest::new(config_descriptor.clone(), layer_descriptors.clone());
    let manifest_bytes = canonical_json(&manifest)?;
    let manifest_digest = crate::digest::digest_bytes(&manifest_bytes);

    output.section("Writing image layout");
    let layout_root = plan.context_path.join(format!(".pycontainer-out/{}", sanitize_dir_name(&plan.tag)));
    let layout_result = layout::write(
        &layout_root,
        &cache,
        &config_bytes,
        &config_digest,
        &layer_descriptors,
        &manifest_bytes,
        &manifest_digest,
        &plan.tag,
    )
    .await?;
    output.success(&format!("layout written to {}", layout_result.root.display()));

    let pushed_refs = if plan.push {
        output.section("Push");
        Some(
            push_layout(
                plan,
                &cache,
                &config_descriptor,
                &config_bytes,
                &layer_descriptors,
                &manifest_bytes,
                &manifest.media_type,
                output,
            )
            .await?,
        )
    } else {
        None
    };

    let sbom_path = match plan.generate_sbom {
        Some(format) => {
            output.section("SBOM");
            match sbom::emit(&layout_result.root, &project, format) {
                Ok(path) => {
                    output.success(&format!("SBOM written to {}", path.display()));
                    Some(path)
                }
                Err(BuildError::SBOMGenerationFailed(reason)) => {
                    output.warning(&format!("SBOM generation failed: {reason}"));
                    None
                }
                Err(e) => return Err(e),
            }
        }
        None => None,
    };

    Ok(BuildOutcome {
        layout_path: layout_result.root,
        pushed_refs,
        sbom_path,
    })
}

async fn resolve_base(
    base_reference: &str,
    plan: &BuildPlan,
    cache: &Arc<BlobStore>,
    output: &OutputManager,
) -> Result<Option<ResolvedBase>> {
    if base_reference.is_empty() {
        return Ok(None);
    }
    output.progress(&format!("resolving base image {base_reference}"));
    let resolved = base_image::resolve(base_reference, &plan.platform, cache, plan, output).await?;
    output.progress_done();
    Ok(Some(resolved))
}

/// Push every local blob not yet on the registry, then the manifest — only
/// after all its referenced blobs are confirmed present (§5 ordering
/// guarantee, §8 invariant 6).
#[allow(clippy::too_many_arguments)]
async fn push_layout(
    plan: &BuildPlan,
    cache: &Arc<BlobStore>,
    config_descriptor: &Descriptor,
    config_bytes: &[u8],
    layer_descriptors: &[Descriptor],
    manifest_bytes: &[u8],
    manifest_media_type: &str,
    output: &OutputManager,
) -> Result<Vec<String>> {
    let image_ref = reference::parse(&plan.tag)?;
    let client = Arc::new(RegistryClient::new(&image_ref.host, plan, output)?);

    client.put_blob(&image_ref.repo, &config_descriptor.digest, config_bytes).await?;

    let uploads = layer_descriptors.iter().map(|descriptor| {
        let client = Arc::clone(&client);
        let cache = Arc::clone(cache);
        let repo = image_ref.repo.clone();
        let digest = descriptor.digest.clone();
        async move {
            let bytes = cache
                .get(&digest)
                .await?
                .ok_or_else(|| BuildError::IoError {
                    path: PathBuf::from(digest.hex()),
                    cause: "layer blob missing from cache at push time".to_string(),
                })?;
            client.put_blob(&repo, &digest, &bytes).await
        }
    });
    futures::future::try_join_all(uploads).await?;

    client
        .put_manifest(&image_ref.repo, &image_ref.as_reference_str(), manifest_bytes, manifest_media_type)
        .await?;

    output.success(&format!("pushed {}", plan.tag));
    Ok(vec![plan.tag.clone()])
}

fn sanitize_dir_name(tag: &str) -> String {
    tag.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' }).collect()
}

pub async fn run_sbom_only(project: &ProjectMetadata, format: crate::config::SbomFormat, out_dir: &std::path::Path) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir).map_err(|e| crate::error::io_err(out_dir, e))?;
    sbom::emit(out_dir, project, format)
}
