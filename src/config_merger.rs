//! Config merger (§4.5): combines the base image config (if any), the
//! project's detected defaults, the framework heuristic's defaults, and the
//! user's build plan into the final image config.

use indexmap::IndexMap;

use crate::base_image::ResolvedBase;
use crate::config::BuildPlan;
use crate::error::{BuildError, Result};
use crate::framework;
use crate::oci::{Digest, ImageConfig, RootFs};
use crate::project::{Framework, ProjectMetadata};

/// Merge everything into the final `ImageConfig`. `dependency_diff_id` and
/// `app_diff_id` are the (optional dependency, mandatory application) layer
/// diff_ids in build order.
pub fn merge(
    plan: &BuildPlan,
    project: &ProjectMetadata,
    base: Option<&ResolvedBase>,
    dependency_diff_id: Option<Digest>,
    app_diff_id: Digest,
) -> Result<ImageConfig> {
    let mut config = ImageConfig::new(plan.platform.os.clone(), plan.platform.architecture.clone());
    config.variant = plan.platform.variant.clone();

    if let Some(base) = base {
        verify_platform_compatibility(plan, base)?;
    }

    config.env = merge_env(plan, base);
    config.labels = merge_labels(plan, base);
    config.working_dir = merge_working_dir(plan, base);
    config.user = base.and_then(|b| b.config.user.clone());

    let argv = resolve_entrypoint(plan, project, base)?;
    let shell_less = base.is_some_and(ResolvedBase::is_shell_less);
    if shell_less {
        config.entrypoint = None;
        config.cmd = Some(argv);
    } else {
        config.entrypoint = Some(argv);
        config.cmd = base.and_then(|b| b.config.cmd.clone());
    }

    let mut diff_ids = base.map(|b| b.diff_ids.clone()).unwrap_or_default();
    diff_ids.extend(dependency_diff_id);
    diff_ids.push(app_diff_id);
    config.rootfs = RootFs::layers(diff_ids);

    Ok(config)
}

fn merge_env(plan: &BuildPlan, base: Option<&ResolvedBase>) -> Vec<String> {
    let mut merged: IndexMap<String, String> = base.map(|b| b.config.env_map()).unwrap_or_default();
    for (key, value) in &plan.env {
        merged.insert(key.clone(), value.clone());
    }
    merged.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

fn merge_labels(plan: &BuildPlan, base: Option<&ResolvedBase>) -> IndexMap<String, String> {
    let mut merged: IndexMap<String, String> = base
        .map(|b| b.config.labels.clone())
        .unwrap_or_default();
    for (key, value) in &plan.labels {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// The user's workdir wins unless it's still the unmodified implementation
/// default, in which case a base image's own `working_dir` takes over —
/// the build-plan layer has already collapsed "not set by CLI or config
/// file" down to that default by the time it reaches this module (§6).
fn merge_working_dir(plan: &BuildPlan, base: Option<&ResolvedBase>) -> Option<String> {
    if plan.workdir != crate::config::DEFAULT_WORKDIR {
        return Some(plan.workdir.clone());
    }
    base.and_then(|b| b.config.working_dir.clone())
        .or_else(|| Some(crate::config::DEFAULT_WORKDIR.to_string()))
}

fn verify_platform_compatibility(plan: &BuildPlan, base: &ResolvedBase) -> Result<()> {
    let matches = base.config.os == plan.platform.os
        && base.config.architecture == plan.platform.architecture
        && (plan.platform.variant.is_none() || plan.platform.variant == base.config.variant);
    if matches {
        Ok(())
    } else {
        Err(BuildError::PlatformMismatch {
            wanted: plan.platform.to_string(),
            base: format!(
                "{}/{}{}",
                base.config.os,
                base.config.architecture,
                base.config.variant.as_deref().map(|v| format!("/{v}")).unwrap_or_default()
            ),
        })
    }
}

/// §4.5: `entrypoint`/`cmd` precedence is user explicit > framework default
/// > project script > base. Modeled here as one combined argv that the
/// caller assigns to either field depending on whether the base image is
/// shell-less.
fn resolve_entrypoint(plan: &BuildPlan, project: &ProjectMetadata, base: Option<&ResolvedBase>) -> Result<Vec<String>> {
    if let Some(explicit) = &plan.entrypoint {
        return Ok(explicit.clone());
    }

    if project.framework != Framework::None {
        let module = if project.framework == Framework::FastApi {
            framework::find_fastapi_module(&project.include_paths, &project.context_root)
        } else {
            None
        };
        if let Some(argv) = framework::default_entrypoint(project.framework, module.as_deref(), crate::project::interpreter_name()) {
            return Ok(argv);
        }
    }

    if let Some(argv) = project.derived_entrypoint(crate::project::interpreter_name()) {
        return Ok(argv);
    }

    if let Some(base) = base {
        if let Some(argv) = &base.config.entrypoint {
            return Ok(argv.clone());
        }
        if let Some(argv) = &base.config.cmd {
            return Ok(argv.clone());
        }
    }

    Err(BuildError::NoEntryPoint)
}
