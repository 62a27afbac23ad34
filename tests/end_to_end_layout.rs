//! End-to-end layout construction tests, grounded in the "no base image"
//! and "deterministic regardless of traversal order" scenarios: a project
//! with no base image produces a minimal, valid OCI Image Layout, and two
//! builds of the same project content produce byte-identical manifests
//! regardless of how the source tree was populated.

use std::path::Path;

use pycontainer::config::{BuildPlan, BuildPlanOverrides};
use pycontainer::orchestrator;
use pycontainer::output::OutputManager;

fn write_minimal_project(context: &Path) {
    std::fs::write(
        context.join("pyproject.toml"),
        "[project]\nname = \"demo\"\nversion = \"0.1.0\"\n",
    )
    .unwrap();
    std::fs::create_dir(context.join("src")).unwrap();
    std::fs::write(context.join("src/main.py"), "print(\"hi\")\n").unwrap();
}

fn overrides_for(context: &Path, cache_dir: &Path, tag: &str) -> BuildPlanOverrides {
    BuildPlanOverrides {
        tag: Some(tag.to_string()),
        context_path: Some(context.to_path_buf()),
        cache_dir: Some(cache_dir.to_path_buf()),
        // An empty base image short-circuits base resolution entirely, so
        // this build never reaches out to a real registry.
        base_image: Some(String::new()),
        workdir: Some("/app".to_string()),
        reproducible: Some(true),
        ..Default::default()
    }
}

#[tokio::test]
async fn minimal_layout_without_a_base_image() {
    let context = tempfile::tempdir().unwrap();
    write_minimal_project(context.path());
    let cache_dir = tempfile::tempdir().unwrap();

    let plan = BuildPlan::assemble(overrides_for(context.path(), cache_dir.path(), "demo:latest"), context.path()).unwrap();
    let output = OutputManager::quiet();
    let outcome = orchestrator::run_build(&plan, &output).await.unwrap();

    let root = &outcome.layout_path;
    assert!(root.join("oci-layout").is_file());
    assert!(root.join("index.json").is_file());
    assert!(root.join("refs/tags/demo:latest").is_file());

    let blobs_dir = root.join("blobs/sha256");
    let blob_count = std::fs::read_dir(&blobs_dir).unwrap().count();
    // config + manifest + exactly one application layer, no base or
    // dependency layer since there is no base image and no include_deps.
    assert_eq!(blob_count, 3);

    let index_text = std::fs::read_to_string(root.join("index.json")).unwrap();
    assert!(index_text.contains("demo:latest"));

    let layout_marker = std::fs::read_to_string(root.join("oci-layout")).unwrap();
    assert_eq!(layout_marker, r#"{"imageLayoutVersion":"1.0.0"}"#);

    assert!(outcome.pushed_refs.is_none());
    assert!(outcome.sbom_path.is_none());
}

#[tokio::test]
async fn manifest_digest_is_independent_of_file_creation_order() {
    let first_context = tempfile::tempdir().unwrap();
    std::fs::write(
        first_context.path().join("pyproject.toml"),
        "[project]\nname = \"demo\"\nversion = \"0.1.0\"\n",
    )
    .unwrap();
    std::fs::create_dir(first_context.path().join("app")).unwrap();
    for name in ["c.py", "a.py", "b.py"] {
        std::fs::write(first_context.path().join("app").join(name), "x = 1\n").unwrap();
    }

    let second_context = tempfile::tempdir().unwrap();
    std::fs::write(
        second_context.path().join("pyproject.toml"),
        "[project]\nname = \"demo\"\nversion = \"0.1.0\"\n",
    )
    .unwrap();
    std::fs::create_dir(second_context.path().join("app")).unwrap();
    for name in ["b.py", "a.py", "c.py"] {
        std::fs::write(second_context.path().join("app").join(name), "x = 1\n").unwrap();
    }

    let first_cache = tempfile::tempdir().unwrap();
    let first_plan = BuildPlan::assemble(
        overrides_for(first_context.path(), first_cache.path(), "demo:latest"),
        first_context.path(),
    )
    .unwrap();
    let second_cache = tempfile::tempdir().unwrap();
    let second_plan = BuildPlan::assemble(
        overrides_for(second_context.path(), second_cache.path(), "demo:latest"),
        second_context.path(),
    )
    .unwrap();

    let output = OutputManager::quiet();
    let first_outcome = orchestrator::run_build(&first_plan, &output).await.unwrap();
    let second_outcome = orchestrator::run_build(&second_plan, &output).await.unwrap();

    let first_ref = std::fs::read_to_string(first_outcome.layout_path.join("refs/tags/demo:latest")).unwrap();
    let second_ref = std::fs::read_to_string(second_outcome.layout_path.join("refs/tags/demo:latest")).unwrap();
    assert_eq!(first_ref, second_ref);
}

#[tokio::test]
async fn dry_run_writes_nothing_but_still_reports_a_layout_path() {
    let context = tempfile::tempdir().unwrap();
    write_minimal_project(context.path());
    let cache_dir = tempfile::tempdir().unwrap();

    let mut overrides = overrides_for(context.path(), cache_dir.path(), "demo:latest");
    overrides.dry_run = Some(true);
    let plan = BuildPlan::assemble(overrides, context.path()).unwrap();
    let output = OutputManager::quiet();

    let outcome = orchestrator::run_build(&plan, &output).await.unwrap();
    assert!(!outcome.layout_path.join("oci-layout").exists());
    assert!(outcome.pushed_refs.is_none());
    assert!(outcome.sbom_path.is_none());
}

#[tokio::test]
async fn sbom_only_path_writes_a_cyclonedx_document_without_a_full_build() {
    let context = tempfile::tempdir().unwrap();
    write_minimal_project(context.path());
    std::fs::write(context.path().join("requirements.txt"), "flask==2.3.0\n").unwrap();

    let project = pycontainer::project::introspect(context.path(), "requirements.txt").unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let path = orchestrator::run_sbom_only(&project, pycontainer::config::SbomFormat::CycloneDx, out_dir.path())
        .await
        .unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("flask"));
    assert!(text.contains("CycloneDX"));
}
