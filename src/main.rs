//! Thin CLI shell: translates flags into a `BuildPlanOverrides`/`BuildPlan`
//! and calls straight into the core. No logic of its own beyond that
//! translation.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use indexmap::IndexMap;

use pycontainer::cache::BlobStore;
use pycontainer::config::{BuildPlan, BuildPlanOverrides};
use pycontainer::error::Result;
use pycontainer::output::OutputManager;
use pycontainer::{orchestrator, project};

#[derive(Parser, Debug)]
#[command(name = "pycontainer")]
#[command(about = "Daemonless OCI image builder for interpreted-language projects")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an OCI image layout from a project directory
    Build(BuildArgs),
    /// Build and push an image to a registry
    Push(BuildArgs),
    /// Emit an SBOM for a project's dependencies
    Sbom(SbomArgs),
    /// Inspect or prune the local blob cache
    Cache(CacheArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct BuildArgs {
    /// Image tag, e.g. ghcr.io/org/app:latest
    #[arg(long)]
    tag: String,

    /// Project context directory
    #[arg(long, default_value = ".")]
    context: PathBuf,

    /// Working directory inside the image
    #[arg(long)]
    workdir: Option<String>,

    /// Environment variables, KEY=VALUE, repeatable
    #[arg(long = "env", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// OCI labels, KEY=VALUE, repeatable
    #[arg(long = "label", value_parser = parse_key_value)]
    labels: Vec<(String, String)>,

    /// Base image reference; defaults to a derived python:<X>.<Y>-slim
    #[arg(long)]
    base_image: Option<String>,

    /// Include a dependency layer built from a virtualenv or requirements file
    #[arg(long)]
    include_deps: bool,

    /// Requirements filename to look for in the context directory
    #[arg(long)]
    requirements_file: Option<String>,

    /// Override entrypoint argv, comma-separated
    #[arg(long, value_delimiter = ',')]
    entrypoint: Option<Vec<String>>,

    /// Target platform, os/arch[/variant]
    #[arg(long)]
    platform: Option<String>,

    /// Push the built image to a registry
    #[arg(long)]
    push: bool,

    /// Registry authority override
    #[arg(long)]
    registry: Option<String>,

    /// Blob cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Ignore cached layers and rebuild everything
    #[arg(long)]
    no_cache: bool,

    /// Pin layer mtimes to produce byte-identical layers across builds
    #[arg(long)]
    reproducible: Option<bool>,

    /// Emit an SBOM alongside the layout: cyclonedx or spdx
    #[arg(long)]
    sbom: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log the build plan and exit without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Additional paths to exclude from the application layer, repeatable
    #[arg(long = "exclude")]
    exclude: Vec<String>,

    /// Registry username (requires --password)
    #[arg(long)]
    username: Option<String>,

    /// Registry password (requires --username)
    #[arg(long)]
    password: Option<String>,
}

impl BuildArgs {
    fn into_overrides(self, force_push: bool) -> BuildPlanOverrides {
        let mut env = IndexMap::new();
        env.extend(self.env);
        let mut labels = IndexMap::new();
        labels.extend(self.labels);

        BuildPlanOverrides {
            tag: Some(self.tag),
            context_path: Some(self.context),
            workdir: self.workdir,
            env,
            labels,
            base_image: self.base_image,
            include_deps: if self.include_deps { Some(true) } else { None },
            requirements_file: self.requirements_file,
            entrypoint: self.entrypoint,
            platform: self.platform,
            push: Some(self.push || force_push),
            registry: self.registry,
            cache_dir: self.cache_dir,
            no_cache: if self.no_cache { Some(true) } else { None },
            reproducible: self.reproducible,
            generate_sbom: self.sbom,
            verbose: if self.verbose { Some(true) } else { None },
            dry_run: if self.dry_run { Some(true) } else { None },
            exclude: self.exclude,
            explicit_username: self.username,
            explicit_password: self.password,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct SbomArgs {
    /// Project context directory
    #[arg(long, default_value = ".")]
    context: PathBuf,

    /// Requirements filename to look for in the context directory
    #[arg(long, default_value = "requirements.txt")]
    requirements_file: String,

    /// SBOM schema: cyclonedx or spdx
    #[arg(long, default_value = "cyclonedx")]
    format: String,

    /// Directory the SBOM file is written into
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
struct CacheArgs {
    #[command(subcommand)]
    action: CacheAction,
}

#[derive(Subcommand, Debug, Clone)]
enum CacheAction {
    /// Evict least-recently-used entries until the cache is at most this size
    Sweep {
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        #[arg(long)]
        target_bytes: u64,
    },
    /// Remove every blob from the cache
    Clear {
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
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

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            OutputManager::new(false).error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Build(args) => run_build(args, false).await,
        Commands::Push(args) => run_build(args, true).await,
        Commands::Sbom(args) => run_sbom(args).await,
        Commands::Cache(args) => run_cache(args).await,
    }
}

async fn run_build(args: BuildArgs, force_push: bool) -> Result<()> {
    let context = args.context.clone();
    let verbose = args.verbose;
    let overrides = args.into_overrides(force_push);
    let plan = BuildPlan::assemble(overrides, &context)?;
    let output = OutputManager::new(verbose);
    let outcome = orchestrator::run_build(&plan, &output).await?;

    output.info(&format!("image layout: {}", outcome.layout_path.display()));
    if let Some(refs) = &outcome.pushed_refs {
        for r in refs {
            output.info(&format!("pushed: {r}"));
        }
    }
    if let Some(sbom_path) = &outcome.sbom_path {
        output.info(&format!("sbom: {}", sbom_path.display()));
    }
    output.verbose_msg(&format!("elapsed: {:?}", output.elapsed()));
    Ok(())
}

async fn run_sbom(args: SbomArgs) -> Result<()> {
    let format = pycontainer::config::SbomFormat::parse(&args.format)?;
    let project = project::introspect(&args.context, &args.requirements_file)?;
    let path = orchestrator::run_sbom_only(&project, format, &args.output_dir).await?;
    OutputManager::new(false).success(&format!("SBOM written to {}", path.display()));
    Ok(())
}

async fn run_cache(args: CacheArgs) -> Result<()> {
    let output = OutputManager::new(false);
    match args.action {
        CacheAction::Sweep { cache_dir, target_bytes } => {
            let cache_dir = cache_dir.unwrap_or_else(default_cache_dir);
            let store = BlobStore::open(&cache_dir).await?;
            store.sweep(target_bytes).await?;
            output.success(&format!("cache at {} swept to at most {target_bytes} bytes", cache_dir.display()));
        }
        CacheAction::Clear { cache_dir } => {
            let cache_dir = cache_dir.unwrap_or_else(default_cache_dir);
            let store = BlobStore::open(&cache_dir).await?;
            store.sweep(0).await?;
            output.success(&format!("cache at {} cleared", cache_dir.display()));
        }
    }
    Ok(())
}
