use std::path::PathBuf;

use anyhow::{Result, bail};
use catalogtool_core::config::{CatalogToolConfig, load_config};
use catalogtool_core::external::{AssetFetcher, HttpFetcher};
use catalogtool_core::fallbacks::{FallbackOptions, FallbackSource, run_fallbacks};
use catalogtool_core::migrate::{
    MigrateOptions, RunReport, VerificationReport, run_migration, run_verification,
};
use catalogtool_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    normalize_for_display as normalize_path, resolve_paths,
};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "catalogtool",
    version,
    about = "Repair storefront catalog links and mirror CDN images locally"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Directory holding the catalog JSON files")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Write .catalogtool/config.toml and create the image directories")]
    Init(InitArgs),
    #[command(about = "Show resolved paths, catalog files and mirror counts")]
    Status,
    #[command(about = "Rewrite links and localize images, then verify")]
    Run(PassArgs),
    #[command(about = "Rewrite links only")]
    Links(PassArgs),
    #[command(about = "Localize images only")]
    Assets(PassArgs),
    #[command(about = "Count remaining CDN images and absolute own-domain links")]
    Verify,
    #[command(about = "Suggest cover images for collections that have none")]
    Fallbacks(FallbackArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct PassArgs {
    #[arg(long, help = "Compute changes and print diffs without writing anything")]
    dry_run: bool,
    #[arg(long, help = "Never fetch images; report unmirrored references as missing")]
    no_download: bool,
    #[arg(long, value_name = "N", help = "Worker threads (overrides [http] workers)")]
    workers: Option<usize>,
    #[arg(long, help = "Print the full report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct FallbackArgs {
    #[arg(long, default_value_t = 5)]
    min_products: u64,
    #[arg(long, default_value_t = 30)]
    limit: usize,
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    All,
    Links,
    Assets,
}

impl Pass {
    fn label(self) -> &'static str {
        match self {
            Self::All => "run",
            Self::Links => "links",
            Self::Assets => "assets",
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Run(args)) => run_pass(&runtime, Pass::All, args),
        Some(Commands::Links(args)) => run_pass(&runtime, Pass::Links, args),
        Some(Commands::Assets(args)) => run_pass(&runtime, Pass::Assets, args),
        Some(Commands::Verify) => run_verify(&runtime),
        Some(Commands::Fallbacks(args)) => run_fallback_report(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let report = init_layout(&paths, &config, &InitOptions { force: args.force })?;

    println!("Initialized catalogtool layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!(
        "products_dir: {}",
        normalize_path(&paths.products_dir(&config.assets))
    );
    println!(
        "collections_dir: {}",
        normalize_path(&paths.collections_dir(&config.assets))
    );
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let status = inspect_runtime(&paths, &config)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    for file in &status.catalog_files {
        println!(
            "catalog.{}: {}",
            file.path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            file.size_bytes
                .map(|size| format!("{size} bytes"))
                .unwrap_or_else(|| "missing".to_string())
        );
    }
    println!("products_dir: {}", normalize_path(&status.products_dir));
    println!("product_images: {}", format_count(status.product_images));
    println!("collections_dir: {}", normalize_path(&status.collections_dir));
    println!(
        "collection_images: {}",
        format_count(status.collection_images)
    );
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_pass(runtime: &RuntimeOptions, pass: Pass, args: PassArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let settings = config.http_settings();
    let options = MigrateOptions {
        rewrite_links: matches!(pass, Pass::All | Pass::Links),
        localize_assets: matches!(pass, Pass::All | Pass::Assets),
        download: !args.no_download,
        dry_run: args.dry_run,
        workers: args.workers,
    };

    let http = if options.localize_assets && options.download && !options.dry_run {
        Some(HttpFetcher::new(&settings)?)
    } else {
        None
    };
    let fetcher = http.as_ref().map(|fetcher| fetcher as &dyn AssetFetcher);
    let report = run_migration(&paths, &config, &settings, &options, fetcher)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_report(pass, &report);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_run_report(pass: Pass, report: &RunReport) {
    println!("{} report", pass.label());
    println!("dry_run: {}", report.dry_run);
    for file in &report.files {
        println!(
            "{}: records={} links_fixed={} assets_updated={} downloaded={} failed={} missing={} record_failures={}",
            file.file,
            file.records,
            file.links_fixed,
            file.assets.updated,
            file.assets.downloaded,
            file.assets.failed,
            file.assets.missing,
            file.record_failures
        );
    }
    println!("links_fixed: {}", report.links_fixed);
    println!("assets_updated: {}", report.assets.updated);
    println!("assets_downloaded: {}", report.assets.downloaded);
    println!("assets_failed: {}", report.assets.failed);
    println!("assets_missing: {}", report.assets.missing);
    println!("record_failures: {}", report.record_failures.len());
    println!("files_written: {}", report.written.len());
    println!("verified_remaining: {}", report.verified_remaining());

    if !report.record_failures.is_empty() {
        println!("failed records:");
        for failure in &report.record_failures {
            println!(
                "  - {}[{}] {} ({}): {}",
                failure.file,
                failure.position,
                failure.handle.as_deref().unwrap_or("<no handle>"),
                failure.title.as_deref().unwrap_or("<no title>"),
                failure.error
            );
        }
    }
    if !report.asset_failures.is_empty() {
        println!("failed assets:");
        for failure in &report.asset_failures {
            println!(
                "  - {} {} {}: {}",
                failure.file, failure.handle, failure.url, failure.reason
            );
        }
    }
    for preview in &report.previews {
        print!("{}", preview.diff);
    }
    print_verification(&report.verification);
}

fn run_verify(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let verification = run_verification(&paths, &config)?;
    println!("verification");
    print_verification(&verification);
    println!("verified_remaining: {}", verification.total());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_verification(verification: &VerificationReport) {
    for file in &verification.files {
        println!(
            "verify.{}: cdn_images={} legacy_links={}",
            file.file, file.cdn_images, file.legacy_links
        );
    }
}

fn run_fallback_report(runtime: &RuntimeOptions, args: FallbackArgs) -> Result<()> {
    if args.limit == 0 {
        bail!("--limit must be at least 1");
    }
    let (paths, config) = resolve_runtime(runtime)?;
    let fallbacks = run_fallbacks(
        &paths,
        &config,
        &FallbackOptions {
            min_products: args.min_products,
            limit: args.limit,
        },
    )?;

    println!("collections_without_cover: {}", fallbacks.len());
    for entry in &fallbacks {
        println!();
        println!("{} ({}) | handle: {}", entry.title, entry.products_count, entry.handle);
        match &entry.suggestion {
            FallbackSource::Local(path) => println!("  LOCAL: {path}"),
            FallbackSource::Remote(url) => println!("  REMOTE: {}", truncate(url, 120)),
            FallbackSource::None => println!("  NONE: no member product has an image"),
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn resolve_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, CatalogToolConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn truncate(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((end, _)) => &value[..end],
        None => value,
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn format_count(value: Option<usize>) -> String {
    value
        .map(|count| count.to_string())
        .unwrap_or_else(|| "n/a".to_string())
}
