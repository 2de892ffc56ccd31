use std::path::{Path, PathBuf};

use anyhow::Result;
use blobtrack_core::address::BlobAddress;
use blobtrack_core::category::{
    CategoryPopulateOptions, DEFAULT_CATEGORY_REPORT_INTERVAL, populate_categories,
};
use blobtrack_core::config::load_config;
use blobtrack_core::content_model::{
    BackfillOptions, BackfillTable, NamespaceFilter, ResumeToken, backfill_content_model,
};
use blobtrack_core::error::StoreError;
use blobtrack_core::maintenance::{SingleNodeBarrier, StdoutProgress};
use blobtrack_core::redirects::{FixRedirectOptions, fix_double_redirects, resolve_redirect};
use blobtrack_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    resolve_paths,
};
use blobtrack_core::store;
use blobtrack_core::tracking::{OrphanScanStatus, TrackOptions, list_orphans, track_clusters};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "blobtrack",
    version,
    about = "External storage blob tracking and maintenance for a local wiki database"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
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
    Init(InitArgs),
    Track(TrackArgs),
    Orphans(OrphansArgs),
    Backfill(BackfillArgs),
    Category(CategoryArgs),
    Redirect(RedirectArgs),
    Status,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .blobtrack/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct TrackArgs {
    #[arg(required = true, value_name = "CLUSTER", help = "Cluster names to track")]
    clusters: Vec<String>,
    #[arg(long, value_name = "N", help = "Rows per scan batch")]
    batch_size: Option<usize>,
    #[arg(long, value_name = "N", help = "Batches between progress reports")]
    report_interval: Option<usize>,
    #[arg(long, value_name = "MS", default_value_t = 0, help = "Sleep between batches")]
    throttle_ms: u64,
    #[arg(long, help = "Skip the orphan blob scan")]
    skip_orphans: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct OrphansArgs {
    #[arg(long, value_name = "NAME", help = "Only list orphans from this cluster")]
    cluster: Option<String>,
    #[arg(long, help = "Print the listing as JSON")]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TableArg {
    Page,
    Revision,
    Archive,
}

impl TableArg {
    fn into_table(self) -> BackfillTable {
        match self {
            Self::Page => BackfillTable::Page,
            Self::Revision => BackfillTable::Revision,
            Self::Archive => BackfillTable::Archive,
        }
    }
}

#[derive(Debug, Args)]
struct BackfillArgs {
    #[arg(value_enum, help = "Table to walk")]
    table: TableArg,
    #[arg(
        long,
        value_name = "NS",
        default_value = "all",
        help = "Restrict to one namespace number"
    )]
    namespace: NamespaceFilter,
    #[arg(long, value_name = "N", help = "Rows per scan batch")]
    batch_size: Option<usize>,
    #[arg(long, value_name = "MS", default_value_t = 0, help = "Sleep between batches")]
    throttle_ms: u64,
    #[arg(long, value_name = "ID", help = "Resume strictly after this row id")]
    begin: Option<ResumeToken>,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct CategoryArgs {
    #[arg(long, value_name = "NAME", help = "Resume strictly after this category")]
    begin: Option<String>,
    #[arg(long, value_name = "N", default_value_t = DEFAULT_CATEGORY_REPORT_INTERVAL)]
    report_interval: usize,
    #[arg(long, value_name = "MS", default_value_t = 0, help = "Sleep between categories")]
    throttle_ms: u64,
    #[arg(long, help = "Rerun even when a finished run is on record")]
    force: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct RedirectArgs {
    #[command(subcommand)]
    command: RedirectSubcommand,
}

#[derive(Debug, Subcommand)]
enum RedirectSubcommand {
    /// Follow a redirect chain to its final destination
    Resolve {
        title: String,
        #[arg(long, value_name = "NS", default_value_t = 0)]
        namespace: i32,
    },
    /// Retarget every redirect pointing at a moved page
    Fix {
        title: String,
        #[arg(long, value_name = "NS", default_value_t = 0)]
        namespace: i32,
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Track(args)) => run_track(&runtime, args),
        Some(Commands::Orphans(args)) => run_orphans(&runtime, args),
        Some(Commands::Backfill(args)) => run_backfill(&runtime, args),
        Some(Commands::Category(args)) => run_category(&runtime, args),
        Some(Commands::Redirect(RedirectArgs { command })) => match command {
            RedirectSubcommand::Resolve { title, namespace } => {
                run_redirect_resolve(&runtime, &title, namespace)
            }
            RedirectSubcommand::Fix {
                title,
                namespace,
                json,
            } => run_redirect_fix(&runtime, &title, namespace, json),
        },
        Some(Commands::Status) => run_status(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let connection = store::open_local(&paths.db_path)?;
    store::init_local_schema(&connection)?;

    let config = load_config(&paths.config_path)?;
    let mut created_cluster_dbs = 0usize;
    for cluster in config.cluster_names() {
        let path = config.cluster_db_path(&paths, &cluster)?;
        if !path.exists() {
            store::create_cluster_db(&path)?;
            created_cluster_dbs += 1;
        }
    }

    println!("Initialized blobtrack runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("cluster_dir: {}", normalize_path(&paths.cluster_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("created_cluster_dbs: {created_cluster_dbs}");
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_track(runtime: &RuntimeOptions, args: TrackArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;

    let mut options = TrackOptions::from_config(&config, args.clusters);
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size;
    }
    if let Some(report_interval) = args.report_interval {
        options.report_interval = report_interval;
    }
    options.throttle_ms = args.throttle_ms;
    options.scan_orphans = !args.skip_orphans;

    let mut barrier = SingleNodeBarrier;
    let mut progress = StdoutProgress;
    let report = track_clusters(&paths, &config, &options, &mut barrier, &mut progress)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("clusters: {}", report.clusters.join(", "));
        println!("revisions_tracked: {}", report.revisions_tracked);
        println!("orphan_text_tracked: {}", report.orphan_text_tracked);
        println!("parse_failures: {}", report.parse_failures);
        for entry in &report.orphan_scan {
            match entry.status {
                OrphanScanStatus::Scanned => {
                    println!("orphans.{}: {}", entry.cluster, entry.orphans);
                }
                OrphanScanStatus::Unavailable => {
                    println!(
                        "orphans.{}: <unavailable> ({})",
                        entry.cluster,
                        entry.detail.as_deref().unwrap_or("no detail")
                    );
                }
                OrphanScanStatus::MissingBlobsTable => {
                    println!("orphans.{}: <no blobs table>", entry.cluster);
                }
                OrphanScanStatus::Skipped => {
                    println!("orphans.{}: <skipped>", entry.cluster);
                }
            }
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_orphans(runtime: &RuntimeOptions, args: OrphansArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let orphans = list_orphans(&paths, args.cluster.as_deref())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&orphans)?);
    } else {
        println!("orphans.count: {}", orphans.len());
        if orphans.is_empty() {
            println!("orphans: <none>");
        } else {
            for record in &orphans {
                println!(
                    "orphan: {}",
                    BlobAddress::new(record.cluster.as_str(), record.blob_id)
                );
            }
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_backfill(runtime: &RuntimeOptions, args: BackfillArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;

    let mut options = BackfillOptions::from_config(&config, args.table.into_table());
    options.namespace = args.namespace;
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size;
    }
    options.throttle_ms = args.throttle_ms;
    options.resume = args.begin;

    let mut barrier = SingleNodeBarrier;
    let mut progress = StdoutProgress;
    let report = backfill_content_model(&paths, &config, &options, &mut barrier, &mut progress)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("table: {}", report.table);
        println!("rows_updated: {}", report.rows_updated);
        println!("immediate_updates: {}", report.immediate_updates);
        println!("batches_flushed: {}", report.batches_flushed);
        println!("caches_cleared: {}", report.caches_cleared);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_category(runtime: &RuntimeOptions, args: CategoryArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let options = CategoryPopulateOptions {
        begin: args.begin,
        report_interval: args.report_interval,
        throttle_ms: args.throttle_ms,
        force: args.force,
    };

    let mut barrier = SingleNodeBarrier;
    let mut progress = StdoutProgress;
    let report = populate_categories(&paths, &options, &mut barrier, &mut progress)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("refreshed: {}", report.refreshed);
        println!("already_done: {}", report.already_done);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_redirect_resolve(runtime: &RuntimeOptions, title: &str, namespace: i32) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    match resolve_redirect(&paths, namespace, title) {
        Ok(Some(destination)) => {
            println!("destination: {}", destination.prefixed_text());
        }
        Ok(None) => {
            println!("destination: <not a redirect>");
        }
        Err(error) => match error.downcast_ref::<StoreError>() {
            Some(StoreError::CircularRedirect(_)) => {
                println!("destination: <none> ({error})");
            }
            _ => return Err(error),
        },
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_redirect_fix(
    runtime: &RuntimeOptions,
    title: &str,
    namespace: i32,
    json: bool,
) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let options = FixRedirectOptions {
        namespace,
        title: title.to_string(),
    };

    let mut barrier = SingleNodeBarrier;
    let mut progress = StdoutProgress;
    let report = fix_double_redirects(&paths, &options, &mut barrier, &mut progress)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("target: {}", report.target);
        println!("candidates: {}", report.candidates);
        println!("fixed: {}", report.fixed);
        println!("already_correct: {}", report.already_correct);
        println!("skipped: {}", report.skipped);
        println!("failed: {}", report.failed.len());
        for failure in &report.failed {
            println!("  - {failure}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let status = inspect_runtime(&paths, &config)?;

    println!("runtime status");
    println!(
        "project_root: {} ({})",
        normalize_path(&paths.project_root),
        paths.root_source.as_str()
    );
    println!(
        "data_dir: {} ({})",
        normalize_path(&paths.data_dir),
        paths.data_source.as_str()
    );
    println!(
        "config_path: {} ({})",
        normalize_path(&paths.config_path),
        paths.config_source.as_str()
    );
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("wiki_id: {}", config.wiki_id());
    if status.clusters.is_empty() {
        println!("clusters: <none configured>");
    } else {
        for cluster in &status.clusters {
            println!(
                "cluster.{}: {} ({})",
                cluster.name,
                normalize_path(&cluster.path),
                if cluster.available {
                    "available"
                } else {
                    "missing"
                }
            );
        }
    }

    if status.db_exists {
        let connection = store::open_local(&paths.db_path)?;
        if store::table_exists(&connection, "blob_tracking")? {
            println!(
                "blob_tracking_rows: {}",
                store::count_query(&connection, "SELECT COUNT(*) FROM blob_tracking")?
            );
            println!(
                "blob_orphans_rows: {}",
                store::count_query(&connection, "SELECT COUNT(*) FROM blob_orphans")?
            );
        } else {
            println!("blob_tracking_rows: <not built> (run `blobtrack track`)");
        }
    }

    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
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

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
