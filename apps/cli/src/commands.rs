//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use datapack_core::pipeline::{DistributeOptions, DistributeResult, ProgressReporter, SilentProgress};
use datapack_core::Dataset;
use datapack_manifest::{Manifest, ValidateOptions};
use datapack_registry::Registry;
use datapack_shared::{AppConfig, PackageName, init_config, load_config};
use datapack_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// datapack: package CSV dataset manifests and the files they reference.
#[derive(Parser)]
#[command(
    name = "datapack",
    version,
    about = "Validate dataset manifests and distribute them as versioned packages.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Whether full error reports were requested.
    pub(crate) fn debug(&self) -> bool {
        matches!(self.command, Command::Distribute { debug: true, .. })
    }
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Validate a dataset, build its package, and push it to a registry.
    Distribute {
        /// Path to the CSV dataset manifest.
        dataset_path: PathBuf,

        /// Dataset name (lowercased, spaces and hyphens become underscores).
        dataset_name: String,

        /// Package owner.
        package_owner: String,

        /// Path to the dataset README.
        readme_path: PathBuf,

        /// Registry to push to. Defaults to the configured registry.
        push_uri: Option<String>,

        /// Message attached to the pushed version.
        #[arg(short, long)]
        message: Option<String>,

        /// Usage documentation file or link to append to the README.
        #[arg(short, long)]
        usage_doc: Option<String>,

        /// License file or link to append to the README.
        #[arg(short, long)]
        license: Option<String>,

        /// Columns to attach as metadata to every file in a row.
        #[arg(short = 'c', long, num_args = 1..)]
        metadata_columns: Vec<String>,

        /// Columns holding files to package (overrides detection).
        #[arg(short = 'f', long, visible_alias = "fc", num_args = 1..)]
        file_columns: Vec<String>,

        /// Don't attach row associates to packaged files.
        #[arg(long)]
        no_associates: bool,

        /// Drop rows that fail validation instead of aborting.
        #[arg(long)]
        drop_on_error: bool,

        /// Build the package without pushing it.
        #[arg(long)]
        dry_run: bool,

        /// Show full error reports.
        #[arg(long, hide = true)]
        debug: bool,
    },

    /// Validate a dataset and print its schema.
    Validate {
        /// Path to the CSV dataset manifest.
        dataset_path: PathBuf,

        /// Drop rows that fail validation instead of aborting.
        #[arg(long)]
        drop_on_error: bool,

        /// Write the cleaned dataset to this CSV file.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// List packages in a registry.
    List {
        /// Registry path. Defaults to the configured registry.
        #[arg(long)]
        registry: Option<String>,
    },

    /// Show the version history of a package.
    History {
        /// Package handle (`owner/name`).
        package: String,

        /// Registry path. Defaults to the configured registry.
        #[arg(long)]
        registry: Option<String>,
    },

    /// Show the files of one package version.
    Show {
        /// Package handle (`owner/name`).
        package: String,

        /// `latest`, a unix timestamp, or a top-hash prefix.
        #[arg(long, default_value = "latest")]
        version: String,

        /// Registry path. Defaults to the configured registry.
        #[arg(long)]
        registry: Option<String>,
    },

    /// Search packaged file names across a registry.
    Search {
        /// Text to search for in logical keys.
        query: String,

        /// Maximum number of results.
        #[arg(long, default_value = "20")]
        limit: u32,

        /// Registry path. Defaults to the configured registry.
        #[arg(long)]
        registry: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "datapack=info",
        1 => "datapack=debug",
        _ => "datapack=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Distribute {
            dataset_path,
            dataset_name,
            package_owner,
            readme_path,
            push_uri,
            message,
            usage_doc,
            license,
            metadata_columns,
            file_columns,
            no_associates,
            drop_on_error,
            dry_run,
            debug: _,
        } => {
            let args = DistributeArgs {
                dataset_path,
                dataset_name,
                package_owner,
                readme_path,
                push_uri,
                message,
                usage_doc,
                license,
                metadata_columns,
                file_columns,
                no_associates,
                drop_on_error,
                dry_run,
            };
            cmd_distribute(args).await
        }
        Command::Validate {
            dataset_path,
            drop_on_error,
            out,
        } => cmd_validate(dataset_path, drop_on_error, out),
        Command::List { registry } => cmd_list(registry.as_deref()).await,
        Command::History { package, registry } => {
            cmd_history(&package, registry.as_deref()).await
        }
        Command::Show {
            package,
            version,
            registry,
        } => cmd_show(&package, &version, registry.as_deref()),
        Command::Search {
            query,
            limit,
            registry,
        } => cmd_search(&query, limit, registry.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// distribute
// ---------------------------------------------------------------------------

struct DistributeArgs {
    dataset_path: PathBuf,
    dataset_name: String,
    package_owner: String,
    readme_path: PathBuf,
    push_uri: Option<String>,
    message: Option<String>,
    usage_doc: Option<String>,
    license: Option<String>,
    metadata_columns: Vec<String>,
    file_columns: Vec<String>,
    no_associates: bool,
    drop_on_error: bool,
    dry_run: bool,
}

async fn cmd_distribute(args: DistributeArgs) -> Result<()> {
    let config = load_config()?;

    let mut dataset = Dataset::from_csv(
        &args.dataset_path,
        &args.dataset_name,
        &args.package_owner,
        &args.readme_path,
    )?;

    if let Some(doc) = &args.usage_doc {
        dataset.add_usage_doc(doc)?;
    }
    if let Some(doc) = &args.license {
        dataset.add_license(doc)?;
    }
    if !args.metadata_columns.is_empty() {
        dataset.set_metadata_columns(args.metadata_columns)?;
    }
    if !args.file_columns.is_empty() {
        dataset.set_path_columns(args.file_columns)?;
    }

    let push_uri = if args.dry_run {
        None
    } else {
        Some(
            args.push_uri
                .unwrap_or_else(|| config.registry_path().display().to_string()),
        )
    };

    let options = DistributeOptions {
        push_uri,
        message: args.message,
        attach_associates: config.defaults.attach_associates && !args.no_associates,
        drop_on_error: config.validation.drop_on_error || args.drop_on_error,
        path_hints: config.validation.path_hints.clone(),
    };

    info!(
        dataset = %dataset,
        push = options.push_uri.as_deref().unwrap_or("<dry run>"),
        "distributing dataset"
    );

    let result = if config.defaults.show_progress {
        let reporter = CliProgress::new();
        datapack_core::distribute(&mut dataset, &options, &reporter).await?
    } else {
        datapack_core::distribute(&mut dataset, &options, &SilentProgress).await?
    };

    println!();
    match &result.receipt {
        Some(receipt) => {
            println!("  Package pushed!");
            println!("  Name:     {}", receipt.name);
            println!("  Top hash: {}", receipt.top_hash);
            println!("  Version:  {}", receipt.timestamp);
            println!("  Registry: {}", receipt.registry.display());
            println!(
                "  Objects:  {} written, {} reused",
                receipt.objects_written, receipt.objects_reused
            );
        }
        None => {
            println!("  Package built (dry run, nothing pushed).");
            println!("  Name:     {}", result.name);
            println!("  Top hash: {}", result.manifest.top_hash);
        }
    }
    println!("  Files:    {}", result.manifest.entries.len());
    println!("  Bytes:    {}", result.manifest.total_bytes());
    println!("  Rows:     {} ({} dropped)", result.rows, result.dropped_rows);
    println!("  {}", result.schema);
    println!("  Time:     {:.1}s", result.elapsed.as_secs_f64());
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    phase: Mutex<String>,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            phase: Mutex::new(String::new()),
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        if let Ok(mut phase) = self.phase.lock() {
            *phase = name.to_string();
        }
        self.spinner.set_message(name.to_string());
    }

    fn tick(&self, current: usize, total: usize) {
        let phase = self.phase.lock().map(|p| p.clone()).unwrap_or_default();
        self.spinner
            .set_message(format!("{phase} [{current}/{total}]"));
    }

    fn done(&self, _result: &DistributeResult) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn cmd_validate(dataset_path: PathBuf, drop_on_error: bool, out: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let data = Manifest::from_csv_path(&dataset_path)?;

    let options = ValidateOptions {
        drop_on_error: config.validation.drop_on_error || drop_on_error,
        path_hints: config.validation.path_hints.clone(),
    };
    let validated = datapack_manifest::validate(&data, None, &options, None)?;

    println!("{}", validated.schema.to_markdown_table());
    println!("{}", validated.schema);
    println!(
        "Rows: {} kept, {} dropped",
        validated.data.height(),
        data.height() - validated.data.height()
    );

    if let Some(out) = out {
        validated.data.write_csv(&out)?;
        println!("Cleaned dataset written to {}", out.display());
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Registry browsing
// ---------------------------------------------------------------------------

fn open_registry(config: &AppConfig, registry: Option<&str>) -> Result<Registry> {
    let target = registry
        .map(str::to_string)
        .unwrap_or_else(|| config.registry_path().display().to_string());
    Ok(Registry::open(&target)?)
}

async fn open_index(registry: &Registry) -> Result<Option<Storage>> {
    let path = registry.index_path();
    if !path.is_file() {
        return Ok(None);
    }
    Ok(Some(Storage::open_readonly(&path).await?))
}

async fn cmd_list(registry: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let registry = open_registry(&config, registry)?;
    info!(registry = %registry.root().display(), "listing packages");

    let Some(storage) = open_index(&registry).await? else {
        println!("No packages in {}", registry.root().display());
        return Ok(());
    };

    let packages = storage.list_packages().await?;
    if packages.is_empty() {
        println!("No packages in {}", registry.root().display());
        return Ok(());
    }

    for package in packages {
        println!(
            "{:<40} {:>3} version(s)  latest {}",
            package.name,
            package.version_count,
            package.latest_top_hash.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn cmd_history(package: &str, registry: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let name: PackageName = package.parse()?;
    let registry = open_registry(&config, registry)?;

    let storage = open_index(&registry)
        .await?
        .ok_or_else(|| eyre!("no registry index at {}", registry.index_path().display()))?;
    let versions = storage.list_versions(&name.to_string()).await?;
    if versions.is_empty() {
        return Err(eyre!("package {name} has no versions"));
    }

    for version in versions {
        println!(
            "{}  {}  {:>5} files  {:>12} bytes  {}",
            version.pushed_at,
            version.top_hash,
            version.entry_count,
            version.total_bytes,
            version.message.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

fn cmd_show(package: &str, version: &str, registry: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let name: PackageName = package.parse()?;
    let registry = open_registry(&config, registry)?;

    let manifest = registry.load_version(&name, version)?;

    println!("{name}@{}", manifest.top_hash);
    if let Some(message) = &manifest.message {
        println!("{message}");
    }
    for entry in &manifest.entries {
        println!("{:>12}  {}", entry.size, entry.logical_key);
    }
    Ok(())
}

async fn cmd_search(query: &str, limit: u32, registry: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let registry = open_registry(&config, registry)?;

    let Some(storage) = open_index(&registry).await? else {
        println!("No packages in {}", registry.root().display());
        return Ok(());
    };

    let results = storage.search_entries(query, limit).await?;
    if results.is_empty() {
        println!("No matches for '{query}'");
    }
    for hit in results {
        let short = &hit.top_hash[..10.min(hit.top_hash.len())];
        println!("{}@{short}  {}", hit.package, hit.logical_key);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
