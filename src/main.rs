use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::Ordering;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pymirror::delete::delete_packages;
use pymirror::verify::{verify_mirror, VerifyOptions};
use pymirror::{Config, MirrorEngine, MirrorSummary};

#[derive(Parser)]
#[command(name = "pymirror")]
#[command(about = "Incremental, crash-safe PyPI package index mirror")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a mirror directory and write the default configuration
    Init {
        /// Replica root directory
        #[arg(short, long, default_value = "~/pymirror")]
        directory: String,
    },

    /// Run one synchronization pass against the upstream index
    Mirror,

    /// Re-verify stored metadata and files, re-fetching what is broken
    Verify {
        /// Report planned actions without mutating anything
        #[arg(long)]
        dry_run: bool,

        /// Also delete blobs no known project references
        #[arg(long)]
        delete_unowned: bool,
    },

    /// Remove projects and their artifacts from the replica
    Delete {
        /// Project names to remove
        #[arg(required = true)]
        names: Vec<String>,

        /// Report planned actions without mutating anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;
    info!("Starting pymirror v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Init { directory } => cmd_init(directory, &config),
        Commands::Mirror => cmd_mirror(config).await,
        Commands::Verify {
            dry_run,
            delete_unowned,
        } => cmd_verify(&config, dry_run, delete_unowned).await,
        Commands::Delete { names, dry_run } => delete_packages(&config, &names, dry_run).await,
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<std::path::PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Create the replica directory and persist its location in the config
fn cmd_init(directory: String, config: &Config) -> Result<()> {
    let expanded = shellexpand::full(&directory)?;
    std::fs::create_dir_all(expanded.as_ref())
        .with_context(|| format!("Failed to create mirror directory {expanded}"))?;

    let mut new_config = config.clone();
    new_config.mirror.directory = directory.clone();

    let config_path = Config::default_config_path()?;
    new_config.save(&config_path)?;

    println!("✅ Mirror initialized");
    println!("   Config: {:?}", config_path);
    println!("   Directory: {}", expanded);
    println!("   Next: run 'pymirror mirror' to start replicating");

    Ok(())
}

/// Run one synchronization pass
async fn cmd_mirror(config: Config) -> Result<()> {
    let engine = MirrorEngine::new(config.clone())?;

    // An interrupt stops new work; in-flight projects drain, the serial is
    // not advanced, and the todo list survives for the next run.
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining in-flight work");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let summary = match config.global_timeout() {
        Some(limit) => tokio::time::timeout(limit, engine.run())
            .await
            .context("global timeout exceeded")??,
        None => engine.run().await?,
    };

    print_summary(&summary);

    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_verify(config: &Config, dry_run: bool, delete_unowned: bool) -> Result<()> {
    let summary = verify_mirror(
        config,
        VerifyOptions {
            dry_run,
            delete_unowned,
        },
    )
    .await?;

    println!("\n🔎 Verification Complete!");
    println!("   📦 Projects checked: {}", summary.projects);
    println!("   📄 Files checked: {}", summary.files_checked);
    println!("   🔧 Files repaired: {}", summary.files_repaired);
    println!("   🗑️  Projects deleted: {}", summary.projects_deleted);
    println!("   🧹 Unowned files removed: {}", summary.unowned_deleted);
    println!("   ❌ Errors: {}", summary.errors);

    if summary.errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(summary: &MirrorSummary) {
    println!("\n🎉 Synchronization Complete!");
    println!("   🎯 Target serial: {}", summary.target_serial);
    println!("   📦 Projects in run: {}", summary.total_projects);
    println!("   ✅ Synced: {}", summary.synced);
    println!("   ⏭️  Filtered: {}", summary.filtered);
    println!("   🗑️  Deleted: {}", summary.deleted);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());
    println!(
        "   💾 Serial {}",
        if summary.finalized {
            "advanced"
        } else {
            "unchanged (run will resume)"
        }
    );
}
