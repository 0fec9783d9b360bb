//! sweepers CLI tool
//!
//! Runs the registry sweeper passes once against the configured store and prints the JSON run
//! report on stdout. Intended to be invoked by an external scheduler.
//!
//! ## Commands
//!
//! - `provenance`: link every non-latest product version to its successor
//! - `ancestry`: record parent bundles and collections on collections and products
//! - `all`: both passes, sequentially unless `--concurrent` is given
//!
//! ## Exit status
//!
//! Non-zero when a pass aborted on a fatal error or when any write failed permanently. Skipped
//! groups, data warnings and cancellation alone do not fail the run; they are in the report.
//!
//! Store endpoint and credentials may be supplied through `PROV_ENDPOINT` and `PROV_CREDENTIALS`
//! (`{"<user>": "<password>"}`), which take precedence over the config file. `DEV_MODE=1` disables
//! certificate verification. Each `--ccs-remote <name>` adds a cross-cluster search remote whose
//! indices are read alongside the local ones.

use clap::{Parser, Subcommand};
use registry_sweepers::{
    config::SweepersConfig,
    context::{Pass, RunContext},
    store::OpenSearchStore,
    sweepers::run_all,
};
use std::{path::PathBuf, sync::Arc, time::Instant};

#[derive(Parser)]
#[command(name = "sweepers")]
#[command(author, version, about = "Computes provenance and ancestry metadata for registry documents", long_about = None)]
struct Cli {
    /// Configuration file path (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `registry_sweepers=debug`. `RUST_LOG` is used when omitted.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Cross-cluster search remotes to read alongside the local indices (added to `store.remotes`)
    #[arg(short = 'r', long = "ccs-remote", global = true)]
    ccs_remotes: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Update successor links between versions of each LID
    Provenance,

    /// Update parent bundle/collection identifiers
    Ancestry,

    /// Run every pass
    All {
        /// Run the passes side by side instead of one after the other
        #[arg(long)]
        concurrent: bool,
    },
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn format_elapsed(secs: u64) -> String {
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m{s:02}s"),
        (h, m, s) => format!("{h}h{m:02}m{s:02}s"),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    let started = Instant::now();

    let mut config = match &cli.config {
        Some(path) => SweepersConfig::from_toml_path(path)?,
        None => SweepersConfig::default(),
    }
    .with_env_overrides()?;
    config.store.remotes.extend(cli.ccs_remotes);
    config.validate()?;
    tracing::debug!("Using {:?}", config.store);

    let (passes, concurrent) = match cli.command {
        Commands::Provenance => (vec![Pass::Provenance], false),
        Commands::Ancestry => (vec![Pass::Ancestry], false),
        Commands::All { concurrent } => (vec![Pass::Provenance, Pass::Ancestry], concurrent),
    };

    let store = Arc::new(OpenSearchStore::from_config(&config.store)?);
    let ctx = RunContext::new(config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(async {
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received - finishing the current batch and stopping");
                cancel.cancel();
            }
        });
        run_all(&ctx, store, &passes, concurrent).await
    });

    println!("{}", report.to_json()?);
    tracing::info!(
        "Sweepers run finished in {}",
        format_elapsed(started.elapsed().as_secs())
    );

    if report.has_fatal_error() {
        eprintln!("Error: at least one pass aborted");
        std::process::exit(1);
    }
    let failed = report.failed_ids();
    if !failed.is_empty() {
        eprintln!("Error: {} document update(s) failed permanently", failed.len());
        std::process::exit(2);
    }
    Ok(())
}
