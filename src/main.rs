use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use location_enricher::{
    discover_input, disperse_store, init_tracing, run_enrichment, AppConfig, Disperser,
    GeocodeClient, ProgressObserver, RecordStore, ResolutionProgress, Resolver,
};

#[derive(Parser)]
#[command(name = "location-enricher", version)]
#[command(about = "Batch geocoding enrichment for partial location records")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve coordinates for every pending record, then disperse centroid hits
    Resolve {
        #[command(flatten)]
        storage: StorageArgs,
        /// Persist after this many processed records
        #[arg(long)]
        checkpoint_interval: Option<usize>,
        /// Skip the dispersal pass
        #[arg(long)]
        no_disperse: bool,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Spread records that resolved to a state centroid
    Disperse {
        #[command(flatten)]
        storage: StorageArgs,
        /// Maximum offset from the centroid, in kilometres
        #[arg(long)]
        radius_km: Option<f64>,
        /// Seed for reproducible offsets
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Report status and tier counts without touching the network
    Inspect {
        /// CSV file to read (defaults to the largest CSV in the working directory)
        input: Option<PathBuf>,
    },
}

#[derive(Args)]
struct StorageArgs {
    /// CSV file to enrich (defaults to the largest CSV in the working directory)
    input: Option<PathBuf>,
    /// Write results here instead of rewriting the input
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();

    match cli.command {
        Command::Resolve {
            storage,
            checkpoint_interval,
            no_disperse,
            json,
        } => {
            if let Some(interval) = checkpoint_interval {
                config.checkpoint_interval = interval.max(1);
            }
            info!(config = ?config.public_profile(), "starting resolution run");

            let mut store = open_store(&storage)?;
            let client = GeocodeClient::new(&config)?;
            let resolver = Resolver::new(client, &config);
            let mut disperser = (!no_disperse).then(|| Disperser::new(&config));

            let cancel_flag = Arc::new(AtomicBool::new(false));
            spawn_interrupt_listener(cancel_flag.clone());
            let observer: ProgressObserver = Arc::new(|progress: ResolutionProgress| {
                info!(
                    processed = progress.processed,
                    total = progress.total,
                    resolved = progress.resolved,
                    record = %progress.label,
                    status = progress.status.as_tag(),
                    "progress"
                );
            });

            let summary = run_enrichment(
                &mut store,
                &resolver,
                disperser.as_mut(),
                Some(observer),
                Some(cancel_flag),
            )
            .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "resolved {} | failed {} | unresolved {} | errored {} | dispersed {} -> {}",
                    summary.resolved,
                    summary.failed,
                    summary.unresolved,
                    summary.errored,
                    summary.dispersed,
                    store.path().display()
                );
            }
        }
        Command::Disperse {
            storage,
            radius_km,
            seed,
        } => {
            if let Some(radius) = radius_km {
                config.jitter_radius_km = radius.max(0.0);
            }
            if seed.is_some() {
                config.jitter_seed = seed;
            }
            let mut store = open_store(&storage)?;
            let mut disperser = Disperser::new(&config);
            let moved = disperse_store(&mut store, &mut disperser)?;
            println!(
                "dispersed {moved} records within {} km -> {}",
                disperser.radius_km(),
                store.path().display()
            );
        }
        Command::Inspect { input } => {
            let store = RecordStore::load(&resolve_input(input)?)?;
            println!("{}", serde_json::to_string_pretty(&store.summary())?);
        }
    }

    Ok(())
}

fn resolve_input(input: Option<PathBuf>) -> Result<PathBuf> {
    match input {
        Some(path) => Ok(path),
        None => {
            let cwd = env::current_dir().context("failed to read working directory")?;
            let found = discover_input(&cwd)?;
            info!(path = %found.display(), "using discovered input");
            Ok(found)
        }
    }
}

fn open_store(args: &StorageArgs) -> Result<RecordStore> {
    let input = resolve_input(args.input.clone())?;
    let store = RecordStore::load(&input)
        .with_context(|| format!("failed to load {}", input.display()))?;
    Ok(match &args.output {
        Some(output) => store.with_output(output),
        None => store,
    })
}

#[derive(Debug, PartialEq)]
enum InterruptAction {
    Finish,
    Abort,
}

/// First interrupt asks the run to stop after the current record; any later
/// one aborts immediately.
fn next_interrupt_action(flag: &AtomicBool) -> InterruptAction {
    if flag.swap(true, Ordering::SeqCst) {
        InterruptAction::Abort
    } else {
        InterruptAction::Finish
    }
}

fn spawn_interrupt_listener(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(?err, "unable to listen for interrupts");
                return;
            }
            match next_interrupt_action(&flag) {
                InterruptAction::Finish => {
                    warn!("interrupt received; finishing current record before checkpointing");
                }
                InterruptAction::Abort => {
                    warn!("second interrupt received; exiting without a final checkpoint");
                    process::exit(130);
                }
            }
        }
    });
}
