use anyhow::Context;
use clap::{Parser, Subcommand};
use moar_store::config::StoreConfig;
use moar_store::error::Error;
use moar_store::storage::{self, EventStore};
use nostr::{Event, EventId, Filter, JsonUtil};
use std::io::{BufRead, BufReader, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "moar-store")]
#[command(about = "Indexed Nostr event store", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "moar-store.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import events from a JSON-lines file
    Import { file: PathBuf },
    /// Print events matching a filter, newest first
    Query {
        /// Filter as JSON, e.g. '{"kinds":[1],"limit":10}'
        filter: String,
        #[arg(long)]
        max_limit: Option<usize>,
    },
    /// Count events matching a filter
    Count { filter: String },
    /// Delete an event by id
    Delete { id: String },
    /// Show store statistics
    Stats,
}

fn load_config(path: &Path) -> anyhow::Result<StoreConfig> {
    if !path.exists() {
        info!("{} not found, using defaults", path.display());
        return Ok(StoreConfig::default());
    }
    StoreConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let store = storage::open(&config)?;

    match cli.command {
        Commands::Import { file } => import(store.as_ref(), &file)?,
        Commands::Query { filter, max_limit } => {
            let mut filter = Filter::from_json(&filter).context("parsing filter")?;
            if filter.limit.is_none() {
                filter.limit = Some(config.query.default_limit);
            }
            let max_limit = max_limit
                .unwrap_or(config.query.max_limit)
                .min(config.query.max_limit);

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let mut write_error = None;
            store.visit_events(&filter, max_limit, &mut |event| {
                match writeln!(out, "{}", event.as_json()) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        write_error = Some(e);
                        ControlFlow::Break(())
                    }
                }
            })?;
            if let Some(e) = write_error {
                return Err(e.into());
            }
        }
        Commands::Count { filter } => {
            let filter = Filter::from_json(&filter).context("parsing filter")?;
            println!("{}", store.count_events(&filter)?);
        }
        Commands::Delete { id } => {
            let id = EventId::from_hex(&id).context("parsing event id")?;
            if store.delete_event(&id)? {
                info!(%id, "deleted");
            } else {
                warn!(%id, "not found");
            }
        }
        Commands::Stats => {
            println!("path:   {}", store.db_path());
            println!("events: {}", store.event_count()?);
        }
    }

    Ok(())
}

fn import(store: &dyn EventStore, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let (mut stored, mut superseded) = (0usize, 0usize);
    let (mut duplicates, mut rejected) = (0usize, 0usize);

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = match Event::from_json(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no + 1, "invalid event JSON: {}", e);
                rejected += 1;
                continue;
            }
        };
        if let Err(e) = event.verify() {
            warn!(line = line_no + 1, id = %event.id, "bad signature: {}", e);
            rejected += 1;
            continue;
        }
        match store.store_event(&event) {
            Ok(true) => stored += 1,
            Ok(false) => superseded += 1,
            Err(Error::DupEvent) => duplicates += 1,
            Err(e) => return Err(e.into()),
        }
    }

    info!(stored, superseded, duplicates, rejected, "import finished");
    Ok(())
}
