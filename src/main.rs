//! Persistent Cache CLI
//!
//! Inspects and edits a cache persisted in a SQLite file. Every invocation
//! reopens the cache, so expired entries are dropped on load.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use persistent_cache::{CacheOptions, CachePriority, PersistentCache, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "persistent_cache", about = "Inspect and edit a persisted cache")]
struct Cli {
    /// SQLite database file holding the cache
    #[arg(long, default_value = "cache.db")]
    db: PathBuf,

    /// Cache namespace inside the database (overrides CACHE_NAME)
    #[arg(long)]
    cache_name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value (parsed as JSON when possible)
    Set {
        key: String,
        value: String,
        /// Expire after this many idle seconds
        #[arg(long)]
        sliding_secs: Option<u64>,
        /// Expire this many seconds from now
        #[arg(long)]
        absolute_secs: Option<u64>,
        /// low, normal, high or never_remove
        #[arg(long, default_value = "normal")]
        priority: CachePriority,
    },
    /// Print a value
    Get { key: String },
    /// Remove a key
    Remove { key: String },
    /// Remove a fraction (0.0 to 1.0) of the entries
    Compact { fraction: f64 },
    /// List the keys
    List,
    /// Print statistics as JSON
    Stats,
}

fn main() -> Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "persistent_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    debug!(?cli, "parsed command line");

    let store = SqliteStore::open(&cli.db)
        .with_context(|| format!("failed to open {}", cli.db.display()))?;
    let mut options = CacheOptions::from_env(Some(Arc::new(store)));
    if let Some(name) = cli.cache_name {
        options = options.with_cache_name(name);
    }
    let cache: PersistentCache<String, Value> = PersistentCache::new(options)?;

    run(&cache, cli.command)?;

    cache.dispose();
    info!("done");
    Ok(())
}

fn run(cache: &PersistentCache<String, Value>, command: Command) -> Result<()> {
    match command {
        Command::Set {
            key,
            value,
            sliding_secs,
            absolute_secs,
            priority,
        } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            cache.set_with(key, value, |draft| {
                draft.set_priority(priority);
                if let Some(secs) = sliding_secs {
                    draft.set_sliding_expiration(Duration::from_secs(secs))?;
                }
                if let Some(secs) = absolute_secs {
                    draft.set_absolute_expiration_relative_to_now(Duration::from_secs(secs))?;
                }
                Ok(())
            })?;
        }
        Command::Get { key } => match cache.get(key.as_str())? {
            Some(value) => println!("{value}"),
            None => println!("(nil)"),
        },
        Command::Remove { key } => cache.remove(key.as_str())?,
        Command::Compact { fraction } => {
            let removed = cache.compact(fraction)?;
            println!("removed {removed} entries");
        }
        Command::List => {
            let mut keys = cache.keys()?;
            keys.sort();
            for key in keys {
                println!("{key}");
            }
        }
        Command::Stats => println!("{}", serde_json::to_string_pretty(&cache.stats())?),
    }
    Ok(())
}
