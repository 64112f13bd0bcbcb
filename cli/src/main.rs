//! chainevents CLI: follow a Substrate node's events with historical backfill.
//!
//! # Commands
//! ```text
//! chainevents listen  --url <ws> [--from <height>] [--events-key <hex>] [--json]
//! chainevents info    [--url <ws>]
//! chainevents version
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use chainevents_core::{BlockHash, BlockHeight, EventsEngine, EventsError, ListeningHandle, StorageKey};
use chainevents_substrate::{EventCountDecoder, EventRecords, SubstrateConfig, SubstrateSource};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

mod logging;

use logging::{init_tracing, LogConfig};

type Engine = EventsEngine<SubstrateSource, EventCountDecoder>;

#[derive(Parser)]
#[command(
    name = "chainevents",
    about = "Follow a Substrate chain's events, replaying history from any block",
    version
)]
struct Cli {
    /// Log level: trace | debug | info | warn | error (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print one line per block of events until Ctrl-C
    Listen {
        /// Node WebSocket endpoint
        #[arg(long)]
        url: String,
        /// First block to deliver (default: the node's best block)
        #[arg(long)]
        from: Option<BlockHeight>,
        /// Events storage key in hex (default: System.Events)
        #[arg(long)]
        events_key: Option<String>,
        /// Per-request timeout in milliseconds
        #[arg(long, default_value_t = 30_000)]
        request_timeout_ms: u64,
        /// Output as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show capabilities, and chain details when a node URL is given
    Info {
        #[arg(long)]
        url: Option<String>,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig {
        level: cli.log_level,
        json: cli.log_json,
        ..LogConfig::default()
    });

    match cli.command {
        Commands::Listen {
            url,
            from,
            events_key,
            request_timeout_ms,
            json,
        } => {
            let mut config = SubstrateConfig::new(url);
            config.request_timeout_ms = request_timeout_ms;
            if let Some(key) = events_key {
                config.events_key =
                    Some(StorageKey::from_hex(&key).context("--events-key is not valid hex")?);
            }
            cmd_listen(config, from, json).await
        }
        Commands::Info { url } => cmd_info(url).await,
        Commands::Version => {
            println!("chainevents {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_listen(config: SubstrateConfig, from: Option<BlockHeight>, json: bool) -> Result<()> {
    let source = SubstrateSource::connect(&config)
        .await
        .with_context(|| format!("connecting to {}", config.url))?;
    let begin = match from {
        Some(height) => height,
        None => {
            source
                .best_block()
                .await
                .context("fetching the best block")?
                .0
        }
    };

    let engine: Engine = EventsEngine::new(source, EventCountDecoder);
    let mut errors = engine.errors();
    let listener = engine.register(begin, move |records, height, hash| {
        print_batch(&records, height, hash, json)
    })?;
    let mut listening = engine.start().await.context("opening the events subscription")?;
    tracing::info!(url = %config.url, begin, key = %config.events_key(), "listening for events");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            err = errors.recv() => match err {
                Ok(err) => print_error(&err, json),
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "dropped engine errors"),
                Err(RecvError::Closed) => break,
            },
            _ = listening.stopped() => {
                match restart(&engine).await {
                    Some(handle) => listening = handle,
                    None => break,
                }
            }
        }
    }

    listener.cancel();
    listening.cancel();
    tracing::info!("shutting down");
    Ok(())
}

/// Reopen the live subscription after it ended, retrying until it succeeds
/// or the user interrupts. Returns `None` on Ctrl-C.
async fn restart(engine: &Engine) -> Option<ListeningHandle> {
    let mut delay = Duration::from_secs(1);
    loop {
        tracing::warn!("live subscription ended, reopening in {delay:?}");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match engine.start().await {
            Ok(handle) => return Some(handle),
            Err(err) => tracing::warn!(error = %err, "reopening the subscription failed"),
        }
        delay = (delay * 2).min(Duration::from_secs(30));
    }
}

fn print_batch(records: &EventRecords, height: BlockHeight, hash: BlockHash, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "height": height,
                "hash": hash.to_hex(),
                "events": records.count,
                "bytes": records.raw.len(),
            })
        );
    } else {
        println!(
            "#{height} {hash} events={} bytes={}",
            records.count,
            records.raw.len()
        );
    }
}

fn print_error(err: &EventsError, json: bool) {
    if json {
        eprintln!(
            "{}",
            serde_json::json!({
                "error": err.to_string(),
                "kind": format!("{:?}", err.kind()),
                "listener": err.listener().map(|id| id.0),
            })
        );
    } else {
        eprintln!("error: {err}");
    }
}

async fn cmd_info(url: Option<String>) -> Result<()> {
    println!("chainevents v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Capabilities:");
    println!("  ✓ Shared live subscription    (state_subscribeStorage)");
    println!("  ✓ Per-listener backfill       (chain_getBlockHash + state_queryStorageAt)");
    println!("  ✓ Ordered per-listener delivery, no gaps or duplicates at handoff");
    println!("  ✓ Auto-reconnecting WebSocket client");
    println!("  ✓ Event counting              (SCALE compact prefix)");

    let Some(url) = url else {
        return Ok(());
    };
    let config = SubstrateConfig::new(url);
    let source = SubstrateSource::connect(&config)
        .await
        .with_context(|| format!("connecting to {}", config.url))?;
    let chain = source.chain_name().await.context("system_chain")?;
    let (height, hash) = source.best_block().await.context("fetching the best block")?;

    println!();
    println!("Node:       {}", config.url);
    println!("Chain:      {chain}");
    println!("Best block: #{height} {hash}");
    println!("Events key: {}", config.events_key());
    Ok(())
}
