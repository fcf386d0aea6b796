//! chainscan CLI: inspect and manage block scanner state.
//!
//! Usage:
//! ```bash
//! chainscan status          --db ./scan.db [--chain nuls]
//! chainscan unscanned       --db ./scan.db --chain nuls
//! chainscan purge-not-found --db ./scan.db --chain nuls
//! chainscan reset-height    --db ./scan.db --chain nuls --height 1200 [--hash <hash of 1199>]
//! chainscan info            [--config scanner.json]
//! ```
//!
//! Global flags: `--log-level <level>` (overridden by `RUST_LOG`), `--log-json`.

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainscan_core::checkpoint::{CheckpointManager, ScanCheckpointStore};
use chainscan_core::config::ScannerConfig;
use chainscan_storage::sqlite::SqliteStorage;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    init_tracing(
        flag(&args, "--log-level").unwrap_or("warn"),
        args.iter().any(|a| a == "--log-json"),
    );

    let result = match args[1].as_str() {
        "status" => cmd_status(&args).await,
        "unscanned" => cmd_unscanned(&args).await,
        "purge-not-found" => cmd_purge_not_found(&args).await,
        "reset-height" => cmd_reset_height(&args).await,
        "info" => cmd_info(&args),
        "version" | "--version" | "-V" => {
            println!("chainscan {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainscan {}", env!("CARGO_PKG_VERSION"));
    println!("Block scanner and transfer extractor for UTXO chains\n");
    println!("USAGE:");
    println!("    chainscan <COMMAND> [OPTIONS]\n");
    println!("COMMANDS:");
    println!("    status           Show checkpoints, stored blocks and pending retries");
    println!("    unscanned        List unscanned records awaiting retry");
    println!("    purge-not-found  Delete unscanned records for transactions the node does not know");
    println!("    reset-height     Make the next scan cycle resume at --height");
    println!("    info             Show the effective scanner configuration");
    println!("    version          Print version");
    println!("    help             Print this help\n");
    println!("OPTIONS:");
    println!("    --db <path>          SQLite database (default ./chainscan.db)");
    println!("    --chain <id>         Chain id (default from config)");
    println!("    --config <file>      JSON scanner configuration");
    println!("    --log-level <level>  trace | debug | info | warn | error");
    println!("    --log-json           Emit JSON logs");
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Value following `name`, e.g. `--db ./scan.db`.
fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn load_config(args: &[String]) -> anyhow::Result<ScannerConfig> {
    let mut config = match flag(args, "--config") {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {path}"))?
        }
        None => ScannerConfig::default(),
    };
    if let Some(chain) = flag(args, "--chain") {
        config.chain_id = chain.to_string();
    }
    Ok(config)
}

async fn open_store(args: &[String]) -> anyhow::Result<Arc<SqliteStorage>> {
    let path = flag(args, "--db").unwrap_or("./chainscan.db");
    let store = SqliteStorage::open(path)
        .await
        .with_context(|| format!("opening database {path}"))?;
    tracing::debug!(path, "database opened");
    Ok(Arc::new(store))
}

fn format_time(ts: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(ts, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

async fn cmd_status(args: &[String]) -> anyhow::Result<()> {
    let store = open_store(args).await?;
    let only = flag(args, "--chain");

    let checkpoints: Vec<_> = store
        .all_checkpoints()
        .await?
        .into_iter()
        .filter(|cp| only.map_or(true, |c| c == cp.chain_id))
        .collect();
    if checkpoints.is_empty() {
        println!("No checkpoints stored.");
        return Ok(());
    }

    for cp in checkpoints {
        let pending = store.all_unscanned(&cp.chain_id).await?.len();
        let blocks = store.block_count(&cp.chain_id).await?;
        println!("{}", cp.chain_id);
        println!("  Scanned height:  {}", cp.height);
        println!("  Scanned hash:    {}", cp.hash);
        println!("  Updated at:      {}", format_time(cp.updated_at));
        println!("  Stored blocks:   {blocks}");
        println!("  Pending retries: {pending}");
    }
    Ok(())
}

async fn cmd_unscanned(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let store = open_store(args).await?;
    let manager = CheckpointManager::new(store, config.chain_id.clone());

    let records = manager.unscanned().await?;
    if records.is_empty() {
        println!("No unscanned records for {}.", config.chain_id);
        return Ok(());
    }
    for r in records {
        let tx = if r.tx_id.is_empty() { "-" } else { r.tx_id.as_str() };
        println!("{:>10}  {:<66}  {}", r.block_height, tx, r.reason);
    }
    Ok(())
}

async fn cmd_purge_not_found(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let store = open_store(args).await?;
    let manager = CheckpointManager::new(store, config.chain_id.clone());

    let removed = manager
        .purge_unscanned_matching(&config.not_found_reason)
        .await?;
    tracing::info!(chain = %config.chain_id, removed, "purged unscanned records");
    println!("Removed {removed} unscanned records from {}.", config.chain_id);
    Ok(())
}

async fn cmd_reset_height(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let height: u64 = flag(args, "--height")
        .ok_or_else(|| anyhow!("--height is required"))?
        .parse()
        .context("--height must be a block height")?;
    if height == 0 {
        bail!("block height to rescan must be greater than 0");
    }
    let target = height - 1;

    let store = open_store(args).await?;
    let manager = CheckpointManager::new(store, config.chain_id.clone());

    let hash = match flag(args, "--hash") {
        Some(hash) => hash.to_string(),
        None => manager
            .block_at_height(target)
            .await?
            .map(|b| b.hash)
            .ok_or_else(|| anyhow!("block {target} is not stored locally; pass --hash"))?,
    };

    manager.save(target, &hash).await?;
    println!("{}: next scan cycle resumes at height {height}", config.chain_id);
    Ok(())
}

fn cmd_info(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    println!("chainscan v{}", env!("CARGO_PKG_VERSION"));
    println!("  Chain:                 {} ({})", config.chain_id, config.symbol);
    println!("  Decimals:              {}", config.decimals);
    println!("  Max concurrent txs:    {}", config.max_extracting_size);
    println!("  Tail rescan:           {} blocks", config.rescan_last_block_count);
    println!("  Fork rewind depth:     {} blocks", config.fork_rewind_depth);
    println!("  Max fetch failures:    {}", config.max_fetch_failures);
    println!("  Poll interval:         {} ms", config.poll_interval_ms);
    println!("  Token protocol:        {}", config.token_protocol);
    println!("  Storage backends:      memory ledger, SQLite");
    Ok(())
}
