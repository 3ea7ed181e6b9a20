use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use blockgrid::config::{Credentials, NetworkConfig, SWEEP_INTERVAL_SECS};
use blockgrid::consensus::grid::Blockgrid;
use blockgrid::crypto::rsa;
use blockgrid::net::oracle::TrustOracle;
use blockgrid::net::sync::ReconciliationClient;
use blockgrid::node::store::PersistentStore;
use blockgrid::node::{GridStore, sweeper};
use blockgrid::rpc::server::{ServerState, start_http_server};

use colored::*;

fn banner() {
    println!(
        "{}",
        " ██████╗ ██╗      ██████╗  ██████╗██╗  ██╗ ██████╗ ██████╗ ██╗██████╗ ".bright_cyan()
    );
    println!(
        "{}",
        " ██╔══██╗██║     ██╔═══██╗██╔════╝██║ ██╔╝██╔════╝ ██╔══██╗██║██╔══██╗".bright_cyan()
    );
    println!(
        "{}",
        " ██████╔╝██║     ██║   ██║██║     █████╔╝ ██║  ███╗██████╔╝██║██║  ██║"
            .bright_cyan()
            .bold()
    );
    println!(
        "{}",
        " ██╔══██╗██║     ██║   ██║██║     ██╔═██╗ ██║   ██║██╔══██╗██║██║  ██║"
            .bright_cyan()
            .bold()
    );
    println!(
        "{}",
        " ██████╔╝███████╗╚██████╔╝╚██████╗██║  ██╗╚██████╔╝██║  ██║██║██████╔╝".blue()
    );
    println!(
        "{}",
        " ╚═════╝ ╚══════╝ ╚═════╝  ╚═════╝╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝╚═════╝ ".blue()
    );
    println!();
    println!(
        "{}",
        "        Spatially-Indexed Proof-of-Work Asset Ledger        "
            .bright_green()
            .bold()
    );
    println!();
}

fn store_timing() -> (Duration, Duration) {
    let ms = |var: &str, default_ms: u64| {
        std::env::var(var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_ms)
    };
    (
        Duration::from_millis(ms("BLOCKGRID_STORE_PACE_MS", 3_000)),
        Duration::from_millis(ms("BLOCKGRID_STORE_RETRY_MS", 1_000)),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    banner();

    let config = NetworkConfig::standalone();
    println!(
        "{} data dir: {}",
        "[init]".bright_blue().bold(),
        config.data_dir
    );
    std::fs::create_dir_all(&config.data_dir)?;
    let data_dir = PathBuf::from(&config.data_dir);

    let credentials = Credentials::load(&data_dir);
    if credentials.web_api_key.is_empty() {
        println!(
            "{} no web API key — moderator checks will fail closed",
            "[init]".yellow().bold()
        );
    }
    println!(
        "{} {} moderator id(s) on the allowlist",
        "[init]".bright_blue().bold(),
        credentials.moderators.len()
    );

    let server_keys = rsa::load_or_generate(&data_dir)?;
    println!("{} server keypair ready", "[init]".bright_blue().bold());

    let inner = Arc::new(GridStore::open(&data_dir.join("griddata"))?);
    let (pace, retry) = store_timing();
    let store = PersistentStore::with_timing(inner, pace, retry);
    println!("{} grid store opened", "[init]".bright_blue().bold());

    let blockgrid = Blockgrid::open(store.clone()).await?;
    println!(
        "{} grid rehydrated: {} cell(s)",
        "[init]".bright_blue().bold(),
        blockgrid.len()
    );

    let state = Arc::new(ServerState {
        blockgrid: Arc::new(RwLock::new(blockgrid)),
        edit_lock: Mutex::new(()),
        store: store.clone(),
        oracle: TrustOracle::new(credentials.web_api_key, credentials.moderators),
        server_keys,
        resolver: ReconciliationClient::new(),
        shutdown: AtomicBool::new(false),
    });

    // Seed peers for reconciliation, e.g. BLOCKGRID_PEERS=host:5000,host2:5000
    if let Ok(peers) = std::env::var("BLOCKGRID_PEERS") {
        let mut blockgrid = state.blockgrid.write().await;
        for peer in peers.split(',').filter(|p| !p.trim().is_empty()) {
            blockgrid.register_node(peer);
        }
        println!(
            "{} {} seed peer(s) registered",
            "[init]".bright_blue().bold(),
            blockgrid.nodes().len()
        );
    }

    let _sweeper = sweeper::spawn(
        state.blockgrid.clone(),
        store,
        Duration::from_secs(SWEEP_INTERVAL_SECS),
    );
    println!("{} sweeper scheduled", "[sweep]".bright_blue().bold());

    println!(
        "{} listening on {}:{}",
        "[http]".bright_magenta().bold(),
        blockgrid::config::HTTP_BIND_ADDRESS,
        config.http_port
    );
    println!();
    println!(
        "{}",
        "  Usage: blockgrid-cli <command> [args...]"
            .bright_yellow()
            .bold()
    );
    println!("  {} blockgrid-cli grid", "❯".bright_black());
    println!("  {} blockgrid-cli mine 0 0 0", "❯".bright_black());
    println!(
        "  {} blockgrid-cli addnode 192.168.0.5:5000",
        "❯".bright_black()
    );
    println!("  {} blockgrid-cli resolve", "❯".bright_black());
    println!();

    start_http_server(state, config.http_port).await?;
    println!("{} done", "[shutdown]".bright_red().bold());
    Ok(())
}
