//! Tollway CLI
//!
//! Runs a paid tunnel entry and the node measurement tools.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tollway_core::Configuration;
use tollway_entry::{
    ClaimWallet, DirectConnector, PaymentWallet, ReverseServer, SessionManager, TunnelEntry,
    CONNECT_RETRY_INTERVAL,
};
use tollway_measure::{
    bandwidth_measurement_client, bandwidth_measurement_server, delay_measurement, Network,
};
use tollway_storage::{FavoriteNode, MeasureStorage};

/// Tollway - paid TCP/UDP tunnels
#[derive(Parser)]
#[command(name = "tollway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward the configured services through paid exits
    Entry {
        /// Path to config.json
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,

        /// Exit address per service (format: <service>=<host:port>)
        #[arg(short, long)]
        exit: Vec<String>,
    },

    /// Measure a node
    Probe {
        #[command(subcommand)]
        action: ProbeAction,
    },

    /// Show stored favorite and avoided nodes
    Nodes {
        /// Storage directory
        #[arg(short, long)]
        dir: PathBuf,

        /// Print the store as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProbeAction {
    /// Time a connection handshake
    Delay {
        /// Address to probe (host:port)
        addr: String,

        /// Network to probe over
        #[arg(short, long, default_value = "tcp")]
        network: Network,

        /// Give up after this many milliseconds (0 = never)
        #[arg(long, default_value = "3000")]
        timeout_ms: u64,
    },

    /// Download a fixed number of bytes and report throughput
    Bandwidth {
        /// Address of a `probe serve` endpoint (host:port)
        addr: String,

        /// Bytes to download
        #[arg(short, long, default_value = "1048576")]
        bytes: usize,

        /// Give up after this many milliseconds (0 = never)
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,

        /// Record the result as a favorite node in this storage directory
        #[arg(long)]
        record: Option<PathBuf>,
    },

    /// Answer bandwidth probes
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:30030")]
        listen: SocketAddr,

        /// Bytes to send to every prober
        #[arg(short, long, default_value = "1048576")]
        bytes: usize,

        /// Per-probe deadline in milliseconds (0 = never)
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "debug"
    } else {
        "info,tollway=debug"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn millis(timeout_ms: u64) -> Option<Duration> {
    (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Entry { config, exit } => {
            run_entry(&config, &exit).await?;
        }
        Commands::Probe { action } => {
            run_probe(action).await?;
        }
        Commands::Nodes { dir, json } => {
            if json {
                let store = MeasureStorage::new(&dir);
                store.load()?;
                println!("{}", serde_json::to_string_pretty(&nodes_report(&store))?);
            } else {
                show_nodes(&dir)?;
            }
        }
    }

    Ok(())
}

// ============================================================================
// Entry
// ============================================================================

fn parse_exits(exits: &[String]) -> Result<HashMap<String, String>> {
    exits
        .iter()
        .map(|arg| match arg.split_once('=') {
            Some((service, addr)) if !service.is_empty() && !addr.is_empty() => {
                Ok((service.to_string(), addr.to_string()))
            }
            _ => bail!("Invalid exit {:?}, expected <service>=<host:port>", arg),
        })
        .collect()
}

async fn run_entry(config_path: &Path, exits: &[String]) -> Result<()> {
    let config = Configuration::load_from(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    config.validate().context("Invalid configuration")?;
    let claim_wallet = ClaimWallet::from_seed(&config.seed).context("Invalid seed")?;
    info!("Paying from {}", claim_wallet.address());
    let wallet: Arc<dyn PaymentWallet> = Arc::new(claim_wallet);

    if config.reverse {
        let server = ReverseServer::bind(config, wallet).await?;
        let metadata = server.advertised_metadata()?;
        info!(
            "Reverse entry offering tcp {} udp {} at price {:?}",
            metadata.tcp_port, metadata.udp_port, metadata.price
        );

        tokio::select! {
            result = server.run() => result?,
            _ = tokio::signal::ctrl_c() => info!("Shutting down reverse entry"),
        }
        return Ok(());
    }

    let exits = parse_exits(exits)?;
    if config.services.is_empty() {
        bail!("No services configured in {}", config_path.display());
    }

    let config = Arc::new(config);
    let mut handles = Vec::new();
    for service in config.services.keys() {
        let Some(addr) = exits.get(service) else {
            bail!("No exit given for service {:?}", service);
        };
        let max_price = config
            .max_price(service)
            .with_context(|| format!("Invalid max price for {}", service))?;
        handles.push(tokio::spawn(run_service(
            service.clone(),
            addr.clone(),
            max_price,
            config.clone(),
            wallet.clone(),
        )));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down {} entries", handles.len());
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

/// Keep one service forwarded, starting a fresh entry whenever the last
/// one exits
async fn run_service(
    service: String,
    addr: String,
    max_price: Option<tollway_core::Amount>,
    config: Arc<Configuration>,
    wallet: Arc<dyn PaymentWallet>,
) {
    loop {
        let connector = Arc::new(DirectConnector::new(addr.clone(), config.dial_timeout()));
        let manager = SessionManager::dial(service.clone(), connector, max_price);
        match TunnelEntry::new(manager, &config, wallet.clone()) {
            Ok(entry) => match entry.start().await {
                Ok(()) => info!("Entry for {} closed, restarting", service),
                Err(e) => warn!("Entry for {} failed: {}", service, e),
            },
            Err(e) => {
                error!("Couldn't create entry for {}: {}", service, e);
                return;
            }
        }
        tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
    }
}

// ============================================================================
// Probes
// ============================================================================

async fn run_probe(action: ProbeAction) -> Result<()> {
    match action {
        ProbeAction::Delay {
            addr,
            network,
            timeout_ms,
        } => {
            let delay = delay_measurement(network, &addr, millis(timeout_ms)).await?;
            println!("{} {} delay: {:?}", network, addr, delay);
        }
        ProbeAction::Bandwidth {
            addr,
            bytes,
            timeout_ms,
            record,
        } => {
            probe_bandwidth(&addr, bytes, millis(timeout_ms), record.as_deref()).await?;
        }
        ProbeAction::Serve {
            listen,
            bytes,
            timeout_ms,
        } => {
            serve_bandwidth(listen, bytes, millis(timeout_ms)).await?;
        }
    }
    Ok(())
}

async fn probe_bandwidth(
    addr: &str,
    bytes: usize,
    timeout: Option<Duration>,
    record: Option<&Path>,
) -> Result<()> {
    let delay = delay_measurement(Network::Tcp, addr, timeout).await?;

    let mut conn = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    let peer = conn.peer_addr()?;
    let bandwidth = bandwidth_measurement_client(&mut conn, bytes, timeout).await?;

    println!("Node:      {}", addr);
    println!("Delay:     {:?}", delay);
    println!("Bandwidth: {:.0} B/s", bandwidth.total_bps);
    println!("Steady:    {:.0} B/s", bandwidth.steady_bps);

    if let Some(dir) = record {
        let store = MeasureStorage::new(dir);
        store.load()?;
        let node = FavoriteNode {
            ip: peer.ip().to_string(),
            address: addr.to_string(),
            delay: delay.as_secs_f32() * 1000.0,
            min_bandwidth: bandwidth.total_bps.min(bandwidth.steady_bps),
            max_bandwidth: bandwidth.total_bps.max(bandwidth.steady_bps),
            ..Default::default()
        };
        if store.add_favorite_node(addr, node)? {
            println!("Recorded {} as a favorite node", addr);
        } else {
            println!("{} is slower than every stored favorite, not recorded", addr);
        }
    }
    Ok(())
}

async fn serve_bandwidth(listen: SocketAddr, bytes: usize, timeout: Option<Duration>) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Serving {} bytes per probe on {}", bytes, listener.local_addr()?);

    loop {
        let (mut conn, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        tokio::spawn(async move {
            match bandwidth_measurement_server(&mut conn, bytes, timeout).await {
                Ok(()) => info!("Served bandwidth probe for {}", peer),
                Err(e) => warn!("Bandwidth probe for {} failed: {}", peer, e),
            }
        });
    }
}

// ============================================================================
// Node store
// ============================================================================

fn expiry_label(secs: i64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let left = secs - now;
    if left <= 0 {
        "expired".to_string()
    } else {
        format!("expires in {}h", left / 3600)
    }
}

fn nodes_report(store: &MeasureStorage) -> serde_json::Value {
    let blocked: Vec<String> = store
        .get_avoid_cidr()
        .iter()
        .map(|net| net.to_string())
        .collect();
    serde_json::json!({
        "favorites": store.favorite_nodes(),
        "avoided": store.avoid_nodes(),
        "blocked": blocked,
    })
}

fn show_nodes(dir: &Path) -> Result<()> {
    let store = MeasureStorage::new(dir);
    store.load()?;

    let favorites = store.favorite_nodes();
    println!("Favorite nodes ({})", favorites.len());
    println!("==================");
    for (key, node) in &favorites {
        println!(
            "{}  delay {:.1}ms  bandwidth {:.0}-{:.0} B/s  {}",
            key,
            node.delay,
            node.min_bandwidth,
            node.max_bandwidth,
            expiry_label(node.expires_at)
        );
    }

    let avoided = store.avoid_nodes();
    let cidrs = store.get_avoid_cidr();
    println!();
    println!("Avoided subnets ({} tracked, {} blocked)", avoided.len(), cidrs.len());
    println!("==================");
    for (subnet, nodes) in &avoided {
        let blocked = cidrs.iter().any(|net| net.to_string() == *subnet);
        println!(
            "{}  {} node(s){}",
            subnet,
            nodes.len(),
            if blocked { "  [blocked]" } else { "" }
        );
    }
    Ok(())
}
