//! VMQ Backend Daemon
//!
//! Runs scripted peer negotiations against the in-memory collaborators and
//! prints the resulting attachment state as JSON.
//!
//! # Usage
//!
//! ```bash
//! vmq-backd simulate --osid 5 --if-num 2
//! vmq-backd simulate --peer-states Initialising,Initialised,Closed --online
//! vmq-backd default-config > /etc/vmq/backend.json
//! vmq-backd check-host
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmq_backend::store::keys;
use vmq_backend::{
    in_hypervisor_domain, BackendConfig, BackendContext, DeviceNode, LocalEventHub,
    LocalRegistrar, MemChainPool, MemStore, StoreClient, VmqBackend,
};

#[derive(Parser)]
#[command(name = "vmq-backd")]
#[command(version)]
#[command(about = "Switch queue backend simulator", long_about = None)]
struct Cli {
    /// Backend configuration file (JSON)
    #[arg(long, env = "VMQ_CONFIG", default_value = "/etc/vmq/backend.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach one device and replay peer state changes
    Simulate {
        /// Peer owner id
        #[arg(long, default_value_t = 5)]
        osid: u32,
        /// Peer interface index
        #[arg(long, default_value_t = 2)]
        if_num: u32,
        /// Peer domain
        #[arg(long, default_value_t = 1)]
        domain: u32,
        /// Peer transmit notification port
        #[arg(long, default_value_t = 40)]
        tx_port: u32,
        /// Peer receive notification port
        #[arg(long, default_value_t = 41)]
        rx_port: u32,
        /// Keep the device registered across a peer close
        #[arg(long)]
        online: bool,
        /// Peer state tokens, applied in order
        #[arg(
            long,
            value_delimiter = ',',
            default_value = "Initialising,Initialised,Connected,Closing,Closed"
        )]
        peer_states: Vec<String>,
        /// Data-ready notifications raised once connected
        #[arg(long, default_value_t = 1)]
        data_ready: u32,
    },
    /// Print the default configuration
    DefaultConfig,
    /// Report whether this host runs in a hypervisor domain
    CheckHost,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&BackendConfig::default())?);
        }
        Commands::CheckHost => {
            let virtualized = in_hypervisor_domain();
            println!("{}", serde_json::json!({ "virtualized": virtualized }));
        }
        Commands::Simulate {
            osid,
            if_num,
            domain,
            tx_port,
            rx_port,
            online,
            peer_states,
            data_ready,
        } => {
            let config = BackendConfig::load(&cli.config).unwrap_or_else(|_| {
                tracing::warn!(path = %cli.config, "config not found, using defaults");
                BackendConfig::default()
            });
            let peer = Peer {
                osid,
                if_num,
                domain,
                tx_port,
                rx_port,
                online,
            };
            simulate(config, peer, &peer_states, data_ready).await?;
        }
    }

    Ok(())
}

struct Peer {
    osid: u32,
    if_num: u32,
    domain: u32,
    tx_port: u32,
    rx_port: u32,
    online: bool,
}

async fn simulate(
    config: BackendConfig,
    peer: Peer,
    peer_states: &[String],
    data_ready: u32,
) -> anyhow::Result<()> {
    tracing::info!("vmq-backd v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(MemStore::new());
    let pool = Arc::new(MemChainPool::new(
        config.pool_first_index,
        config.pool_size as usize,
    ));
    let hub = Arc::new(LocalEventHub::new());
    let registrar = Arc::new(LocalRegistrar::new(config.max_devices, pool.clone()));

    let device_type = config
        .device_types
        .first()
        .cloned()
        .context("configuration names no device type")?;
    let device = DeviceNode {
        nodename: format!("/local/domain/0/backend/{}/{}/0", device_type, peer.domain),
        otherend: format!("/local/domain/{}/device/{}/0", peer.domain, device_type),
        otherend_id: peer.domain,
        device_type,
    };

    store.set(&device.otherend, keys::OSID, peer.osid.to_string());
    store.set(&device.otherend, keys::IF_NUM, peer.if_num.to_string());
    store.set(&device.otherend, keys::TX_EVTCHN, peer.tx_port.to_string());
    store.set(&device.otherend, keys::RX_EVTCHN, peer.rx_port.to_string());
    if peer.online {
        store.set(&device.nodename, keys::ONLINE, "1");
    }

    let ctx = Arc::new(BackendContext::new(
        StoreClient::new(store.clone()),
        pool.clone(),
        pool.clone(),
        hub.clone(),
        registrar,
        config,
    ));
    // The simulated bus always stands in for a hypervisor domain
    let backend = VmqBackend::start(ctx, true)?;

    let path = device.nodename.clone();
    let otherend = device.otherend.clone();
    let info = backend.probe(device).await.context("attach failed")?;
    println!("{}", serde_json::to_string_pretty(&info)?);

    for token in peer_states {
        store.set(&otherend, keys::STATE, token.as_str());
        match backend.peer_changed(&path, token).await {
            Ok(state) => tracing::info!(peer = %token, local = %state, "peer state applied"),
            Err(e) => tracing::error!(peer = %token, error = %e, "peer state rejected"),
        }

        let connected = backend
            .snapshot(&path)
            .await
            .map(|s| s.tx_irq.is_some())
            .unwrap_or(false);
        if connected {
            for _ in 0..data_ready {
                if let Some(chain) = info.tx_chain {
                    backend.on_chain_data(chain);
                }
            }
            // Peer posts receive buffers once per connected step
            hub.raise(peer.rx_port);
        }
    }

    let report = serde_json::json!({
        "attachments": backend.attachments().await,
        "backend": backend.stats(),
        "pool": pool.stats(),
        "state_log": store.history(&path, keys::STATE),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    backend.shutdown().await;
    Ok(())
}
