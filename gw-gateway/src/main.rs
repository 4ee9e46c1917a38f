//! Gateway binary entry point.
//!
//! Parses CLI flags, loads configuration, and spins up the task topology
//! that wires `gw-core`'s protocol engine to a BLE central and UART port.
//! The BLE central itself is a platform driver concern outside this
//! crate's scope (see the `BleCentral` trait in [`ble`]); a real adapter
//! is supplied by the embedding platform.

mod app;
mod ble;
mod config;
mod intermcu_task;
mod pairing_store;
mod session_task;
mod uart;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use clap::Parser;
use tokio::sync::{mpsc, watch, Mutex};

use ble::mock::MockCentral;
use config::GatewayConfig;
use gw_core::manager::DeviceManager;
use pairing_store::FilePairingStore;

#[derive(Parser, Debug)]
#[command(name = "gw-gateway", about = "Portable-power-station BLE gateway")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured log filter (e.g. "debug", "gw_core=trace").
    #[arg(short, long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref())?;

    let filter = cli.log.clone().unwrap_or_else(|| config.log_filter.clone());
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(filter)).compact().init();

    tracing::info!(?config, "starting gateway");

    let store = FilePairingStore::open(&config.pairing_store_path)?;
    let manager = Arc::new(Mutex::new(DeviceManager::new(store)));
    let session_inboxes: app::SessionInboxes = Arc::new(StdMutex::new(HashMap::new()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    // `BleCentral` and `UartPort` are platform driver seams this crate
    // never implements (see their doc comments): a real deployment supplies
    // a concrete adapter for the BLE radio and the display co-processor's
    // serial link in their place. Until one is wired in, drive the same
    // manager/radio/inter-MCU task topology against `ble::mock::MockCentral`
    // (an idle central: empty scan and notification streams) and an
    // in-memory UART loopback, so the binary actually runs the protocol
    // engine end to end instead of sitting inert.
    tracing::warn!("no platform BleCentral/UartPort adapter wired in; running against an idle in-memory mock");
    let central: Arc<dyn ble::BleCentral> = Arc::new(MockCentral::default());
    let (uart_port, _uart_peer) = tokio::io::duplex(4096);
    let uart = Arc::new(Mutex::new(uart_port));
    let (_ota_tx, ota_rx) = mpsc::channel(1);
    let (progress_tx, _progress_rx) = watch::channel(None);

    let manager_task = tokio::spawn(app::run_manager(
        manager.clone(),
        central.clone(),
        session_inboxes.clone(),
        config.pairing_user_id.clone(),
        shutdown_rx,
    ));
    tokio::spawn(app::run_radio(central, manager, session_inboxes));
    tokio::spawn(intermcu_task::run_inter_mcu(uart, ota_rx, progress_tx));

    manager_task.await?;
    Ok(())
}
