//! ecusimd - scripted ECU simulator daemon
//!
//! Loads every Lua simulation script from the script directory and answers
//! diagnostic requests on the fronts each script enables: UDS over ISO-TP
//! and J1939 on the given CAN device, DoIP over TCP/UDP.
//!
//! # Usage
//!
//! ```bash
//! ./ecusimd vcan0        # CAN + DoIP
//! ./ecusimd              # DoIP only
//! ```
//!
//! Watch the ISO-TP traffic with
//! `isotpsniffer -s 100 -d 200 -c -td vcan0`.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use ecusim::config::DoipServerConfig;
use ecusim::doip::DoipServer;
use ecusim::j1939::J1939Simulator;
use ecusim::uds::UdsSimulator;
use ecusim::EcuModel;

/// Script directory, fixed at build time.
fn script_dir() -> &'static str {
    option_env!("ECUSIM_SCRIPT_DIR").unwrap_or("scripts")
}

#[derive(Parser, Debug)]
#[command(name = "ecusimd")]
#[command(about = "Scripted ECU simulator for UDS/ISO-TP, DoIP and J1939")]
struct Args {
    /// CAN device name (e.g. "vcan0"); empty disables CAN and runs DoIP-only
    #[arg(default_value = "")]
    device: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "ecusim=debug,ecusimd=debug"
    } else {
        "ecusim=info,ecusimd=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dir = PathBuf::from(script_dir());
    info!(dir = %dir.display(), "loading simulation scripts");

    let mut models: Vec<Arc<EcuModel>> = Vec::new();
    match std::fs::read_dir(&dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("lua") {
                    continue;
                }
                match EcuModel::load(&path) {
                    Ok(model) => {
                        info!(ecu = model.ident(), "loaded simulation");
                        models.push(Arc::new(model));
                    }
                    Err(err) => {
                        // One bad script disables that ECU only.
                        error!(script = %path.display(), error = %err, "failed to load simulation, ECU disabled");
                    }
                }
            }
        }
        Err(err) => error!(dir = %dir.display(), error = %err, "cannot read script directory"),
    }

    if models.is_empty() {
        warn!("no simulation scripts loaded");
    }

    let running = Arc::new(AtomicBool::new(true));
    let mut handles = Vec::new();
    let mut j1939_simulators = Vec::new();

    if args.device.is_empty() {
        info!("CAN disabled - DoIP only");
    } else {
        info!(device = %args.device, "starting CAN fronts");
        for model in &models {
            if UdsSimulator::has_simulation(model) {
                let simulator = UdsSimulator::new(model.clone());
                match simulator.spawn(&args.device, running.clone()) {
                    Ok(mut spawned) => handles.append(&mut spawned),
                    Err(err) => {
                        error!(ecu = model.ident(), error = %err, "failed to start UDS front")
                    }
                }
            }
            if J1939Simulator::has_simulation(model) {
                match J1939Simulator::new(&args.device, model.clone(), running.clone()) {
                    Ok(simulator) => {
                        handles.append(&mut simulator.spawn());
                        j1939_simulators.push(simulator);
                    }
                    Err(err) => {
                        error!(ecu = model.ident(), error = %err, "failed to start J1939 front")
                    }
                }
            }
        }
    }

    let doip_config = models.iter().find_map(|model| DoipServerConfig::from_model(model));
    let doip_ecus: Vec<Arc<EcuModel>> = models
        .iter()
        .filter(|model| model.doip_logical_address.is_some())
        .cloned()
        .collect();
    if doip_config.is_some() || !doip_ecus.is_empty() {
        let config = doip_config.unwrap_or_default();
        info!(
            logical_address = format!("0x{:04X}", config.logical_address),
            ecus = doip_ecus.len(),
            "starting DoIP server"
        );
        let server = DoipServer::new(config, doip_ecus, running.clone());
        handles.append(&mut server.start());
    }

    info!("simulator ready, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("SIGINT received, shutting down");

    running.store(false, Ordering::SeqCst);
    for simulator in &j1939_simulators {
        simulator.stop();
    }
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    process::exit(1);
}
