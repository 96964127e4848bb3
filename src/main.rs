//! tart-driver plugin entry point.
//!
//! The binary is normally launched and driven by the host orchestrator over
//! its plugin transport. Run standalone it still constructs the full driver
//! and reports health, which is handy for checking a node's tart setup.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tart_driver::plugin::DriverPlugin;
use tart_driver::{Driver, DriverSchemas, TartClient};

/// VM task driver plugin for cluster workload schedulers.
#[derive(Parser, Debug)]
#[command(name = "tart-driver")]
#[command(about = "Run VMs as scheduler tasks through the tart CLI")]
#[command(version)]
struct Cli {
    /// Plugin-wide config as JSON (normally supplied by the host).
    #[arg(long)]
    config: Option<String>,

    /// Probe the node once, print the fingerprint, and exit.
    #[arg(long)]
    probe: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    tracing::debug!(version = tart_driver::VERSION, "starting tart-driver");

    // Schemas are built once here and handed to the driver; the host reads
    // them through the plugin contract.
    let schemas = DriverSchemas::new();
    let driver = Driver::new(Arc::new(TartClient::new()), schemas);

    if let Some(raw) = cli.config.as_deref() {
        let value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("Error: invalid --config JSON: {}", e);
                std::process::exit(1);
            }
        };
        if let Err(e) = driver.set_config(value) {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let mut fingerprints = driver.fingerprint();

    if cli.probe {
        match fingerprints.recv().await {
            Some(fp) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&fp).unwrap_or_else(|_| format!("{:?}", fp))
                );
            }
            None => {
                eprintln!("Error: no fingerprint produced");
                std::process::exit(1);
            }
        }
        driver.shutdown();
        return;
    }

    // Serve until the host (or an operator) tears us down.
    loop {
        tokio::select! {
            fp = fingerprints.recv() => {
                match fp {
                    Some(fp) => tracing::info!(
                        health = %serde_json::to_string(&fp.health).unwrap_or_default(),
                        description = %fp.health_description,
                        "fingerprint"
                    ),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                break;
            }
        }
    }

    driver.shutdown();
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tart_driver=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
