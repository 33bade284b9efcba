//! minikv server binary
//!
//! Main entry point for the minikv TCP server

use minikv::config::CliAction;
use minikv::{MiniKvServer, Result, ServerConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match ServerConfig::from_args(std::env::args().skip(1)) {
        Ok(CliAction::Run(config)) => config,
        Ok(CliAction::Help) => {
            print_help();
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!(
        topology = ?config.topology,
        data_dir = %config.data_dir.display(),
        "Starting minikv"
    );

    let server = Arc::new(MiniKvServer::new(config).await?);

    // Setup graceful shutdown on SIGINT (Ctrl+C)
    let server_clone = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }

        info!("Received Ctrl+C, initiating graceful shutdown...");
        if let Err(e) = server_clone.shutdown() {
            error!("Failed to initiate shutdown: {}", e);
        }
    });

    server.run().await?;
    server.close().await;

    Ok(())
}

fn print_help() {
    println!(
        r#"minikv - in-memory key-value store with per-key expiry

USAGE:
    server [OPTIONS]

OPTIONS:
    -b, --bind <ADDR>              Address to listen on (default: 127.0.0.1:6379)
    -d, --data-dir <DIR>           Directory for snapshots (default: data)
    -t, --topology <session|shared>
                                   One store per connection or one per process (default: session)
        --sweep-interval-ms <MS>   Background expiry sweep interval, 0 disables it (default: 1000)
        --max-connections <N>      Maximum concurrent clients (default: 1000)
        --max-line-bytes <N>       Longest accepted command line (default: 67108864)
        --no-autosave              Do not restore or write autosave.json
    -h, --help                     Print this help message

Set RUST_LOG to change the log level (default: info)."#
    );
}
