//! Entry point for the `fleetd` binary: the Host runs by default, the
//! Runner Agent runs under `--agent <config path>`.

use std::env;

use anyhow::Result;
use fleetd::config::{AgentConfig, Config};
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("fleetd version {VERSION}");
        return Ok(());
    }

    if args.len() > 1 && args[1] == "--agent" {
        if args.len() != 3 {
            eprintln!("Usage: fleetd --agent /path/to/agent.toml");
            std::process::exit(1);
        }
        let config_path = &args[2];
        let config = match AgentConfig::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load agent configuration from \"{config_path}\": {e}");
                std::process::exit(1);
            }
        };

        if let Err(e) = fleetd::runner::run(config).await {
            error!("runner agent runtime error: {}", e);
            return Err(e);
        }
    } else {
        let config_path = args
            .iter()
            .position(|arg| arg == "--config")
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
            .unwrap_or("config.toml");

        let mut config = match Config::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{config_path}\": {e}");
                std::process::exit(1);
            }
        };

        if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
            if let Some(port_str) = args.get(port_index + 1) {
                match port_str.parse::<u16>() {
                    Ok(port) => config.port = port,
                    Err(_) => {
                        eprintln!("Invalid port number: {port_str}");
                        std::process::exit(1);
                    }
                }
            } else {
                eprintln!("--port flag requires a value");
                std::process::exit(1);
            }
        }

        let initial_log_level =
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
        let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
            .init();

        if let Err(e) = fleetd::host::run(config).await {
            error!("host runtime error: {}", e);
            return Err(e);
        }
    }

    Ok(())
}
