//! Circuit breakers - named breakers with a management API

use std::collections::BTreeMap;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use circuit_breakers::{
    cli::{Cli, Command},
    config::{BreakerConfig, Config},
    gateway::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => check_config(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load the config file and apply CLI overrides
fn load_config(cli: &Cli) -> circuit_breakers::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if cli.strict {
        config.breakers.strict = true;
    }
    Ok(config)
}

/// Print every pre-registered and overridden breaker's effective config
fn check_config(config: &Config) -> ExitCode {
    let registry = &config.breakers;
    let effective: BTreeMap<&str, BreakerConfig> = registry
        .preregister
        .iter()
        .chain(registry.overrides.keys())
        .map(|name| (name.as_str(), registry.config_for(name)))
        .collect();

    match serde_yaml::to_string(&effective) {
        Ok(yaml) => {
            println!("{yaml}");
            println!("Configuration OK ({} breakers, strict={})", effective.len(), registry.strict);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        breakers = config.breakers.preregister.len(),
        strict = config.breakers.strict,
        "Starting circuit breaker server"
    );

    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
