//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Circuit breaker registry with a management API
#[derive(Parser, Debug)]
#[command(name = "circuit-breakers")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CIRCUIT_BREAKERS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CIRCUIT_BREAKERS_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "CIRCUIT_BREAKERS_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CIRCUIT_BREAKERS_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CIRCUIT_BREAKERS_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Reject calls to unregistered breakers
    #[arg(long, global = true)]
    pub strict: bool,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start the management server (default)
    Serve,

    /// Validate the configuration and print every effective breaker config
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve_mode() {
        let cli = Cli::try_parse_from(["circuit-breakers"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.log_level, "info");
        assert!(!cli.strict);
    }

    #[test]
    fn parses_overrides_and_subcommand() {
        let cli = Cli::try_parse_from([
            "circuit-breakers",
            "--port",
            "8080",
            "--strict",
            "check-config",
            "--config",
            "breakers.yaml",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(8080));
        assert!(cli.strict);
        assert_eq!(cli.command, Some(Command::CheckConfig));
        assert_eq!(cli.config, Some(PathBuf::from("breakers.yaml")));
    }
}
