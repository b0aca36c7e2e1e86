//! Circuit Breakers Library
//!
//! Named circuit breakers that fail fast when a dependency is unhealthy.
//!
//! # Features
//!
//! - **Rolling window**: failure rate over a time-bounded window of outcomes,
//!   gated by a minimum throughput
//! - **State machine**: closed, open and half-open with bounded concurrent probes
//!   and a success quorum
//! - **Retries**: per-attempt timeouts, exponential backoff with jitter
//! - **Fallbacks**: cached response, degraded placeholder, or the original error;
//!   overridable per call
//! - **Registry**: one shared map of named breakers, pre-registered at startup
//! - **Management API**: inspect, reset and health-check breakers over HTTP
//!
//! # Example
//!
//! ```no_run
//! use circuit_breakers::config::RegistryConfig;
//! use circuit_breakers::failsafe::CircuitBreakerRegistry;
//!
//! # async fn lookup() -> Result<String, std::io::Error> { Ok("row".into()) }
//! # async fn run() -> circuit_breakers::Result<()> {
//! let registry = CircuitBreakerRegistry::new(RegistryConfig::default())?;
//! let row = registry.call("database", lookup, None).await;
//! # let _ = row;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;

pub use error::{CallError, Error, ErrorKind, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
