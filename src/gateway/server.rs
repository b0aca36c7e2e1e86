//! Management server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, router_with_state};
use crate::config::Config;
use crate::failsafe::CircuitBreakerRegistry;
use crate::{Error, Result};

/// Management server over a circuit breaker registry
pub struct Server {
    /// Configuration
    config: Config,
    /// Breaker registry
    registry: Arc<CircuitBreakerRegistry>,
}

impl Server {
    /// Create a server and its registry
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the breaker configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(CircuitBreakerRegistry::new(config.breakers.clone())?);
        Ok(Self { config, registry })
    }

    /// Shared registry, for wiring protected calls in the same process
    #[must_use]
    pub fn registry(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = AppState::new(Arc::clone(&self.registry));
        #[cfg(feature = "metrics")]
        let state = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => state.with_prometheus(handle),
            Err(e) => {
                warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
                state
            }
        };

        let app = router_with_state(Arc::new(state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("CIRCUIT BREAKERS v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            breakers = self.registry.len(),
            strict = self.registry.is_strict(),
            "Breakers registered"
        );
        for name in self.registry.names() {
            if let Some(breaker) = self.registry.get(&name) {
                let config = breaker.config();
                info!(
                    "  {name}: threshold={} timeout={:?} fallback={}",
                    config.failure_rate_threshold,
                    config.call_timeout,
                    config.fallback_strategy.as_str()
                );
            }
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Server stopped");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
