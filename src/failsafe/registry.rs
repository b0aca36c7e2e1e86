//! Named circuit breakers shared across a process

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use super::circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
use super::fallback::Fallback;
use super::retry::RetryExecutor;
use crate::config::{BreakerConfig, RegistryConfig};
use crate::error::CallError;
use crate::{Error, Result};

/// Overall health of the registered breakers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No breaker is open
    Healthy,
    /// At least one breaker is open
    Degraded,
}

/// Breakers partitioned by state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Degraded iff `open_breakers` is non-empty
    pub health: HealthStatus,
    /// Names of open breakers
    pub open_breakers: Vec<String>,
    /// Names of half-open breakers
    pub half_open_breakers: Vec<String>,
    /// Names of closed breakers
    pub closed_breakers: Vec<String>,
    /// Number of registered breakers
    pub total_breakers: usize,
}

/// Registry of named circuit breakers
///
/// Built once at startup and shared as `Arc<CircuitBreakerRegistry>`. Map
/// access is brief: callers get an `Arc<CircuitBreaker>` and the shard lock
/// is released before any breaker is touched.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: RegistryConfig,
    executor: RetryExecutor,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.names())
            .field("strict", &self.config.strict)
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry and register every name in `config.preregister`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the defaults, an override or a
    /// pre-registered breaker's effective config is invalid.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        config.validate()?;

        let registry = Self {
            breakers: DashMap::new(),
            config,
            executor: RetryExecutor::new(),
        };

        for name in &registry.config.preregister {
            registry.register(name, registry.config.config_for(name))?;
        }

        info!(
            breakers = registry.len(),
            strict = registry.config.strict,
            "Circuit breaker registry initialized"
        );
        Ok(registry)
    }

    /// Registry configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Whether unknown names are rejected instead of auto-registered
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.config.strict
    }

    /// Register `name` with `config`
    ///
    /// Registering the same name twice with an identical config returns the
    /// existing breaker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigConflict`] if `name` is registered with a
    /// different config, or [`Error::Config`] if `config` is invalid.
    pub fn register(&self, name: &str, config: BreakerConfig) -> Result<Arc<CircuitBreaker>> {
        let config = config.named(name);

        if let Some(existing) = self.get(name) {
            return Self::reuse(existing, &config);
        }

        let created = Arc::new(CircuitBreaker::new(config.clone())?);
        let existing = match self.breakers.entry(name.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&created));
                debug!(breaker = %name, "Circuit breaker registered");
                return Ok(created);
            }
        };
        Self::reuse(existing, &config)
    }

    /// Register `name`, replacing the config of an existing breaker
    ///
    /// An existing breaker keeps its lifetime totals and is soft-reset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid.
    pub fn register_forced(&self, name: &str, config: BreakerConfig) -> Result<Arc<CircuitBreaker>> {
        let config = config.named(name);
        match self.get(name) {
            Some(existing) => {
                if *existing.config() != config {
                    existing.reconfigure(config)?;
                }
                Ok(existing)
            }
            None => self.register(name, config),
        }
    }

    /// Breaker registered under `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered breakers
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Run `operation` through the breaker named `name`
    ///
    /// Unknown names are registered with their effective config, unless the
    /// registry is strict.
    ///
    /// # Errors
    ///
    /// [`CallError::UnknownBreaker`] in strict mode, otherwise whatever
    /// [`RetryExecutor::execute`] returns.
    pub async fn call<T, E, F, Fut>(
        &self,
        name: &str,
        operation: F,
        fallback: Option<&dyn Fallback<T, E>>,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        T: Serialize + DeserializeOwned,
    {
        let breaker = self.breaker_for_call(name)?;
        self.executor.execute(&breaker, operation, fallback).await
    }

    /// Snapshot of one breaker
    #[must_use]
    pub fn metrics(&self, name: &str) -> Option<BreakerSnapshot> {
        self.get(name).map(|b| b.snapshot(Instant::now()))
    }

    /// Snapshots of every breaker, keyed by name
    #[must_use]
    pub fn metrics_all(&self) -> BTreeMap<String, BreakerSnapshot> {
        let now = Instant::now();
        self.all()
            .into_iter()
            .map(|b| (b.name().to_string(), b.snapshot(now)))
            .collect()
    }

    /// Force `name` closed; `hard` also zeroes its lifetime totals
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownBreaker`] if nothing is registered under `name`.
    pub fn reset(&self, name: &str, hard: bool) -> Result<()> {
        let breaker = self
            .get(name)
            .ok_or_else(|| Error::UnknownBreaker(name.to_string()))?;
        breaker.reset(hard);
        Ok(())
    }

    /// Reset every breaker, returning how many were reset
    pub fn reset_all(&self, hard: bool) -> usize {
        let breakers = self.all();
        for breaker in &breakers {
            breaker.reset(hard);
        }
        info!(count = breakers.len(), hard, "All circuit breakers reset");
        breakers.len()
    }

    /// Partition breakers by state
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let mut open = Vec::new();
        let mut half_open = Vec::new();
        let mut closed = Vec::new();

        for breaker in self.all() {
            let name = breaker.name().to_string();
            match breaker.state() {
                BreakerState::Open => open.push(name),
                BreakerState::HalfOpen => half_open.push(name),
                BreakerState::Closed => closed.push(name),
            }
        }
        open.sort();
        half_open.sort();
        closed.sort();

        HealthReport {
            health: if open.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            total_breakers: open.len() + half_open.len() + closed.len(),
            open_breakers: open,
            half_open_breakers: half_open,
            closed_breakers: closed,
        }
    }

    /// Clone every breaker reference out of the map
    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn reuse(existing: Arc<CircuitBreaker>, config: &BreakerConfig) -> Result<Arc<CircuitBreaker>> {
        if *existing.config() == *config {
            Ok(existing)
        } else {
            Err(Error::ConfigConflict(config.name.clone()))
        }
    }

    fn breaker_for_call<E>(&self, name: &str) -> std::result::Result<Arc<CircuitBreaker>, CallError<E>> {
        if let Some(breaker) = self.get(name) {
            return Ok(breaker);
        }
        if self.config.strict {
            debug!(breaker = %name, "Unknown breaker in strict mode");
            return Err(CallError::UnknownBreaker(name.to_string()));
        }

        let created = CircuitBreaker::new(self.config.config_for(name)).map_err(|e| CallError::Degraded {
            breaker: name.to_string(),
            reason: e.to_string(),
        })?;
        let breaker = Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(created))
                .value(),
        );
        info!(breaker = %name, "Circuit breaker auto-registered");
        Ok(breaker)
    }
}
