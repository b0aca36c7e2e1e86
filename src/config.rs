//! Configuration management

use std::{collections::BTreeMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::failsafe::FallbackStrategy;
use crate::{Error, Result};

/// Environment variable prefix (`CIRCUIT_BREAKERS_SERVER__PORT=8080`)
pub const ENV_PREFIX: &str = "CIRCUIT_BREAKERS_";

/// Breakers registered at startup unless configured otherwise
pub const DEFAULT_BREAKERS: [&str; 4] = ["database", "external_api", "cache", "rag_service"];

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Management server configuration
    pub server: ServerConfig,
    /// Breaker registry configuration
    pub breakers: RegistryConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or describes a breaker with out-of-range settings.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.breakers.validate()?;

        Ok(config)
    }
}

/// Management server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
        }
    }
}

/// Registry configuration: process-wide defaults plus per-name overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Reject calls to unregistered names instead of auto-registering them
    pub strict: bool,
    /// Breakers created at startup
    pub preregister: Vec<String>,
    /// Settings every breaker starts from
    pub defaults: BreakerConfig,
    /// Per-name adjustments applied on top of `defaults`
    pub overrides: BTreeMap<String, BreakerOverride>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "database".to_string(),
            BreakerOverride {
                failure_rate_threshold: Some(0.5),
                open_state_duration: Some(Duration::from_secs(60)),
                call_timeout: Some(Duration::from_secs(5)),
                fallback_strategy: Some(FallbackStrategy::Fail),
                ..BreakerOverride::default()
            },
        );
        overrides.insert(
            "external_api".to_string(),
            BreakerOverride {
                failure_rate_threshold: Some(0.6),
                call_timeout: Some(Duration::from_secs(15)),
                fallback_strategy: Some(FallbackStrategy::Cached),
                ..BreakerOverride::default()
            },
        );
        overrides.insert(
            "cache".to_string(),
            BreakerOverride {
                failure_rate_threshold: Some(0.7),
                open_state_duration: Some(Duration::from_secs(15)),
                call_timeout: Some(Duration::from_secs(1)),
                max_retries: Some(1),
                fallback_strategy: Some(FallbackStrategy::Graceful),
                ..BreakerOverride::default()
            },
        );
        overrides.insert(
            "rag_service".to_string(),
            BreakerOverride {
                failure_rate_threshold: Some(0.5),
                open_state_duration: Some(Duration::from_secs(45)),
                call_timeout: Some(Duration::from_secs(30)),
                fallback_strategy: Some(FallbackStrategy::Graceful),
                ..BreakerOverride::default()
            },
        );

        Self {
            strict: false,
            preregister: DEFAULT_BREAKERS.iter().map(ToString::to_string).collect(),
            defaults: BreakerConfig::default(),
            overrides,
        }
    }
}

impl RegistryConfig {
    /// Effective configuration for `name`
    #[must_use]
    pub fn config_for(&self, name: &str) -> BreakerConfig {
        let base = self.defaults.clone().named(name);
        match self.overrides.get(name) {
            Some(o) => o.apply(base),
            None => base,
        }
    }

    /// Validate defaults, every override and every pre-registered name
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate()?;
        for name in self.overrides.keys() {
            self.config_for(name).validate()?;
        }
        for name in &self.preregister {
            if name.trim().is_empty() {
                return Err(Error::Config("breaker name must not be empty".to_string()));
            }
            self.config_for(name).validate()?;
        }
        Ok(())
    }
}

/// Per-breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Breaker name (filled in by the registry)
    pub name: String,
    /// Failure rate (0.0–1.0) at which a closed breaker opens
    pub failure_rate_threshold: f64,
    /// Age limit of samples in the rolling window
    #[serde(with = "humantime_serde")]
    pub rolling_window: Duration,
    /// Samples required before the failure rate is evaluated
    pub minimum_throughput: usize,
    /// How long an open breaker rejects calls before probing
    #[serde(with = "humantime_serde")]
    pub open_state_duration: Duration,
    /// Concurrent probes allowed while half-open
    pub half_open_max_in_flight: usize,
    /// Percentage of successful probes (0–100) required to close
    pub success_quorum_percent: f64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Deadline for a single attempt
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// First backoff delay
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    /// Backoff multiplier per attempt
    pub backoff_factor: f64,
    /// Ceiling for a single backoff delay
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Random perturbation of each delay (0.0–1.0)
    pub jitter_ratio: f64,
    /// What to do when a call is rejected or exhausted
    pub fallback_strategy: FallbackStrategy,
    /// Placeholder returned by the graceful strategy
    pub degraded_response: Value,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            failure_rate_threshold: 0.5,
            rolling_window: Duration::from_secs(60),
            minimum_throughput: 10,
            open_state_duration: Duration::from_secs(30),
            half_open_max_in_flight: 3,
            success_quorum_percent: 80.0,
            max_retries: 2,
            call_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(100),
            backoff_factor: 2.0,
            backoff_max: Duration::from_secs(30),
            jitter_ratio: 0.1,
            fallback_strategy: FallbackStrategy::Fail,
            degraded_response: json!({
                "status": "degraded",
                "message": "Service temporarily unavailable"
            }),
        }
    }
}

impl BreakerConfig {
    /// Same settings under another name
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Reject out-of-range settings
    pub fn validate(&self) -> Result<()> {
        let name = if self.name.is_empty() { "<defaults>" } else { &self.name };
        let invalid = |field: &str, requirement: &str| {
            Err(Error::Config(format!(
                "breaker '{name}': {field} must be {requirement}"
            )))
        };

        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return invalid("failure_rate_threshold", "between 0 and 1");
        }
        if self.rolling_window.is_zero() {
            return invalid("rolling_window", "greater than zero");
        }
        if self.open_state_duration.is_zero() {
            return invalid("open_state_duration", "greater than zero");
        }
        if self.half_open_max_in_flight == 0 {
            return invalid("half_open_max_in_flight", "at least 1");
        }
        if !(0.0..=100.0).contains(&self.success_quorum_percent) {
            return invalid("success_quorum_percent", "between 0 and 100");
        }
        if self.call_timeout.is_zero() {
            return invalid("call_timeout", "greater than zero");
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return invalid("backoff_factor", "a finite number >= 1");
        }
        if self.backoff_max < self.backoff_base {
            return invalid("backoff_max", "at least backoff_base");
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return invalid("jitter_ratio", "between 0 and 1");
        }
        Ok(())
    }
}

/// Optional per-name adjustments; unset fields keep the default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerOverride {
    /// See [`BreakerConfig::failure_rate_threshold`]
    pub failure_rate_threshold: Option<f64>,
    /// See [`BreakerConfig::rolling_window`]
    #[serde(with = "humantime_serde::option")]
    pub rolling_window: Option<Duration>,
    /// See [`BreakerConfig::minimum_throughput`]
    pub minimum_throughput: Option<usize>,
    /// See [`BreakerConfig::open_state_duration`]
    #[serde(with = "humantime_serde::option")]
    pub open_state_duration: Option<Duration>,
    /// See [`BreakerConfig::half_open_max_in_flight`]
    pub half_open_max_in_flight: Option<usize>,
    /// See [`BreakerConfig::success_quorum_percent`]
    pub success_quorum_percent: Option<f64>,
    /// See [`BreakerConfig::max_retries`]
    pub max_retries: Option<u32>,
    /// See [`BreakerConfig::call_timeout`]
    #[serde(with = "humantime_serde::option")]
    pub call_timeout: Option<Duration>,
    /// See [`BreakerConfig::backoff_base`]
    #[serde(with = "humantime_serde::option")]
    pub backoff_base: Option<Duration>,
    /// See [`BreakerConfig::backoff_factor`]
    pub backoff_factor: Option<f64>,
    /// See [`BreakerConfig::backoff_max`]
    #[serde(with = "humantime_serde::option")]
    pub backoff_max: Option<Duration>,
    /// See [`BreakerConfig::jitter_ratio`]
    pub jitter_ratio: Option<f64>,
    /// See [`BreakerConfig::fallback_strategy`]
    pub fallback_strategy: Option<FallbackStrategy>,
    /// See [`BreakerConfig::degraded_response`]
    pub degraded_response: Option<Value>,
}

impl BreakerOverride {
    /// Apply the set fields on top of `base`
    #[must_use]
    pub fn apply(&self, mut base: BreakerConfig) -> BreakerConfig {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = &self.$field { base.$field = v.clone(); })*
            };
        }
        take!(
            failure_rate_threshold,
            rolling_window,
            minimum_throughput,
            open_state_duration,
            half_open_max_in_flight,
            success_quorum_percent,
            max_retries,
            call_timeout,
            backoff_base,
            backoff_factor,
            backoff_max,
            jitter_ratio,
            fallback_strategy,
            degraded_response,
        );
        base
    }
}

/// Human-readable serde for `Duration` ("250ms", "1.5s", "2m", "1h" or bare seconds)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(f64),
    }

    /// Serialize as whole seconds ("30s"), milliseconds ("250ms") or, below
    /// millisecond precision, fractional seconds ("0.0015s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*duration))
    }

    /// Deserialize a duration string or number of seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
            Raw::Seconds(secs) => from_secs(secs).map_err(serde::de::Error::custom),
        }
    }

    /// Render a duration the way [`serialize`] does
    #[must_use]
    pub fn format(duration: Duration) -> String {
        if duration.subsec_nanos() % 1_000_000 != 0 {
            format!("{}s", duration.as_secs_f64())
        } else if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    /// Parse "250ms", "1.5s", "2m", "1h" or "30"
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (number, unit_millis) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, 1)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1_000)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60_000)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3_600_000)
        } else {
            (s, 1_000)
        };

        let number = number.trim();
        if let Ok(whole) = number.parse::<u64>() {
            return Ok(Duration::from_millis(whole.saturating_mul(unit_millis)));
        }

        let value: f64 = number
            .parse()
            .map_err(|e| format!("invalid duration '{s}': {e}"))?;
        #[allow(clippy::cast_precision_loss)]
        let secs = value * unit_millis as f64 / 1000.0;
        from_secs(secs)
    }

    fn from_secs(secs: f64) -> Result<Duration, String> {
        Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {secs}: {e}"))
    }

    /// Same encoding for `Option<Duration>`
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize `Some` like the parent module, `None` as unit
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format(*d)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if a present value cannot be parsed.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<super::Raw>::deserialize(deserializer)? {
                None => Ok(None),
                Some(super::Raw::Text(s)) => super::parse(&s).map(Some).map_err(serde::de::Error::custom),
                Some(super::Raw::Seconds(secs)) => {
                    super::from_secs(secs).map(Some).map_err(serde::de::Error::custom)
                }
            }
        }
    }
}
