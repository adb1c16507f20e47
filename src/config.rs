//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Environment variable prefix used by [`TurnstileConfig::load`].
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Admission rules
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Per-key state registry
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Admission algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Continuous-refill token bucket
    TokenBucket,
    /// Exact sliding-window hit log
    #[default]
    SlidingWindow,
}

/// Rate limiting configuration, immutable for the lifetime of a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Which algorithm evaluates admissions
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Window length in milliseconds
    pub window_ms: u64,

    /// Requests admitted per window (bucket capacity for the token bucket)
    pub max_requests: u64,

    /// Penalty applied after a denial; 0 disables blocking
    #[serde(default)]
    pub block_duration_ms: u64,

    /// Refund the admission when the guarded work succeeded
    #[serde(default)]
    pub skip_successful: bool,

    /// Refund the admission when the guarded work failed
    #[serde(default)]
    pub skip_failed: bool,

    /// How often expired blocks are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            block_duration_ms: 0,
            skip_successful: false,
            skip_failed: false,
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u64 {
    100
}

fn default_sweep_interval() -> u64 {
    60_000
}

impl RateLimitConfig {
    /// Create a configuration for the given algorithm, window and limit.
    pub fn new(algorithm: Algorithm, window_ms: u64, max_requests: u64) -> Self {
        Self {
            algorithm,
            window_ms,
            max_requests,
            ..Self::default()
        }
    }

    /// Set the block duration applied after a denial.
    pub fn with_block_duration(mut self, block_duration_ms: u64) -> Self {
        self.block_duration_ms = block_duration_ms;
        self
    }

    /// Set the refund-on-outcome flags.
    pub fn with_skip(mut self, skip_successful: bool, skip_failed: bool) -> Self {
        self.skip_successful = skip_successful;
        self.skip_failed = skip_failed;
        self
    }

    /// Check the configuration, failing on values no limiter can work with.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(TurnstileError::Config(
                "window_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(TurnstileError::Config(
                "max_requests must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(TurnstileError::Config(
                "sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// The window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// The sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Which [`LimiterStore`](crate::ratelimit::LimiterStore) backs the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Single-lock map with optional LRU bound
    #[default]
    Memory,
    /// Sharded concurrent map, unbounded
    Sharded,
}

/// Registry configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Maximum number of tracked keys (memory backend only)
    #[serde(default)]
    pub max_keys: Option<usize>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.rate_limit.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply environment overrides.
    ///
    /// Both layer over the built-in defaults, so a lone environment variable
    /// is enough. Variables use the `TURNSTILE__` prefix and `__` as the
    /// section separator, e.g. `TURNSTILE__RATE_LIMIT__MAX_REQUESTS=50`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&TurnstileConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: TurnstileConfig = settings.try_deserialize()?;
        config.rate_limit.validate()?;
        Ok(config)
    }
}
