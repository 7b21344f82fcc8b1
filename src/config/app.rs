//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::publisher::InfluxConfig;
use crate::sensor::{HumidityConfig, SoilConfig};

use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

/// Default poll interval (60 seconds).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum poll interval (1 second).
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default grace period for the HTTP server at shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default health record cache TTL (5 seconds).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Default health record directory.
pub const DEFAULT_RECORDS_DIR: &str = "/var/lib/orchidarium/healthcheck";

/// Default delay between retries of a busy or timed-out bus transfer.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default timeout for one bulk transfer.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_records_dir() -> String {
    DEFAULT_RECORDS_DIR.to_string()
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_io_timeout() -> Duration {
    DEFAULT_IO_TIMEOUT
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Health endpoint server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8000).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

// =============================================================================
// Daemon Configuration
// =============================================================================

/// Poll loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Pause between poll cycles (default: "60s").
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long to wait for the HTTP server to drain at shutdown
    /// (default: "5s").
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

// =============================================================================
// Health Record Configuration
// =============================================================================

/// Health record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Directory holding one record file per sensor. Supports ${VAR}
    /// expansion.
    pub records_dir: String,

    /// How long a cached record stays fresh (default: "5s"). Zero
    /// disables caching.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            records_dir: default_records_dir(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

// =============================================================================
// Bus Configuration
// =============================================================================

/// Transfer timing shared by every sensor on the bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Delay between retries of a busy or timed-out transfer
    /// (default: "1s").
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Timeout for one bulk transfer (default: "1s").
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            io_timeout: default_io_timeout(),
        }
    }
}

// =============================================================================
// Sensor Configuration
// =============================================================================

/// Per-variant sensor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    /// Air humidity and temperature probe.
    pub humidity: HumidityConfig,

    /// Soil moisture probe.
    pub soil: SoilConfig,
}

impl SensorsConfig {
    /// Whether any variant is enabled.
    pub fn any_enabled(&self) -> bool {
        self.humidity.enabled || self.soil.enabled
    }
}

// =============================================================================
// Publisher Configuration
// =============================================================================

/// Time-series sink configuration, keyed by backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum PublisherConfig {
    Influxdb(InfluxConfig),
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::Influxdb(InfluxConfig::default())
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Health endpoint server configuration.
    pub server: ServerConfig,

    /// Poll loop configuration.
    pub daemon: DaemonConfig,

    /// Health record store configuration.
    pub health: HealthConfig,

    /// Bus transfer timing.
    pub bus: BusConfig,

    /// Sensor variants.
    pub sensors: SensorsConfig,

    /// Time-series sink.
    pub publisher: PublisherConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.expand_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults for a missing file.
    ///
    /// A missing file is an expected deployment state (fresh install);
    /// a present but unreadable or invalid file is still an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Expand ${VAR} references in deployment-specific fields.
    fn expand_env(&mut self) {
        self.health.records_dir = expand_env_vars(&self.health.records_dir);
        match &mut self.publisher {
            PublisherConfig::Influxdb(influx) => {
                influx.url = expand_env_vars(&influx.url);
                influx.org = expand_env_vars(&influx.org);
                influx.bucket = expand_env_vars(&influx.bucket);
                influx.token = expand_env_vars(&influx.token);
            }
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate server bind address
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::ValidationError(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;

        // Validate server port
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server port must be non-zero".to_string(),
            ));
        }

        // Validate poll interval
        if self.daemon.poll_interval < MIN_POLL_INTERVAL {
            return Err(ConfigError::ValidationError(format!(
                "daemon poll_interval must be at least {:?}",
                MIN_POLL_INTERVAL
            )));
        }

        // Validate record directory
        if self.health.records_dir.is_empty() {
            return Err(ConfigError::ValidationError(
                "health records_dir cannot be empty".to_string(),
            ));
        }

        // Validate sensors
        if !self.sensors.any_enabled() {
            return Err(ConfigError::ValidationError(
                "at least one sensor must be enabled".to_string(),
            ));
        }
        if self.sensors.humidity.enabled && self.sensors.humidity.read_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "humidity read_attempts must be positive".to_string(),
            ));
        }
        if self.sensors.soil.enabled && self.sensors.soil.read_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "soil read_attempts must be positive".to_string(),
            ));
        }

        // Validate publisher
        match &self.publisher {
            PublisherConfig::Influxdb(influx) => {
                if influx.url.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "influxdb url cannot be empty".to_string(),
                    ));
                }
                if influx.org.is_empty() || influx.bucket.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "influxdb org and bucket cannot be empty".to_string(),
                    ));
                }
                if influx.connect_attempts == 0 {
                    return Err(ConfigError::ValidationError(
                        "influxdb connect_attempts must be positive".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
