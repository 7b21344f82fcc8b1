//! Configuration module for the orchidarium daemon.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Health endpoint server settings (bind address, port)
//! - Poll loop timing (interval, shutdown grace)
//! - Health record store (directory, cache TTL)
//! - Bus transfer timing, sensor variants, and the time-series sink

mod app;
mod validation;

pub use app::{
    AppConfig, BusConfig, DaemonConfig, HealthConfig, PublisherConfig, SensorsConfig, ServerConfig,
};
pub use validation::{ConfigError, expand_env_vars};

// Re-export constants
pub use app::{
    DEFAULT_BASE_DELAY, DEFAULT_CACHE_TTL, DEFAULT_IO_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DEFAULT_RECORDS_DIR, DEFAULT_SHUTDOWN_TIMEOUT, MIN_POLL_INTERVAL,
};
