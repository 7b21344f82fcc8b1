//! Orchidarium - Greenhouse Sensor Daemon Library
//!
//! This crate provides the core functionality for the orchidarium
//! daemon: it polls physical sensors over USB, publishes their readings
//! to a time-series sink, and exposes container health probes. It can
//! be used as a library by other Rust projects, or run as a standalone
//! binary with the `orchidarium` executable.
//!
//! # Architecture
//!
//! - **Bus**: USB device discovery and scoped interface claims
//! - **Sensors**: pluggable variants that each read one quantity
//! - **Publisher**: per-cycle sink connection (InfluxDB v2)
//! - **Health**: per-sensor outcome records, store, and probe evaluation
//! - **Daemon**: the poll loop and the `/health` and `/ready` endpoints

pub mod bus;
pub mod config;
pub mod daemon;
pub mod health;
pub mod publisher;
pub mod sensor;
pub mod server;

pub use config::AppConfig;
pub use daemon::{CycleOutcome, Daemon, DaemonError};
pub use health::{HealthRecord, HealthStore};
pub use publisher::{Publisher, PublisherFactory};
pub use sensor::{Sensor, SensorKind, SensorRegistry};
