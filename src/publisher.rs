//! Publisher Layer
//!
//! Sinks for collected readings.
//!
//! # Architecture
//!
//! - [`Publisher`]: connect/publish contract with scoped semantics
//! - [`Datapoint`]: one field of one sensor's cycle outcome
//! - [`factory`]: builds one fresh publisher per daemon cycle
//!
//! A publisher lives exactly one poll cycle: the orchestrator builds it
//! from the factory, connects it, shares it read-only across that
//! cycle's sensor tasks, and drops it before sleeping.

pub mod influxdb;

use chrono::{DateTime, Utc};

use crate::config::PublisherConfig;
use crate::sensor::SensorKind;

pub use influxdb::{InfluxConfig, InfluxPublisher};

/// Field value marking "no data collected this cycle".
///
/// Out of domain for every quantity we publish (all percentages or
/// Celsius well above freezing), and always paired with
/// `collected=false`.
pub const MISSING_VALUE: f64 = -1.0;

/// One field of one sensor's cycle outcome, bound for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub sensor: SensorKind,
    pub field: &'static str,
    pub value: f64,
    /// Whether the value comes from a real reading this cycle.
    pub collected: bool,
    pub taken_at: DateTime<Utc>,
}

impl Datapoint {
    /// A measured value from the current cycle.
    pub fn new(
        sensor: SensorKind,
        field: &'static str,
        value: f64,
        taken_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor,
            field,
            value,
            collected: true,
            taken_at,
        }
    }

    /// The failure marker for a field whose collection produced nothing.
    pub fn missing(sensor: SensorKind, field: &'static str) -> Self {
        Self {
            sensor,
            field,
            value: MISSING_VALUE,
            collected: false,
            taken_at: Utc::now(),
        }
    }
}

/// Sink contract.
///
/// Implementations own one connection with scoped semantics: opened by
/// [`Publisher::connect`] at the top of a cycle, closed when the
/// publisher drops at the end of it. Methods report through their
/// boolean return; failures are logged where they happen and never
/// propagate.
pub trait Publisher: Send + Sync {
    /// Open the connection, retrying a bounded number of times.
    ///
    /// Idempotent: connecting an already-connected publisher logs a
    /// warning and reports success without touching the connection.
    fn connect(&mut self) -> bool;

    /// Send one datapoint.
    fn publish_datapoint(&self, point: &Datapoint) -> bool;

    /// Send a batch. Every point is attempted even after a failure;
    /// any failed point fails the batch result.
    fn publish_datapoints(&self, points: &[Datapoint]) -> bool {
        let mut ok = true;
        for point in points {
            ok &= self.publish_datapoint(point);
        }
        ok
    }
}

/// Factory producing one fresh publisher per cycle scope.
pub type PublisherFactory = Box<dyn Fn() -> Box<dyn Publisher> + Send + Sync>;

/// Build the factory for the configured backend.
pub fn factory(config: &PublisherConfig) -> PublisherFactory {
    match config {
        PublisherConfig::Influxdb(influx) => {
            let influx = influx.clone();
            Box::new(move || Box::new(InfluxPublisher::new(influx.clone())))
        }
    }
}
