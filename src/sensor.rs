//! Sensor Layer
//!
//! Pluggable sensors that each read one physical quantity over the bus
//! and hand the outcome to the publisher.
//!
//! # Architecture
//!
//! - [`Sensor`]: core trait (collect / publish / run)
//! - [`SensorCore`]: shared lifecycle state with health write-through
//! - [`SensorRegistry`]: the fixed, startup-time list of variants
//!
//! Variants live in submodules ([`humidity`], [`soil`]) and differ only
//! in device identity, frame format, and the datapoints they emit.

pub mod humidity;
pub mod soil;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;

use crate::bus::BusError;
use crate::config::{BusConfig, SensorsConfig};
use crate::health::{HealthRecord, HealthStore};
use crate::publisher::Publisher;

pub use humidity::{HumidityConfig, HumiditySensor};
pub use soil::{SoilConfig, SoilSensor};

// =============================================================================
// Constants
// =============================================================================

/// Default bound on read-and-parse attempts per collection cycle.
pub const DEFAULT_READ_ATTEMPTS: u32 = 10;

// =============================================================================
// Identity and readings
// =============================================================================

/// Identity of one sensor variant.
///
/// Doubles as the health-record key (file stem) and the published
/// measurement name, so the lowercase form is a wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SensorKind {
    Humidity,
    Soil,
}

/// Display unit for temperatures. Storage is always Celsius.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TemperatureScale {
    #[default]
    Celsius,
    Fahrenheit,
}

/// Convert a canonical Celsius value to `scale` for display.
///
/// Called at read sites only; stored and published values stay Celsius
/// so repeated reads can never double-convert.
pub fn display_temperature(celsius: f64, scale: TemperatureScale) -> f64 {
    match scale {
        TemperatureScale::Celsius => celsius,
        TemperatureScale::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
    }
}

/// One parsed measurement in canonical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Primary quantity for the variant (relative humidity %, soil
    /// moisture %).
    pub quantity: f64,
    /// Companion air temperature in Celsius, when the frame carries one.
    pub temperature_c: Option<f64>,
    /// When the frame was parsed.
    pub taken_at: DateTime<Utc>,
}

/// Why one collection cycle produced no reading.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Every bounded read attempt returned an unparseable frame.
    #[error("no parseable frame in {attempts} read attempts")]
    Unparseable { attempts: u32 },
}

// =============================================================================
// Lifecycle state
// =============================================================================

/// Mutable per-sensor lifecycle state.
///
/// Created once per registered variant and kept for the process
/// lifetime; mutated only by its own sensor's collect/publish.
#[derive(Debug, Clone, Copy)]
pub struct SensorState {
    scale: TemperatureScale,
    last_reading: Option<Reading>,
    read_ok: bool,
    published: bool,
}

impl SensorState {
    fn new(scale: TemperatureScale) -> Self {
        Self {
            scale,
            last_reading: None,
            read_ok: false,
            published: false,
        }
    }

    pub fn read_ok(&self) -> bool {
        self.read_ok
    }

    pub fn published(&self) -> bool {
        self.published
    }

    pub fn scale(&self) -> TemperatureScale {
        self.scale
    }

    /// Last reading ever parsed, possibly from an earlier cycle.
    pub fn last_reading(&self) -> Option<Reading> {
        self.last_reading
    }

    /// The last reading, only while the most recent collect succeeded.
    pub fn current_reading(&self) -> Option<Reading> {
        if self.read_ok { self.last_reading } else { None }
    }

    /// Companion temperature converted to the display scale.
    pub fn display_temperature(&self) -> Option<f64> {
        self.last_reading
            .and_then(|reading| reading.temperature_c)
            .map(|celsius| display_temperature(celsius, self.scale))
    }
}

/// Shared base every sensor variant embeds: identity, lifecycle state,
/// and the health-record write-through.
///
/// Every mutation of the outcome flags persists a health record; a
/// failed persist is logged but never fails the cycle; the sensor's
/// own result stands regardless of record-keeping.
pub struct SensorCore {
    kind: SensorKind,
    state: Mutex<SensorState>,
    store: HealthStore,
}

impl SensorCore {
    pub fn new(kind: SensorKind, scale: TemperatureScale, store: HealthStore) -> Self {
        Self {
            kind,
            state: Mutex::new(SensorState::new(scale)),
            store,
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Copy of the current lifecycle state.
    pub fn state(&self) -> SensorState {
        *self.state.lock()
    }

    /// Record a collect outcome and write the health record through.
    ///
    /// A failed collect keeps the previous reading around (for display)
    /// but drops the `read_ok` flag, which also gates what publish emits.
    pub fn record_collection(&self, reading: Option<Reading>) -> bool {
        let record = {
            let mut state = self.state.lock();
            state.read_ok = reading.is_some();
            if let Some(reading) = reading {
                state.last_reading = Some(reading);
            }
            HealthRecord::new(state.published, state.read_ok)
        };
        self.persist(record);
        record.healthcheck.readout
    }

    /// Record a publish outcome and write the health record through.
    pub fn record_publication(&self, published: bool) -> bool {
        let record = {
            let mut state = self.state.lock();
            state.published = published;
            HealthRecord::new(state.published, state.read_ok)
        };
        self.persist(record);
        published
    }

    fn persist(&self, record: HealthRecord) {
        if let Err(err) = self.store.write(self.kind, record) {
            tracing::error!(sensor = %self.kind, error = %err, "Failed to persist health record");
        }
    }
}

impl fmt::Debug for SensorCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorCore")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Core trait
// =============================================================================

/// Core trait for sensor variants.
///
/// # Error Handling Philosophy
///
/// `collect` and `publish` never propagate errors past their own
/// boundary. Device-not-found, claim, transfer, and parse failures all
/// become a `false` return plus a logged cause and a persisted health
/// record; the orchestrator only ever sees the boolean cycle outcome.
/// Panics are the one exception: they are programming errors and are
/// allowed to reach the daemon's failure boundary.
pub trait Sensor: Send + Sync {
    /// Registered identity of this variant.
    fn kind(&self) -> SensorKind;

    /// Copy of the current lifecycle state.
    fn state(&self) -> SensorState;

    /// Locate the device, claim its interface, read and parse one frame.
    fn collect(&self) -> bool;

    /// Hand the last cycle's outcome to the sink.
    fn publish(&self, sink: &dyn Publisher) -> bool;

    /// One full cycle: collect, then publish unconditionally.
    ///
    /// Publish runs even when collect failed: an empty cycle is a
    /// result the sink and the health path both want to see, not a
    /// reason to skip the call.
    fn run(&self, sink: &dyn Publisher) -> bool {
        let collected = self.collect();
        let published = self.publish(sink);
        collected && published
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Fixed list of sensor variants, assembled once at startup.
///
/// The single site that knows every variant; its length drives the
/// record count the readiness evaluator expects.
pub struct SensorRegistry {
    sensors: Vec<Arc<dyn Sensor>>,
}

impl SensorRegistry {
    pub fn new(sensors: Vec<Arc<dyn Sensor>>) -> Self {
        Self { sensors }
    }

    /// Build the registry from configuration, skipping disabled variants.
    pub fn from_config(config: &SensorsConfig, bus: BusConfig, store: &HealthStore) -> Self {
        let mut sensors: Vec<Arc<dyn Sensor>> = Vec::new();
        if config.humidity.enabled {
            sensors.push(Arc::new(HumiditySensor::new(
                config.humidity.clone(),
                bus,
                store.clone(),
            )));
        } else {
            tracing::info!(sensor = %SensorKind::Humidity, "Sensor disabled");
        }
        if config.soil.enabled {
            sensors.push(Arc::new(SoilSensor::new(
                config.soil.clone(),
                bus,
                store.clone(),
            )));
        } else {
            tracing::info!(sensor = %SensorKind::Soil, "Sensor disabled");
        }
        Self::new(sensors)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Identities of every registered sensor.
    pub fn kinds(&self) -> Vec<SensorKind> {
        self.sensors.iter().map(|sensor| sensor.kind()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Sensor>> {
        self.sensors.iter()
    }
}

impl fmt::Debug for SensorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorRegistry")
            .field("kinds", &self.kinds())
            .finish_non_exhaustive()
    }
}
