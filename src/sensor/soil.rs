//! Soil moisture sensor (capacitive probe behind a CH340 serial bridge).
//!
//! Unlike the humidity probe this one streams: it emits a moisture
//! frame on its own schedule, so a collection just reads frames until
//! one parses. Only the bulk IN endpoint is involved.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bus::{self, DeviceId};
use crate::config::BusConfig;
use crate::health::HealthStore;
use crate::publisher::{Datapoint, Publisher};

use super::{
    CollectError, DEFAULT_READ_ATTEMPTS, Reading, Sensor, SensorCore, SensorKind, SensorState,
    TemperatureScale,
};

/// Identity of the probe's CH340 bridge.
pub const DEFAULT_DEVICE_ID: DeviceId = DeviceId::new(0x1a86, 0x7523);

pub const FIELD_MOISTURE: &str = "soil_moisture";

// ===== Configuration =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoilConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Vendor/product pair to locate on the bus.
    #[serde(default = "default_device")]
    pub device: DeviceId,

    /// Interface number carrying the bulk IN endpoint.
    #[serde(default)]
    pub interface: u8,

    /// Bound on read-and-parse attempts per collection.
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_device() -> DeviceId {
    DEFAULT_DEVICE_ID
}

fn default_read_attempts() -> u32 {
    DEFAULT_READ_ATTEMPTS
}

impl Default for SoilConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            device: default_device(),
            interface: 0,
            read_attempts: default_read_attempts(),
        }
    }
}

impl SoilConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = device;
        self
    }

    pub fn with_interface(mut self, interface: u8) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_read_attempts(mut self, attempts: u32) -> Self {
        self.read_attempts = attempts;
        self
    }
}

// ===== Sensor =====

#[derive(Debug)]
pub struct SoilSensor {
    config: SoilConfig,
    bus: BusConfig,
    core: SensorCore,
}

impl SoilSensor {
    pub fn new(config: SoilConfig, bus: BusConfig, store: HealthStore) -> Self {
        let core = SensorCore::new(SensorKind::Soil, TemperatureScale::default(), store);
        Self { config, bus, core }
    }

    /// Claim the bridge and read frames until one parses.
    ///
    /// The CH340 ships with a serial kernel driver bound; the claim
    /// detaches it for the duration and restores it on drop.
    fn acquire_reading(&self) -> Result<Reading, CollectError> {
        let device = bus::open(self.config.device)?;
        let claim = device.claim(self.config.interface, true, self.bus.base_delay)?;
        let bulk_in = claim.bulk_in()?;

        for attempt in 1..=self.config.read_attempts {
            let frame = claim.read(bulk_in, self.bus.io_timeout)?;
            if let Some(reading) = parse_frame(&frame) {
                return Ok(reading);
            }
            tracing::debug!(
                sensor = %SensorKind::Soil,
                attempt,
                attempts = self.config.read_attempts,
                len = frame.len(),
                "Frame did not parse"
            );
        }

        Err(CollectError::Unparseable {
            attempts: self.config.read_attempts,
        })
    }

    /// The cycle's single datapoint, or its missing marker.
    fn datapoints(&self) -> Vec<Datapoint> {
        match self.core.state().current_reading() {
            Some(reading) => vec![Datapoint::new(
                SensorKind::Soil,
                FIELD_MOISTURE,
                reading.quantity,
                reading.taken_at,
            )],
            None => vec![Datapoint::missing(SensorKind::Soil, FIELD_MOISTURE)],
        }
    }
}

impl Sensor for SoilSensor {
    fn kind(&self) -> SensorKind {
        self.core.kind()
    }

    fn state(&self) -> SensorState {
        self.core.state()
    }

    fn collect(&self) -> bool {
        let reading = match self.acquire_reading() {
            Ok(reading) => {
                tracing::info!(
                    sensor = %self.kind(),
                    moisture = reading.quantity,
                    "Collected reading"
                );
                Some(reading)
            }
            Err(e) => {
                tracing::warn!(sensor = %self.kind(), error = %e, "Collection failed");
                None
            }
        };
        self.core.record_collection(reading)
    }

    fn publish(&self, sink: &dyn Publisher) -> bool {
        let ok = sink.publish_datapoints(&self.datapoints());
        self.core.record_publication(ok)
    }
}

/// Parse one `M: <percent>` frame out of the stream.
fn parse_frame(frame: &[u8]) -> Option<Reading> {
    static FRAME_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = FRAME_REGEX.get_or_init(|| {
        regex::Regex::new(r"M: (?P<moisture>[0-9]+\.[0-9]+)")
            .expect("failed to compile frame regex")
    });

    let text = String::from_utf8_lossy(frame);
    let moisture: f64 = regex.captures(&text)?["moisture"].parse().ok()?;

    Some(Reading {
        quantity: moisture,
        temperature_c: None,
        taken_at: Utc::now(),
    })
}
