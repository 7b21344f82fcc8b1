//! Air humidity and temperature sensor (SHT20 behind a USB bridge).
//!
//! The probe measures on demand: each collection writes the two no-hold
//! trigger commands, reads back one text frame carrying both values,
//! and parses them out. Temperature is stored in Celsius; the
//! configured scale only affects display.

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

/// No-hold trigger for a temperature measurement.
const TRIG_TEMP_NOHOLD: u8 = 0xF3;
/// No-hold trigger for a humidity measurement.
const TRIG_HUMID_NOHOLD: u8 = 0xF5;

/// Identity the probe's bridge enumerates with out of the box.
pub const DEFAULT_DEVICE_ID: DeviceId = DeviceId::new(0x0487, 0x0007);

pub const FIELD_HUMIDITY: &str = "relative_humidity";
pub const FIELD_TEMPERATURE: &str = "temperature_c";

// ===== Configuration =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumidityConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Vendor/product pair to locate on the bus.
    #[serde(default = "default_device")]
    pub device: DeviceId,

    /// Interface number carrying the bulk endpoints.
    #[serde(default)]
    pub interface: u8,

    /// Display scale for the companion temperature.
    #[serde(default)]
    pub scale: TemperatureScale,

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

impl Default for HumidityConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            device: default_device(),
            interface: 0,
            scale: TemperatureScale::default(),
            read_attempts: default_read_attempts(),
        }
    }
}

impl HumidityConfig {
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

    pub fn with_scale(mut self, scale: TemperatureScale) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_read_attempts(mut self, attempts: u32) -> Self {
        self.read_attempts = attempts;
        self
    }
}

// ===== Sensor =====

#[derive(Debug)]
pub struct HumiditySensor {
    config: HumidityConfig,
    bus: BusConfig,
    core: SensorCore,
}

impl HumiditySensor {
    pub fn new(config: HumidityConfig, bus: BusConfig, store: HealthStore) -> Self {
        let core = SensorCore::new(SensorKind::Humidity, config.scale, store);
        Self { config, bus, core }
    }

    /// Claim the probe, then trigger and read until a frame parses.
    ///
    /// The bridge needs its kernel driver detached while we hold the
    /// interface; the claim restores it on drop.
    fn acquire_reading(&self) -> Result<Reading, CollectError> {
        let device = bus::open(self.config.device)?;
        let claim = device.claim(self.config.interface, true, self.bus.base_delay)?;
        let bulk_in = claim.bulk_in()?;
        let bulk_out = claim.bulk_out()?;

        for attempt in 1..=self.config.read_attempts {
            for trigger in [TRIG_TEMP_NOHOLD, TRIG_HUMID_NOHOLD] {
                claim.write(bulk_out, &[trigger], self.bus.io_timeout)?;
            }
            let frame = claim.read(bulk_in, self.bus.io_timeout)?;
            if let Some(reading) = parse_frame(&frame) {
                return Ok(reading);
            }
            tracing::debug!(
                sensor = %SensorKind::Humidity,
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

    /// Datapoints for the current cycle: the parsed pair, or missing
    /// markers when the last collect produced nothing.
    fn datapoints(&self) -> Vec<Datapoint> {
        match self.core.state().current_reading() {
            Some(reading) => {
                let mut points = vec![Datapoint::new(
                    SensorKind::Humidity,
                    FIELD_HUMIDITY,
                    reading.quantity,
                    reading.taken_at,
                )];
                if let Some(celsius) = reading.temperature_c {
                    points.push(Datapoint::new(
                        SensorKind::Humidity,
                        FIELD_TEMPERATURE,
                        celsius,
                        reading.taken_at,
                    ));
                }
                points
            }
            None => vec![
                Datapoint::missing(SensorKind::Humidity, FIELD_HUMIDITY),
                Datapoint::missing(SensorKind::Humidity, FIELD_TEMPERATURE),
            ],
        }
    }
}

impl Sensor for HumiditySensor {
    fn kind(&self) -> SensorKind {
        self.core.kind()
    }

    fn state(&self) -> SensorState {
        self.core.state()
    }

    fn collect(&self) -> bool {
        let reading = match self.acquire_reading() {
            Ok(reading) => {
                let temperature =
                    reading.temperature_c.map(|c| super::display_temperature(c, self.config.scale));
                tracing::info!(
                    sensor = %self.kind(),
                    humidity = reading.quantity,
                    temperature = ?temperature,
                    scale = %self.config.scale,
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

/// Parse one `T: <celsius>, H: <percent>` frame.
///
/// Frames arrive as a full USB packet; trailing padding and any
/// non-UTF-8 noise around the match are tolerated.
fn parse_frame(frame: &[u8]) -> Option<Reading> {
    static FRAME_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = FRAME_REGEX.get_or_init(|| {
        regex::Regex::new(r"T: (?P<temperature>[0-9]+\.[0-9]+), H: (?P<humidity>[0-9]+\.[0-9]+)")
            .expect("failed to compile frame regex")
    });

    let text = String::from_utf8_lossy(frame);
    let captures = regex.captures(&text)?;
    let temperature: f64 = captures["temperature"].parse().ok()?;
    let humidity: f64 = captures["humidity"].parse().ok()?;

    Some(Reading {
        quantity: humidity,
        temperature_c: Some(temperature),
        taken_at: Utc::now(),
    })
}
