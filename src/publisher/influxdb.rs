//! InfluxDB v2 publisher.
//!
//! Writes datapoints with the line protocol over the v2 HTTP API. The
//! connection probe hits `/ping`; writes go to `/api/v2/write` with
//! nanosecond precision.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Datapoint, Publisher};

const DEFAULT_URL: &str = "http://localhost:8086";
const DEFAULT_ORG: &str = "home";
const DEFAULT_BUCKET: &str = "orchidarium";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_CONNECT_DELAY: Duration = Duration::from_secs(2);

// ===== Configuration =====

/// Connection settings for an InfluxDB v2 instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Base URL of the instance, without a trailing path.
    #[serde(default = "default_url")]
    pub url: String,

    /// Organization the bucket belongs to.
    #[serde(default = "default_org")]
    pub org: String,

    /// Destination bucket.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// API token; sent as `Authorization: Token ...` when non-empty.
    #[serde(default)]
    pub token: String,

    /// Timeout applied to every HTTP request.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How many times to probe the instance before giving up.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Pause between connection probes.
    #[serde(default = "default_connect_delay", with = "humantime_serde")]
    pub connect_delay: Duration,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_org() -> String {
    DEFAULT_ORG.to_string()
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_connect_attempts() -> u32 {
    DEFAULT_CONNECT_ATTEMPTS
}

fn default_connect_delay() -> Duration {
    DEFAULT_CONNECT_DELAY
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            org: default_org(),
            bucket: default_bucket(),
            token: String::new(),
            request_timeout: default_request_timeout(),
            connect_attempts: default_connect_attempts(),
            connect_delay: default_connect_delay(),
        }
    }
}

impl InfluxConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_org(mut self, org: impl Into<String>) -> Self {
        self.org = org.into();
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }
}

// ===== Publisher =====

/// Publisher writing to one InfluxDB v2 instance.
///
/// Holds no connection until [`Publisher::connect`] succeeds; dropping
/// the publisher ends its write scope.
pub struct InfluxPublisher {
    config: InfluxConfig,
    client: Option<reqwest::blocking::Client>,
}

impl InfluxPublisher {
    pub fn new(config: InfluxConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Build a client and probe the instance once.
    fn try_connect(&self) -> Result<reqwest::blocking::Client, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.config.request_timeout)
            .build()?;
        client
            .get(format!("{}/ping", self.base_url()))
            .send()?
            .error_for_status()?;
        Ok(client)
    }

    fn base_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    fn write_url(&self) -> String {
        format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            self.base_url(),
            self.config.org,
            self.config.bucket
        )
    }
}

impl Publisher for InfluxPublisher {
    fn connect(&mut self) -> bool {
        if self.client.is_some() {
            tracing::warn!(url = %self.config.url, "Publisher already connected");
            return true;
        }

        for attempt in 1..=self.config.connect_attempts {
            match self.try_connect() {
                Ok(client) => {
                    tracing::info!(
                        url = %self.config.url,
                        bucket = %self.config.bucket,
                        "Connected to InfluxDB"
                    );
                    self.client = Some(client);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        url = %self.config.url,
                        attempt,
                        attempts = self.config.connect_attempts,
                        error = %e,
                        "InfluxDB connection probe failed"
                    );
                    if attempt < self.config.connect_attempts {
                        thread::sleep(self.config.connect_delay);
                    }
                }
            }
        }

        tracing::error!(
            url = %self.config.url,
            attempts = self.config.connect_attempts,
            "Giving up connecting to InfluxDB"
        );
        false
    }

    fn publish_datapoint(&self, point: &Datapoint) -> bool {
        let Some(client) = &self.client else {
            tracing::error!(
                sensor = %point.sensor,
                field = point.field,
                "Publish attempted without a connection"
            );
            return false;
        };

        let mut request = client.post(self.write_url()).body(encode_line(point));
        if !self.config.token.is_empty() {
            request = request.header("Authorization", format!("Token {}", self.config.token));
        }

        match request.send().and_then(|response| response.error_for_status()) {
            Ok(_) => {
                tracing::debug!(
                    sensor = %point.sensor,
                    field = point.field,
                    value = point.value,
                    "Published datapoint"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    sensor = %point.sensor,
                    field = point.field,
                    error = %e,
                    "Failed to publish datapoint"
                );
                false
            }
        }
    }
}

impl Drop for InfluxPublisher {
    fn drop(&mut self) {
        if self.client.take().is_some() {
            tracing::debug!(url = %self.config.url, "Closing InfluxDB publisher scope");
        }
    }
}

impl std::fmt::Debug for InfluxPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxPublisher")
            .field("url", &self.config.url)
            .field("bucket", &self.config.bucket)
            .field("connected", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

/// Encode one datapoint as an InfluxDB line protocol record.
///
/// The sensor kind is the measurement, the value and collection flag
/// are fields, and the timestamp is in nanoseconds.
fn encode_line(point: &Datapoint) -> String {
    format!(
        "{} {}={},collected={} {}",
        point.sensor,
        point.field,
        point.value,
        point.collected,
        point.taken_at.timestamp_nanos_opt().unwrap_or_default()
    )
}
