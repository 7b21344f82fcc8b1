//! Integration tests for the orchidarium daemon.
//!
//! Drive real poll cycles against a real record store and assert the
//! probe endpoints over HTTP.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;

use orchidarium::config::AppConfig;
use orchidarium::daemon::{CycleOutcome, Daemon};
use orchidarium::health::HealthStore;
use orchidarium::publisher::{Datapoint, MISSING_VALUE, Publisher, PublisherFactory};
use orchidarium::sensor::{
    Reading, Sensor, SensorCore, SensorKind, SensorRegistry, SensorState, TemperatureScale,
};
use orchidarium::server::{AppState, create_router};

// =============================================================================
// Test Helpers
// =============================================================================

/// Sensor whose collect outcome is flipped from the test.
struct ScriptedSensor {
    core: SensorCore,
    collect_ok: AtomicBool,
}

impl ScriptedSensor {
    fn new(kind: SensorKind, store: HealthStore) -> Arc<Self> {
        Arc::new(Self {
            core: SensorCore::new(kind, TemperatureScale::Celsius, store),
            collect_ok: AtomicBool::new(true),
        })
    }

    fn set_collect_ok(&self, ok: bool) {
        self.collect_ok.store(ok, Ordering::SeqCst);
    }
}

impl Sensor for ScriptedSensor {
    fn kind(&self) -> SensorKind {
        self.core.kind()
    }

    fn state(&self) -> SensorState {
        self.core.state()
    }

    fn collect(&self) -> bool {
        let reading = self.collect_ok.load(Ordering::SeqCst).then(|| Reading {
            quantity: 42.0,
            temperature_c: None,
            taken_at: Utc::now(),
        });
        self.core.record_collection(reading)
    }

    fn publish(&self, sink: &dyn Publisher) -> bool {
        let point = match self.core.state().current_reading() {
            Some(reading) => {
                Datapoint::new(self.kind(), "quantity", reading.quantity, reading.taken_at)
            }
            None => Datapoint::missing(self.kind(), "quantity"),
        };
        let ok = sink.publish_datapoints(&[point]);
        self.core.record_publication(ok)
    }
}

/// Publisher capturing every datapoint across factory instantiations.
#[derive(Clone, Default)]
struct SharedSink {
    points: Arc<Mutex<Vec<Datapoint>>>,
    connects: Arc<AtomicUsize>,
}

impl SharedSink {
    fn factory(&self) -> PublisherFactory {
        let sink = self.clone();
        Box::new(move || Box::new(sink.clone()))
    }
}

impl Publisher for SharedSink {
    fn connect(&mut self) -> bool {
        self.connects.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn publish_datapoint(&self, point: &Datapoint) -> bool {
        self.points.lock().push(point.clone());
        true
    }
}

/// Open a record store under a fresh tempdir, with caching off so every
/// probe sees the latest records.
fn open_test_store() -> (tempfile::TempDir, HealthStore) {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let store = HealthStore::open(dir.path(), Duration::ZERO).expect("Failed to open store");
    (dir, store)
}

/// Serve the probe router for `store` and return the base URL.
async fn start_probe_server(store: HealthStore, kinds: Vec<SensorKind>) -> String {
    let router = create_router(AppState::new(store, kinds));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://{}", addr)
}

async fn probe(client: &reqwest::Client, url: String) -> (u16, Value) {
    let resp = client.get(url).send().await.expect("Failed to send probe");
    let status = resp.status().as_u16();
    let body: Value = resp.json().await.expect("Failed to parse probe response");
    (status, body)
}

// =============================================================================
// Cycle-Driven Probe Tests
// =============================================================================

#[tokio::test]
async fn test_cycles_drive_probe_verdicts() {
    let (_dir, store) = open_test_store();
    let humidity = ScriptedSensor::new(SensorKind::Humidity, store.clone());
    let soil = ScriptedSensor::new(SensorKind::Soil, store.clone());
    let sink = SharedSink::default();

    let registry = SensorRegistry::new(vec![humidity.clone(), soil.clone()]);
    let kinds = registry.kinds();
    let daemon = Daemon::new(registry, store.clone(), sink.factory(), &AppConfig::default());

    let base_url = start_probe_server(store, kinds).await;
    let client = reqwest::Client::new();

    // Before the first cycle both probes fail.
    let (status, body) = probe(&client, format!("{}/health", base_url)).await;
    assert_eq!(status, 503);
    assert_eq!(body["status"], "Failed");
    let (status, _) = probe(&client, format!("{}/ready", base_url)).await;
    assert_eq!(status, 503);

    // A full successful cycle turns both probes green.
    let outcome = daemon.run_cycle().await.expect("cycle failed fatally");
    assert_eq!(outcome, CycleOutcome::Succeeded);

    let (status, body) = probe(&client, format!("{}/health", base_url)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "OK");
    let (status, _) = probe(&client, format!("{}/ready", base_url)).await;
    assert_eq!(status, 200);

    // A sensor that stops reading but keeps publishing fails liveness
    // while readiness holds.
    humidity.set_collect_ok(false);
    let outcome = daemon.run_cycle().await.expect("cycle failed fatally");
    assert_eq!(outcome, CycleOutcome::Failed);

    let (status, _) = probe(&client, format!("{}/health", base_url)).await;
    assert_eq!(status, 503);
    let (status, body) = probe(&client, format!("{}/ready", base_url)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "OK");

    // Recovery flips liveness back on the next cycle.
    humidity.set_collect_ok(true);
    daemon.run_cycle().await.expect("cycle failed fatally");
    let (status, _) = probe(&client, format!("{}/health", base_url)).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_publisher_scope_and_missing_markers() {
    let (_dir, store) = open_test_store();
    let humidity = ScriptedSensor::new(SensorKind::Humidity, store.clone());
    let soil = ScriptedSensor::new(SensorKind::Soil, store.clone());
    let sink = SharedSink::default();

    let registry = SensorRegistry::new(vec![humidity.clone(), soil.clone()]);
    let daemon = Daemon::new(registry, store, sink.factory(), &AppConfig::default());

    daemon.run_cycle().await.expect("cycle failed fatally");
    humidity.set_collect_ok(false);
    daemon.run_cycle().await.expect("cycle failed fatally");

    // One connection per cycle.
    assert_eq!(sink.connects.load(Ordering::SeqCst), 2);

    let points = sink.points.lock();
    assert_eq!(points.len(), 4);

    // First cycle: both sensors delivered measured values.
    let first: Vec<_> = points.iter().take(2).collect();
    assert!(first.iter().all(|p| p.collected && p.value == 42.0));

    // Second cycle: the broken sensor published its miss, the healthy
    // one a real value.
    let miss = points
        .iter()
        .skip(2)
        .find(|p| p.sensor == SensorKind::Humidity)
        .expect("missing humidity marker");
    assert!(!miss.collected);
    assert_eq!(miss.value, MISSING_VALUE);
    let real = points
        .iter()
        .skip(2)
        .find(|p| p.sensor == SensorKind::Soil)
        .expect("missing soil point");
    assert!(real.collected);
}

#[tokio::test]
async fn test_records_survive_restart() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");

    // First run: one healthy cycle, then the process goes away.
    {
        let store =
            HealthStore::open(dir.path(), Duration::ZERO).expect("Failed to open store");
        let humidity = ScriptedSensor::new(SensorKind::Humidity, store.clone());
        let soil = ScriptedSensor::new(SensorKind::Soil, store.clone());
        let sink = SharedSink::default();
        let registry = SensorRegistry::new(vec![humidity, soil]);
        let daemon = Daemon::new(registry, store, sink.factory(), &AppConfig::default());
        daemon.run_cycle().await.expect("cycle failed fatally");
    }

    // Second run sees the previous run's records.
    let store = HealthStore::open(dir.path(), Duration::ZERO).expect("Failed to reopen store");
    let base_url =
        start_probe_server(store, vec![SensorKind::Humidity, SensorKind::Soil]).await;
    let client = reqwest::Client::new();

    let (status, body) = probe(&client, format!("{}/health", base_url)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "OK");
}

// =============================================================================
// Full Daemon Tests
// =============================================================================

#[tokio::test]
async fn test_daemon_serves_probes_end_to_end() {
    let (_dir, store) = open_test_store();
    let humidity = ScriptedSensor::new(SensorKind::Humidity, store.clone());
    let soil = ScriptedSensor::new(SensorKind::Soil, store.clone());
    let sink = SharedSink::default();
    let registry = SensorRegistry::new(vec![humidity, soil]);

    // Reserve a free port for the daemon to bind.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind random port");
        listener.local_addr().expect("Failed to get local addr").port()
    };

    let mut config = AppConfig::default();
    config.server.bind = "127.0.0.1".to_string();
    config.server.port = port;
    config.daemon.poll_interval = Duration::from_millis(50);

    let daemon = Daemon::new(registry, store, sink.factory(), &config);
    let token = daemon.shutdown_token();
    let handle = tokio::spawn(daemon.run());

    // Wait for the server to come up and the first cycle to land.
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    let mut last_status = 0;
    for _ in 0..100 {
        if let Ok(resp) = client.get(&url).send().await {
            last_status = resp.status().as_u16();
            if last_status == 200 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(last_status, 200, "daemon never turned healthy");

    let (status, body) = probe(&client, format!("http://127.0.0.1:{}/ready", port)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "OK");

    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .expect("daemon task panicked");
    assert!(result.is_ok());
}
