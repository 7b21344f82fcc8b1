//! Health endpoint server.
//!
//! Serves the two container probes backed by the health record store:
//! - `GET /health`: liveness, fails when any sensor stopped reading out
//! - `GET /ready`: readiness, fails only when a sensor stopped reading
//!   out and publishing both
//!
//! Handlers never touch the bus or the sink; they only evaluate the
//! records the poll loop last wrote.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::health::{HealthStore, Probe, Verdict, evaluate};
use crate::sensor::SensorKind;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    store: HealthStore,
    kinds: Arc<Vec<SensorKind>>,
}

impl AppState {
    pub fn new(store: HealthStore, kinds: Vec<SensorKind>) -> Self {
        Self {
            store,
            kinds: Arc::new(kinds),
        }
    }
}

/// Probe response body.
#[derive(Debug, Serialize)]
struct ProbeResponse {
    status: Verdict,
}

/// Create the Axum router with the probe routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness probe.
async fn health_handler(State(state): State<AppState>) -> Response {
    probe_response(&state, Probe::Liveness)
}

/// Readiness probe.
async fn ready_handler(State(state): State<AppState>) -> Response {
    probe_response(&state, Probe::Readiness)
}

fn probe_response(state: &AppState, probe: Probe) -> Response {
    let verdict = match state.store.snapshot(&state.kinds) {
        Ok(records) => evaluate(probe, &records, state.kinds.len()),
        Err(e) => {
            tracing::error!(probe = ?probe, error = %e, "Record snapshot failed");
            Verdict::Failed
        }
    };

    let status = match verdict {
        Verdict::Ok => StatusCode::OK,
        Verdict::Failed => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(ProbeResponse { status: verdict })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthRecord;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    fn create_test_state() -> (AppState, HealthStore, TempDir) {
        let dir = tempdir().unwrap();
        // Zero TTL so every request sees the latest records.
        let store = HealthStore::open(dir.path(), Duration::ZERO).unwrap();
        let state = AppState::new(
            store.clone(),
            vec![SensorKind::Humidity, SensorKind::Soil],
        );
        (state, store, dir)
    }

    async fn probe(state: AppState, uri: &str) -> (StatusCode, String) {
        let app = create_router(state);
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_probes_fail_before_first_cycle() {
        let (state, _store, _dir) = create_test_state();

        let (status, body) = probe(state.clone(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"status":"Failed"}"#);

        let (status, body) = probe(state, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"status":"Failed"}"#);
    }

    #[tokio::test]
    async fn test_probes_pass_with_healthy_records() {
        let (state, store, _dir) = create_test_state();
        store
            .write(SensorKind::Humidity, HealthRecord::new(true, true))
            .unwrap();
        store
            .write(SensorKind::Soil, HealthRecord::new(true, true))
            .unwrap();

        let (status, body) = probe(state.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"OK"}"#);

        let (status, body) = probe(state, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"OK"}"#);
    }

    #[tokio::test]
    async fn test_probes_fail_with_partial_records() {
        let (state, store, _dir) = create_test_state();
        store
            .write(SensorKind::Humidity, HealthRecord::new(true, true))
            .unwrap();

        let (status, _) = probe(state.clone(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = probe(state, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_failed_readout_distinguishes_the_probes() {
        let (state, store, _dir) = create_test_state();
        // Humidity still publishes its miss but no longer reads out.
        store
            .write(SensorKind::Humidity, HealthRecord::new(true, false))
            .unwrap();
        store
            .write(SensorKind::Soil, HealthRecord::new(true, true))
            .unwrap();

        let (status, _) = probe(state.clone(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = probe(state, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"OK"}"#);
    }

    #[tokio::test]
    async fn test_fully_dead_sensor_fails_both_probes() {
        let (state, store, _dir) = create_test_state();
        store
            .write(SensorKind::Humidity, HealthRecord::new(false, false))
            .unwrap();
        store
            .write(SensorKind::Soil, HealthRecord::new(true, true))
            .unwrap();

        let (status, _) = probe(state.clone(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = probe(state, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_recovery_flips_probes_back() {
        let (state, store, _dir) = create_test_state();
        store
            .write(SensorKind::Humidity, HealthRecord::new(false, false))
            .unwrap();
        store
            .write(SensorKind::Soil, HealthRecord::new(true, true))
            .unwrap();
        let (status, _) = probe(state.clone(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        // The next successful cycle rewrites the record.
        store
            .write(SensorKind::Humidity, HealthRecord::new(true, true))
            .unwrap();
        let (status, _) = probe(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}
