//! Daemon orchestration.
//!
//! # Architecture
//!
//! - [`Daemon`]: owns the poll loop, the HTTP server task, and shutdown
//! - One cycle: build and connect a fresh publisher, run every sensor
//!   on its own blocking worker, abort the stragglers on first failure
//! - Cycles are strictly sequential; the poll interval starts counting
//!   after the slowest sensor finishes
//!
//! Sensor failures degrade the cycle, never the process. The fatal
//! paths are a bind failure at startup and a panicking sensor task.

use std::future::IntoFuture;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::health::HealthStore;
use crate::publisher::{Publisher, PublisherFactory};
use crate::sensor::{SensorKind, SensorRegistry};
use crate::server::{AppState, create_router};

/// Why the daemon stopped.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The health endpoint listener could not be set up.
    #[error("failed to bind health endpoint: {0}")]
    Server(#[from] io::Error),

    /// A sensor task panicked. Sensors contain their own failures, so
    /// a panic is a programming error worth dying loudly for.
    #[error("sensor task panicked: {0}")]
    TaskPanic(String),
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every sensor collected and published.
    Succeeded,
    /// At least one sensor failed, the publisher refused to connect,
    /// or a straggler was abandoned. Retried at the next interval.
    Failed,
}

/// The poll daemon: sensor cycles plus the health endpoint server.
pub struct Daemon {
    registry: SensorRegistry,
    store: HealthStore,
    make_publisher: PublisherFactory,
    bind: String,
    port: u16,
    poll_interval: Duration,
    shutdown_timeout: Duration,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(
        registry: SensorRegistry,
        store: HealthStore,
        make_publisher: PublisherFactory,
        config: &AppConfig,
    ) -> Self {
        Self {
            registry,
            store,
            make_publisher,
            bind: config.server.bind.clone(),
            port: config.server.port,
            poll_interval: config.daemon.poll_interval,
            shutdown_timeout: config.daemon.shutdown_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the daemon when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve the health endpoints and poll until shutdown.
    pub async fn run(self) -> Result<(), DaemonError> {
        let addr = format!("{}:{}", self.bind, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, sensors = self.registry.len(), "Daemon started");

        let state = AppState::new(self.store.clone(), self.registry.kinds());
        let shutdown = self.shutdown.clone();
        let server = tokio::spawn(
            axum::serve(listener, create_router(state))
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .into_future(),
        );

        let result = self.poll_loop().await;

        // Stop the server either way; a poll failure should still take
        // the endpoints down with it.
        self.shutdown.cancel();
        match tokio::time::timeout(self.shutdown_timeout, server).await {
            Ok(Ok(Ok(()))) => tracing::info!("Health endpoint server stopped"),
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Health endpoint server error at shutdown");
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Health endpoint server task failed"),
            Err(_) => tracing::warn!("Health endpoint server shutdown timed out"),
        }

        result
    }

    /// Run cycles back to back with a fixed pause in between.
    async fn poll_loop(&self) -> Result<(), DaemonError> {
        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!("Poll loop stopping");
                return Ok(());
            }

            let start = Instant::now();
            let outcome = self.run_cycle().await?;
            let duration_ms = start.elapsed().as_millis();
            match outcome {
                CycleOutcome::Succeeded => tracing::info!(duration_ms, "Poll cycle succeeded"),
                CycleOutcome::Failed => tracing::warn!(duration_ms, "Poll cycle failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Poll loop stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Run one poll cycle to completion.
    ///
    /// The publisher lives exactly this scope: built fresh, connected
    /// once, shared read-only across the sensor tasks, dropped at the
    /// end. A connection failure fails the cycle before any sensor
    /// runs; their previous health records stay untouched.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, DaemonError> {
        let mut publisher = (self.make_publisher)();
        if !publisher.connect() {
            tracing::warn!("Publisher connection failed, skipping cycle");
            return Ok(CycleOutcome::Failed);
        }
        let publisher: Arc<dyn Publisher> = Arc::from(publisher);

        let mut tasks: JoinSet<(SensorKind, bool)> = JoinSet::new();
        for sensor in self.registry.iter() {
            let sensor = Arc::clone(sensor);
            let publisher = Arc::clone(&publisher);
            tasks.spawn_blocking(move || (sensor.kind(), sensor.run(publisher.as_ref())));
        }

        let mut failed = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, true)) => {
                    tracing::debug!(sensor = %kind, "Sensor cycle succeeded");
                }
                Ok((kind, false)) => {
                    tracing::warn!(sensor = %kind, "Sensor cycle failed");
                    if !failed {
                        // Abandon the cycle's stragglers; workers that
                        // already started still run to completion.
                        tasks.abort_all();
                    }
                    failed = true;
                }
                Err(e) if e.is_panic() => {
                    return Err(DaemonError::TaskPanic(e.to_string()));
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Sensor task cancelled");
                    failed = true;
                }
            }
        }

        Ok(if failed {
            CycleOutcome::Failed
        } else {
            CycleOutcome::Succeeded
        })
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("poll_interval", &self.poll_interval)
            .field("sensors", &self.registry.kinds())
            .finish_non_exhaustive()
    }
}
