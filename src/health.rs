//! Health State Layer
//!
//! Per-sensor cycle outcomes, persisted for the probe endpoints.
//!
//! # Architecture
//!
//! - [`HealthRecord`]: one sensor's last-cycle `{publish, readout}` pair,
//!   stored as a single JSON file
//! - [`HealthStore`]: atomic writes plus a TTL-bounded read cache
//! - [`evaluate`]: pure liveness/readiness decision over a store snapshot
//!
//! Sensors write through on every state change; the HTTP surface reads
//! concurrently from its own request path. The two sides only meet on
//! disk, so eventual visibility within the cache TTL is the contract.

mod probe;
mod record;
mod store;

pub use probe::{Probe, Verdict, evaluate};
pub use record::{HealthRecord, HealthStatus};
pub use store::{HealthStore, HealthStoreError};
