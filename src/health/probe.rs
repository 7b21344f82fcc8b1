//! Liveness/readiness evaluation over persisted health records.

use std::collections::BTreeMap;

use serde::Serialize;
use strum_macros::Display;

use crate::health::record::HealthRecord;
use crate::sensor::SensorKind;

/// Which probe semantics to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// `/health`: every sensor's last collect must have succeeded.
    Liveness,
    /// `/ready`: only a sensor that neither read nor published blocks
    /// readiness; one mid-publish is still considered ready.
    Readiness,
}

/// Probe outcome; serializes to the exact status strings of the HTTP
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum Verdict {
    #[serde(rename = "OK")]
    #[strum(serialize = "OK")]
    Ok,
    Failed,
}

/// Decide one probe over a records snapshot.
///
/// Pure over its inputs: the caller supplies the snapshot and the
/// registered-sensor count. A snapshot smaller (or larger) than the
/// registry means some sensor has never completed a cycle, or the
/// registered set changed under us; failed either way, regardless of
/// the records' content.
pub fn evaluate(
    probe: Probe,
    records: &BTreeMap<SensorKind, HealthRecord>,
    expected_count: usize,
) -> Verdict {
    if records.is_empty() || records.len() != expected_count {
        return Verdict::Failed;
    }
    for record in records.values() {
        let status = record.healthcheck;
        let failed = match probe {
            Probe::Liveness => !status.readout,
            Probe::Readiness => !status.readout && !status.publish,
        };
        if failed {
            return Verdict::Failed;
        }
    }
    Verdict::Ok
}
