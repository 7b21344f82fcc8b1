//! Persisted health record wire format.

use serde::{Deserialize, Serialize};

/// Durable last-cycle outcome for one sensor.
///
/// The on-disk form is exactly `{"healthcheck": {"publish": bool,
/// "readout": bool}}`; external tooling greps these files, so the shape
/// is a compatibility contract, not an implementation detail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub healthcheck: HealthStatus,
}

/// The two outcome flags tracked per cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Did the last publish hand its datapoints to the sink.
    pub publish: bool,
    /// Did the last collect produce a parsed reading.
    pub readout: bool,
}

impl HealthRecord {
    pub fn new(publish: bool, readout: bool) -> Self {
        Self {
            healthcheck: HealthStatus { publish, readout },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_stable() {
        let record = HealthRecord::new(true, false);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"healthcheck":{"publish":true,"readout":false}}"#);
    }

    #[test]
    fn test_roundtrip() {
        let record = HealthRecord::new(false, true);
        let json = serde_json::to_string(&record).unwrap();
        let back: HealthRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_zero_value_record_has_both_flags_down() {
        let record = HealthRecord::default();
        assert!(!record.healthcheck.publish);
        assert!(!record.healthcheck.readout);
    }
}
