use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// One per-frame sample reported by the engine on stdout.
///
/// Counts are unsigned so a negative `drops` or `corrupt` fails to
/// deserialize and the line is treated as a diagnostic instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp_ns: i64,
    pub energy_motion: f64,
    pub present: bool,
    pub fps: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub drops: u64,
    pub corrupt: u64,
}

impl TelemetryRecord {
    /// Parse a single JSON object and check the numeric invariants.
    pub fn from_json(line: &str) -> Result<Self, DecodeError> {
        let record: TelemetryRecord = serde_json::from_str(line)?;
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        let floats = [
            ("energy_motion", self.energy_motion),
            ("fps", self.fps),
            ("p50_us", self.p50_us),
            ("p95_us", self.p95_us),
        ];
        for (field, value) in floats {
            if !value.is_finite() {
                return Err(DecodeError::NonFinite { field });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LogSource {
    /// Engine stdout line that was not a record.
    Stdout,
    Stderr,
    /// Emitted by the bridge itself (exit notices and the like).
    Bridge,
}

/// Undecoded diagnostic text. The bridge never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub source: LogSource,
    pub text: String,
}

impl LogLine {
    pub fn new(source: LogSource, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"timestamp_ns":1,"energy_motion":0.5,"present":true,"fps":60,"p50_us":100,"p95_us":200,"drops":0,"corrupt":0}"#;

    #[test]
    fn parses_sample_record() {
        let record = TelemetryRecord::from_json(SAMPLE).unwrap();
        assert_eq!(record.timestamp_ns, 1);
        assert_eq!(record.energy_motion, 0.5);
        assert!(record.present);
        assert_eq!(record.fps, 60.0);
        assert_eq!(record.p50_us, 100.0);
        assert_eq!(record.p95_us, 200.0);
        assert_eq!(record.drops, 0);
        assert_eq!(record.corrupt, 0);
    }

    #[test]
    fn negative_counts_are_malformed() {
        let line = SAMPLE.replace(r#""drops":0"#, r#""drops":-1"#);
        assert!(matches!(
            TelemetryRecord::from_json(&line),
            Err(DecodeError::Malformed(_))
        ));

        let line = SAMPLE.replace(r#""corrupt":0"#, r#""corrupt":-4"#);
        assert!(TelemetryRecord::from_json(&line).is_err());
    }

    #[test]
    fn missing_field_is_malformed() {
        let line = r#"{"timestamp_ns":1,"energy_motion":0.5,"present":true,"fps":60}"#;
        assert!(matches!(
            TelemetryRecord::from_json(line),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn extra_fields_are_ignored() {
        let line = SAMPLE.replace('}', r#","energy_breathing":0.1}"#);
        assert!(TelemetryRecord::from_json(&line).is_ok());
    }

    #[test]
    fn non_finite_values_fail_validation() {
        let mut record = TelemetryRecord::from_json(SAMPLE).unwrap();
        record.fps = f64::NAN;
        assert!(matches!(
            record.validate(),
            Err(DecodeError::NonFinite { field: "fps" })
        ));

        record.fps = 30.0;
        record.p95_us = f64::INFINITY;
        assert!(matches!(
            record.validate(),
            Err(DecodeError::NonFinite { field: "p95_us" })
        ));
    }

    #[test]
    fn non_object_json_is_malformed() {
        assert!(TelemetryRecord::from_json("42").is_err());
        assert!(TelemetryRecord::from_json("[1,2,3]").is_err());
    }
}
