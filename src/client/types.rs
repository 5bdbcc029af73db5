use serde::{Deserialize, Serialize};

use crate::telemetry::{LogLine, TelemetryRecord};

/// Everything the dashboard needs for one render pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub records: Vec<TelemetryRecord>,
    pub logs: Vec<LogLine>,
    pub records_received: u64,
    pub logs_received: u64,
    /// Events dropped because this consumer fell behind the bridge.
    pub events_missed: u64,
}

/// Headline values from the most recent record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub present: bool,
    pub fps: f64,
    pub p95_us: f64,
    pub energy_motion: f64,
    pub drops: u64,
    pub corrupt: u64,
}

impl From<&TelemetryRecord> for StatusSummary {
    fn from(record: &TelemetryRecord) -> Self {
        Self {
            present: record.present,
            fps: record.fps,
            p95_us: record.p95_us,
            energy_motion: record.energy_motion,
            drops: record.drops,
            corrupt: record.corrupt,
        }
    }
}

/// Aggregates over the records currently held in the window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WindowSummary {
    pub samples: usize,
    pub present_ratio: f64,
    pub mean_energy_motion: f64,
    pub mean_fps: f64,
    pub p50_of_p95_us: f64,
    pub p95_of_p95_us: f64,
    pub max_drops: u64,
    pub max_corrupt: u64,
}
