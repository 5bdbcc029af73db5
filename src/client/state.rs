use std::collections::VecDeque;

use crate::{
    bridge::BridgeEvent,
    config::{DEFAULT_HISTORY_CAPACITY, DEFAULT_LOG_CAPACITY},
    telemetry::{LogLine, TelemetryRecord},
};

use super::types::{ClientSnapshot, StatusSummary, WindowSummary};

/// Presentation-side accumulation of bridge events: a sliding window of the
/// most recent records and a capped log history, both evicted oldest-first.
#[derive(Debug, Clone)]
pub struct ClientState {
    records: VecDeque<TelemetryRecord>,
    logs: VecDeque<LogLine>,
    history_capacity: usize,
    log_capacity: usize,
    records_received: u64,
    logs_received: u64,
    events_missed: u64,
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_LOG_CAPACITY)
    }
}

impl ClientState {
    pub fn new(history_capacity: usize, log_capacity: usize) -> Self {
        let history_capacity = history_capacity.max(1);
        let log_capacity = log_capacity.max(1);
        Self {
            records: VecDeque::with_capacity(history_capacity),
            logs: VecDeque::new(),
            history_capacity,
            log_capacity,
            records_received: 0,
            logs_received: 0,
            events_missed: 0,
        }
    }

    pub fn on_record(&mut self, record: TelemetryRecord) {
        self.records_received += 1;
        if self.records.len() == self.history_capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn on_log(&mut self, line: LogLine) {
        self.logs_received += 1;
        if self.logs.len() == self.log_capacity {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    pub fn apply(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Record(record) => self.on_record(record),
            BridgeEvent::Log(line) => self.on_log(line),
            BridgeEvent::Lagged(missed) => self.events_missed += missed,
        }
    }

    pub fn records(&self) -> impl ExactSizeIterator<Item = &TelemetryRecord> {
        self.records.iter()
    }

    pub fn logs(&self) -> impl ExactSizeIterator<Item = &LogLine> {
        self.logs.iter()
    }

    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.records.back()
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            records: self.records.iter().copied().collect(),
            logs: self.logs.iter().cloned().collect(),
            records_received: self.records_received,
            logs_received: self.logs_received,
            events_missed: self.events_missed,
        }
    }

    /// Status of the latest sample; zeros and absent before any arrive.
    pub fn status(&self) -> StatusSummary {
        self.latest().map(StatusSummary::from).unwrap_or_default()
    }

    pub fn window_summary(&self) -> WindowSummary {
        let samples = self.records.len();
        if samples == 0 {
            return WindowSummary::default();
        }
        let n = samples as f64;

        let present = self.records.iter().filter(|r| r.present).count() as f64;
        let energy: f64 = self.records.iter().map(|r| r.energy_motion).sum();
        let fps: f64 = self.records.iter().map(|r| r.fps).sum();

        let mut tail_latency: Vec<f64> = self.records.iter().map(|r| r.p95_us).collect();
        tail_latency.sort_by(f64::total_cmp);

        WindowSummary {
            samples,
            present_ratio: present / n,
            mean_energy_motion: energy / n,
            mean_fps: fps / n,
            p50_of_p95_us: percentile(&tail_latency, 50.0),
            p95_of_p95_us: percentile(&tail_latency, 95.0),
            max_drops: self.records.iter().map(|r| r.drops).max().unwrap_or(0),
            max_corrupt: self.records.iter().map(|r| r.corrupt).max().unwrap_or(0),
        }
    }
}

/// Nearest-rank percentile over already sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::LogSource;

    fn record(ts: i64) -> TelemetryRecord {
        TelemetryRecord {
            timestamp_ns: ts,
            energy_motion: ts as f64 / 10.0,
            present: ts % 2 == 0,
            fps: 60.0,
            p50_us: 100.0,
            p95_us: 100.0 + ts as f64,
            drops: ts as u64,
            corrupt: 0,
        }
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let mut state = ClientState::default();
        for ts in 0..=300 {
            state.on_record(record(ts));
        }

        assert_eq!(state.records().len(), 300);
        let timestamps: Vec<i64> = state.records().map(|r| r.timestamp_ns).collect();
        assert_eq!(timestamps, (1..=300).collect::<Vec<_>>());
        assert_eq!(state.snapshot().records_received, 301);
    }

    #[test]
    fn small_window_keeps_newest_in_order() {
        let mut state = ClientState::new(3, 10);
        for ts in 0..5 {
            state.on_record(record(ts));
        }
        let timestamps: Vec<i64> = state.records().map(|r| r.timestamp_ns).collect();
        assert_eq!(timestamps, vec![2, 3, 4]);
        assert_eq!(state.latest().map(|r| r.timestamp_ns), Some(4));
    }

    #[test]
    fn log_history_is_capped() {
        let mut state = ClientState::new(10, 2);
        for text in ["a", "b", "c"] {
            state.on_log(LogLine::new(LogSource::Stdout, text));
        }
        let texts: Vec<&str> = state.logs().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert_eq!(state.snapshot().logs_received, 3);
    }

    #[test]
    fn apply_routes_events() {
        let mut state = ClientState::default();
        state.apply(BridgeEvent::Record(record(1)));
        state.apply(BridgeEvent::Log(LogLine::new(LogSource::Stderr, "x")));
        state.apply(BridgeEvent::Lagged(4));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.logs.len(), 1);
        assert_eq!(snapshot.events_missed, 4);
    }

    #[test]
    fn status_defaults_before_first_record() {
        let state = ClientState::default();
        assert_eq!(state.status(), StatusSummary::default());
        assert!(!state.status().present);
    }

    #[test]
    fn status_tracks_latest_record() {
        let mut state = ClientState::default();
        state.on_record(record(1));
        state.on_record(record(2));
        let status = state.status();
        assert!(status.present);
        assert_eq!(status.p95_us, 102.0);
        assert_eq!(status.drops, 2);
    }

    #[test]
    fn window_summary_aggregates_current_window() {
        let mut state = ClientState::new(4, 4);
        for ts in 0..4 {
            state.on_record(record(ts));
        }
        let summary = state.window_summary();
        assert_eq!(summary.samples, 4);
        assert_eq!(summary.present_ratio, 0.5);
        assert!((summary.mean_energy_motion - 0.15).abs() < 1e-9);
        assert_eq!(summary.mean_fps, 60.0);
        assert_eq!(summary.p50_of_p95_us, 101.0);
        assert_eq!(summary.p95_of_p95_us, 102.0);
        assert_eq!(summary.max_drops, 3);
    }

    #[test]
    fn empty_window_summary_is_zeroed() {
        assert_eq!(ClientState::default().window_summary(), WindowSummary::default());
    }
}
