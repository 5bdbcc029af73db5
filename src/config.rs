use std::{str::FromStr, time::Duration};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::telemetry::decoder::DEFAULT_MAX_LINE_BYTES;

pub const DEFAULT_HISTORY_CAPACITY: usize = 300;
pub const DEFAULT_LOG_CAPACITY: usize = 5_000;
pub const DEFAULT_EVENT_CAPACITY: usize = 1_024;

/// Runtime knobs for the bridge and the client store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Records kept in the client's sliding window.
    pub history_capacity: usize,
    pub log_capacity: usize,
    /// Per-subscriber queue depth before the oldest events are dropped.
    pub event_capacity: usize,
    /// How long `stop` waits after the polite signal before killing.
    pub stop_grace: Duration,
    /// Upper bound for flushing the output readers once the child is gone.
    pub drain_timeout: Duration,
    pub max_line_bytes: usize,
    pub debug: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            log_capacity: DEFAULT_LOG_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            stop_grace: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(1),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            debug: false,
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with `AETHERSENSE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = parse_var::<usize, _>(&lookup, "AETHERSENSE_HISTORY") {
            config.history_capacity = value;
        }
        if let Some(value) = parse_var::<usize, _>(&lookup, "AETHERSENSE_LOG_CAPACITY") {
            config.log_capacity = value;
        }
        if let Some(value) = parse_var::<usize, _>(&lookup, "AETHERSENSE_EVENT_CAPACITY") {
            config.event_capacity = value;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "AETHERSENSE_STOP_GRACE_MS") {
            config.stop_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "AETHERSENSE_DRAIN_TIMEOUT_MS") {
            config.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(value) = parse_var::<usize, _>(&lookup, "AETHERSENSE_MAX_LINE_BYTES") {
            config.max_line_bytes = value;
        }
        config.debug = lookup("AETHERSENSE_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        config.normalized()
    }

    /// Clamp capacities so every buffer can hold at least one entry.
    pub fn normalized(mut self) -> Self {
        self.history_capacity = self.history_capacity.max(1);
        self.log_capacity = self.log_capacity.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self.max_line_bytes = self.max_line_bytes.max(1);
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("ignoring {key}={raw:?}: {err}");
            None
        }
    }
}
