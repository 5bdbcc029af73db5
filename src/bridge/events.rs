//! Fan-out of decoded records and log lines to any number of observers.
//!
//! Records and logs travel on two independent broadcast channels, so order is
//! kept within each kind but not across them. Publishing never waits on a
//! consumer: a subscriber that falls more than `capacity` events behind loses
//! the oldest ones and is told how many it missed.

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::telemetry::{LogLine, TelemetryRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum BridgeEvent {
    Record(TelemetryRecord),
    Log(LogLine),
    /// The subscriber fell behind and this many events were dropped.
    Lagged(u64),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    records: broadcast::Sender<TelemetryRecord>,
    logs: broadcast::Sender<LogLine>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (records, _) = broadcast::channel(capacity);
        let (logs, _) = broadcast::channel(capacity);
        Self { records, logs }
    }

    pub fn publish_record(&self, record: TelemetryRecord) {
        // No subscribers is fine; the event is simply not observed.
        let _ = self.records.send(record);
    }

    pub fn publish_log(&self, line: LogLine) {
        let _ = self.logs.send(line);
    }

    pub fn subscribe_records(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.records.subscribe()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogLine> {
        self.logs.subscribe()
    }

    pub fn subscribe(&self) -> BridgeSubscription {
        BridgeSubscription {
            records: Some(self.records.subscribe()),
            logs: Some(self.logs.subscribe()),
        }
    }
}

/// Both event kinds merged into a single stream.
#[derive(Debug)]
pub struct BridgeSubscription {
    records: Option<broadcast::Receiver<TelemetryRecord>>,
    logs: Option<broadcast::Receiver<LogLine>>,
}

impl BridgeSubscription {
    /// Next event from either channel. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            let (records, logs) = match (self.records.as_mut(), self.logs.as_mut()) {
                (None, None) => return None,
                pair => pair,
            };

            let outcome = tokio::select! {
                res = recv_from(records) => res.map(BridgeEvent::Record).map_err(|e| (e, true)),
                res = recv_from(logs) => res.map(BridgeEvent::Log).map_err(|e| (e, false)),
            };

            match outcome {
                Ok(event) => return Some(event),
                Err((RecvError::Lagged(missed), _)) => return Some(BridgeEvent::Lagged(missed)),
                Err((RecvError::Closed, is_records)) => {
                    if is_records {
                        self.records = None;
                    } else {
                        self.logs = None;
                    }
                }
            }
        }
    }

    /// Non-blocking variant used when draining after shutdown.
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        if let Some(records) = self.records.as_mut() {
            match records.try_recv() {
                Ok(record) => return Some(BridgeEvent::Record(record)),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    return Some(BridgeEvent::Lagged(missed))
                }
                Err(_) => {}
            }
        }
        if let Some(logs) = self.logs.as_mut() {
            match logs.try_recv() {
                Ok(line) => return Some(BridgeEvent::Log(line)),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    return Some(BridgeEvent::Lagged(missed))
                }
                Err(_) => {}
            }
        }
        None
    }
}

async fn recv_from<T: Clone>(rx: Option<&mut broadcast::Receiver<T>>) -> Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
