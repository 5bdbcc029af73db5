use std::{fmt, process::ExitStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::Idle
    }
}

impl LifecycleState {
    pub fn is_idle(self) -> bool {
        self == LifecycleState::Idle
    }

    /// Transitions the controller is allowed to make.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Idle)
                | (Running, Stopping)
                | (Running, Idle)
                | (Stopping, Idle)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Public description of one engine run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running; `stop` did nothing.
    NotRunning,
    Stopped {
        exit: Option<ExitStatus>,
        /// The engine ignored the polite request and had to be killed.
        forced: bool,
    },
    /// Another caller was already stopping the engine; returned once that
    /// stop released it.
    Joined,
}

/// How a supervised engine run came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    Exited(ExitStatus),
    Terminated { exit: Option<ExitStatus>, forced: bool },
    WaitFailed,
}

impl SessionEnd {
    pub(crate) fn describe(&self) -> String {
        match self {
            SessionEnd::Exited(status) => format!("engine exited unexpectedly ({status})"),
            SessionEnd::Terminated { exit: Some(status), forced } => {
                if *forced {
                    format!("engine killed after stop timeout ({status})")
                } else {
                    format!("engine stopped ({status})")
                }
            }
            SessionEnd::Terminated { exit: None, .. } => "engine stopped".to_string(),
            SessionEnd::WaitFailed => "engine exit status unavailable".to_string(),
        }
    }
}
