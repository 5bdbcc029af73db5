use std::io;

use thiserror::Error;

/// Failures returned to callers of the bridge commands.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("engine already running (session {session_id})")]
    AlreadyRunning { session_id: String },

    #[error("failed to launch engine `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("engine {0} pipe was not captured")]
    MissingPipe(&'static str),
}

/// Why a stdout line was demoted to a log line instead of becoming a record.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line is blank")]
    Blank,

    #[error("line exceeded {limit} bytes and was truncated")]
    Truncated { limit: usize },

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("field `{field}` is not a finite number")]
    NonFinite { field: &'static str },
}
