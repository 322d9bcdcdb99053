//! Error types for CDP operations
//!
//! Flat hierarchy. Command failures keep the method name and the location
//! the command was sent from.

use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::protocol::RequestId;

/// Result type for CDP operations
pub type Result<T> = std::result::Result<T, CDPError>;

/// Source location a command was issued from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite(&'static Location<'static>);

impl CallSite {
    #[track_caller]
    pub fn capture() -> Self {
        Self(Location::caller())
    }

    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.0.file(), self.0.line(), self.0.column())
    }
}

#[derive(Error, Debug)]
pub enum CDPError {
    #[error("Protocol error ({method}): {message} - {data}")]
    Protocol {
        method: String,
        code: Option<i64>,
        message: String,
        /// Error `data` as serialized JSON
        data: String,
        call_site: CallSite,
    },

    #[error("Protocol error ({method}): Target closed.")]
    TargetClosed { method: String, call_site: CallSite },

    #[error("Protocol error ({method}): Session closed. Most likely the target has been closed.")]
    SessionClosed { method: String, call_site: CallSite },

    #[error("unknown session id: {0}")]
    UnknownSession(String),

    #[error("unexpected response for command {0}")]
    UnexpectedResponse(RequestId),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid endpoint: {0}")]
    InvalidUrl(String),

    #[error("Connect timeout")]
    Timeout,
}

impl CDPError {
    /// Peer and local bookkeeping disagree; the connection can't be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CDPError::UnknownSession(_) | CDPError::UnexpectedResponse(_)
        )
    }

    /// Where the failed command was sent from, for command failures.
    pub fn call_site(&self) -> Option<CallSite> {
        match self {
            CDPError::Protocol { call_site, .. }
            | CDPError::TargetClosed { call_site, .. }
            | CDPError::SessionClosed { call_site, .. } => Some(*call_site),
            _ => None,
        }
    }
}
