//! Connection configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::{CDPError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// DevTools WebSocket endpoint, e.g. `ws://127.0.0.1:9229/<uuid>`
    pub url: String,
    pub connect_timeout_ms: u64,
    /// Log every raw protocol message through `tracing`
    pub trace_protocol: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9222/devtools/browser".to_string(),
            connect_timeout_ms: 10_000,
            trace_protocol: false,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Parsed endpoint. Only `ws` and `wss` are accepted.
    pub fn endpoint(&self) -> Result<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| CDPError::InvalidUrl(format!("{}: {}", self.url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(CDPError::InvalidUrl(format!(
                "{}: unsupported scheme '{}'",
                self.url,
                url.scheme()
            )));
        }
        Ok(url)
    }
}
