//! Protocol traffic logging
//!
//! Wire-level tracing is injected per connection rather than read from
//! process-wide state. The default logger does nothing.

/// Observes every raw message crossing the transport.
pub trait ProtocolLogger: Send + Sync {
    fn on_send(&self, message: &str) {
        let _ = message;
    }

    fn on_receive(&self, message: &str) {
        let _ = message;
    }

    fn on_close(&self) {}
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl ProtocolLogger for NoopLogger {}

/// Forwards traffic to `tracing` at TRACE level under the `cdp::protocol` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl ProtocolLogger for TracingLogger {
    fn on_send(&self, message: &str) {
        tracing::trace!(target: "cdp::protocol", "SEND {}", message);
    }

    fn on_receive(&self, message: &str) {
        tracing::trace!(target: "cdp::protocol", "RECV {}", message);
    }

    fn on_close(&self) {
        tracing::trace!(target: "cdp::protocol", "CLOSED");
    }
}
