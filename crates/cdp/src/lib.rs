//! Multiplexed Chrome DevTools Protocol connection
//!
//! One transport carries many sessions: the root ("browser") session with
//! an empty ID plus one session per attached debug target.
//!
//! ```text
//! Session::send_or_die ─▶ Connection::send ─▶ Transport
//!                                                │
//! Session::on_message ◀─ Connection::on_message ◀┘  (pump task, in order)
//! ```
//!
//! Every command settles exactly once: with its reply, or with a
//! `Target closed.` rejection when its session or the connection closes.
//! Closure is terminal; there is no reconnection.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod logger;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{CDPError, CallSite, Result};
pub use events::{EventEmitter, Subscription};
pub use logger::{NoopLogger, ProtocolLogger, TracingLogger};
pub use protocol::{CDPEvent, CDPMessage, CDPRequest, CDPResponse};
pub use session::{CommandFuture, Session};
pub use transport::{MemoryPeer, MemoryTransport, Transport, TransportEvent, WebSocketTransport};
