//! Transport - the raw message channel under a Connection
//!
//! A transport only moves strings. Inbound traffic and the single close
//! notification arrive on one channel that the Connection takes ownership
//! of, so there is exactly one message handler and one close handler.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};

use crate::error::Result;

/// Something the transport hands up to its Connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    /// Delivered at most once, whichever side closed.
    Closed,
}

/// Inbound side of a transport
pub type Inbound = mpsc::UnboundedReceiver<TransportEvent>;

pub trait Transport: Send + Sync {
    /// Fire-and-forget. Messages sent after close are dropped.
    fn send(&self, message: String);

    /// Idempotent.
    fn close(&self);
}

/// Inbound sender that guarantees a single `Closed`.
#[derive(Clone)]
struct InboundSender {
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl InboundSender {
    fn channel() -> (Self, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (sender, rx)
    }

    fn message(&self, message: String) {
        if !self.is_closed() {
            let _ = self.tx.send(TransportEvent::Message(message));
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(TransportEvent::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// In-process transport. The other end is a [`MemoryPeer`].
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: InboundSender,
}

/// Remote end of a [`MemoryTransport`]: reads what the connection sent and
/// delivers replies and events to it.
pub struct MemoryPeer {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: InboundSender,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, Inbound, MemoryPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound, inbound_rx) = InboundSender::channel();

        let transport = MemoryTransport {
            outbound: outbound_tx,
            inbound: inbound.clone(),
        };
        let peer = MemoryPeer {
            outbound: outbound_rx,
            inbound,
        };
        (transport, inbound_rx, peer)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: String) {
        if !self.inbound.is_closed() {
            let _ = self.outbound.send(message);
        }
    }

    fn close(&self) {
        self.inbound.close();
    }
}

impl MemoryPeer {
    /// Next message the connection sent, parsed.
    pub async fn recv(&mut self) -> Option<Value> {
        let raw = self.outbound.recv().await?;
        serde_json::from_str(&raw).ok()
    }

    /// Like [`recv`](Self::recv) but never waits.
    pub fn try_recv(&mut self) -> Option<Value> {
        let raw = self.outbound.try_recv().ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn deliver(&self, message: Value) {
        self.inbound.message(message.to_string());
    }

    pub fn deliver_raw(&self, message: impl Into<String>) {
        self.inbound.message(message.into());
    }

    /// Remote-side close.
    pub fn close(&self) {
        self.inbound.close();
    }
}

/// WebSocket transport over tokio-tungstenite.
///
/// A reader task feeds inbound frames up; a writer task drains outgoing
/// messages so `send` never blocks.
pub struct WebSocketTransport {
    outgoing: mpsc::UnboundedSender<Message>,
    inbound: InboundSender,
}

impl WebSocketTransport {
    /// Connect to a DevTools WebSocket endpoint
    pub async fn connect(ws_url: &str) -> Result<(Self, Inbound)> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        Ok(Self::from_stream(ws_stream))
    }

    /// Wrap an already-open WebSocket. Must be called inside a Tokio runtime.
    pub fn from_stream<S>(ws_stream: WebSocketStream<S>) -> (Self, Inbound)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound, inbound_rx) = InboundSender::channel();

        let writer_inbound = inbound.clone();
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Message::Close(_) = message {
                    break;
                }
                if let Err(e) = sink.send(message).await {
                    tracing::error!("WebSocket send failed: {}", e);
                    writer_inbound.close();
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_inbound = inbound.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader_inbound.message(text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => reader_inbound.message(text),
                        Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            tracing::info!("WebSocket closed");
            reader_inbound.close();
        });

        let transport = Self {
            outgoing: outgoing_tx,
            inbound,
        };
        (transport, inbound_rx)
    }
}

impl Transport for WebSocketTransport {
    fn send(&self, message: String) {
        if !self.inbound.is_closed() {
            let _ = self.outgoing.send(Message::Text(message));
        }
    }

    fn close(&self) {
        if !self.inbound.is_closed() {
            let _ = self.outgoing.send(Message::Close(None));
        }
        self.inbound.close();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}
