//! CDP Connection - one transport, many sessions
//!
//! Design decisions:
//! 1. Single transport per connection; targets are multiplexed by `sessionId`
//! 2. One pump task handles inbound messages strictly in delivery order
//! 3. Replies are matched by command ID inside the owning session
//! 4. Fail fast - closure is terminal, no retries, no reconnection.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::AbortHandle;

use crate::config::ConnectionConfig;
use crate::error::{CDPError, Result};
use crate::events::{EventEmitter, Subscription};
use crate::logger::{NoopLogger, ProtocolLogger, TracingLogger};
use crate::protocol::{AttachToTargetResult, CDPMessage, CDPRequest, RequestId, SessionId};
use crate::session::{Session, DISCONNECTED};
use crate::transport::{Inbound, Transport, TransportEvent, WebSocketTransport};

/// CDP Connection - owns the transport and every session multiplexed on it
pub struct Connection {
    transport: Box<dyn Transport>,

    /// Last issued command ID. IDs start at 1 and are never reused.
    last_id: AtomicU64,

    /// Key: session ID ("" for the root), Value: session
    sessions: DashMap<SessionId, Arc<Session>>,

    /// Root session, kept even after the registry is cleared
    root: Arc<Session>,

    closed: AtomicBool,
    logger: Arc<dyn ProtocolLogger>,
    pump: Mutex<Option<AbortHandle>>,
    events: EventEmitter<()>,
}

impl Connection {
    /// Wrap an open transport. Must be called inside a Tokio runtime.
    pub fn new(transport: impl Transport + 'static, inbound: Inbound) -> Arc<Self> {
        Self::with_logger(transport, inbound, Arc::new(NoopLogger))
    }

    pub fn with_logger(
        transport: impl Transport + 'static,
        inbound: Inbound,
        logger: Arc<dyn ProtocolLogger>,
    ) -> Arc<Self> {
        let connection = Arc::new_cyclic(|this: &Weak<Connection>| {
            let root = Arc::new(Session::new(SessionId::new(), this.clone()));
            let sessions = DashMap::new();
            sessions.insert(SessionId::new(), root.clone());

            Self {
                transport: Box::new(transport),
                last_id: AtomicU64::new(0),
                sessions,
                root,
                closed: AtomicBool::new(false),
                logger,
                pump: Mutex::new(None),
                events: EventEmitter::new(),
            }
        });

        let pump = tokio::spawn(Self::pump(Arc::downgrade(&connection), inbound));
        *connection.pump.lock() = Some(pump.abort_handle());
        connection
    }

    /// Open a WebSocket to `config.url` and wrap it.
    pub async fn connect(config: &ConnectionConfig) -> Result<Arc<Self>> {
        let endpoint = config.endpoint()?;
        tracing::info!("Connecting to {}", endpoint);

        let connecting = WebSocketTransport::connect(endpoint.as_str());
        let (transport, inbound) = tokio::time::timeout(config.connect_timeout(), connecting)
            .await
            .map_err(|_| CDPError::Timeout)??;

        let logger: Arc<dyn ProtocolLogger> = if config.trace_protocol {
            Arc::new(TracingLogger)
        } else {
            Arc::new(NoopLogger)
        };
        Ok(Self::with_logger(transport, inbound, logger))
    }

    /// The root ("browser") session
    pub fn browser_session(&self) -> Arc<Session> {
        self.root.clone()
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Register a session for `id`. The caller guarantees `id` is unique.
    pub fn create_session(self: &Arc<Self>, id: impl Into<SessionId>) -> Arc<Session> {
        let session = Arc::new(Session::new(id.into(), Arc::downgrade(self)));

        if let Some(replaced) = self
            .sessions
            .insert(session.id().to_string(), session.clone())
        {
            tracing::warn!(
                "Session '{}' registered twice, closing the old one",
                replaced.id()
            );
            replaced.on_close();
        }

        // Lost a race with closure: the close path may not have seen us.
        if self.is_closed() {
            self.sessions.remove(session.id());
            session.on_close();
        }
        session
    }

    /// Attach to a target in flat mode and register the resulting session.
    pub async fn attach_to_target(self: &Arc<Self>, target_id: &str) -> Result<Arc<Session>> {
        let result = self
            .root
            .send_or_die(
                "Target.attachToTarget",
                Some(json!({ "targetId": target_id, "flatten": true })),
            )
            .await?;

        let attached: AttachToTargetResult = serde_json::from_value(result)?;
        tracing::debug!(
            "Attached to target {} as session {}",
            target_id,
            attached.session_id
        );
        Ok(self.create_session(attached.session_id))
    }

    /// Close `session`, rejecting its pending commands, and unregister it.
    pub fn dispose_session(&self, session: &Session) {
        if session.id().is_empty() {
            tracing::warn!("Ignoring request to dispose the root session");
            return;
        }

        session.on_close();
        self.sessions.remove_if(session.id(), |_, registered| {
            std::ptr::eq(registered.as_ref(), session)
        });
    }

    /// Tear down every session and close the transport. Idempotent.
    pub fn dispose(&self) {
        self.on_transport_close();
        self.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Runs once, after every session has been closed.
    pub fn on_disconnected<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.on(DISCONNECTED, move |_| handler())
    }

    /// Allocate the next ID and put the command on the wire.
    pub(crate) fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: &str,
    ) -> Result<RequestId> {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = CDPRequest::new(id, method, params, session_id);
        let message = serde_json::to_string(&request)?;

        self.logger.on_send(&message);
        self.transport.send(message);
        Ok(id)
    }

    /// Route one raw inbound message to its session.
    pub(crate) fn on_message(&self, raw: &str) -> Result<()> {
        self.logger.on_receive(raw);
        let message: CDPMessage = serde_json::from_str(raw)?;

        let session_id = message.session_id();
        let session = self
            .session(session_id)
            .ok_or_else(|| CDPError::UnknownSession(session_id.to_string()))?;
        session.on_message(message)
    }

    fn on_transport_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.logger.on_close();

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tracing::debug!("Connection closed, closing {} sessions", sessions.len());

        for session in &sessions {
            session.on_close();
        }
        self.sessions.clear();

        self.events.emit(DISCONNECTED, &());
    }

    async fn pump(connection: Weak<Connection>, mut inbound: Inbound) {
        while let Some(event) = inbound.recv().await {
            let Some(this) = connection.upgrade() else {
                return;
            };

            match event {
                TransportEvent::Message(raw) => {
                    if let Err(e) = this.on_message(&raw) {
                        if e.is_fatal() {
                            tracing::error!("Fatal protocol error, closing connection: {}", e);
                            this.dispose();
                            return;
                        }
                        tracing::warn!("Failed to handle message: {}", e);
                    }
                }
                TransportEvent::Closed => {
                    tracing::info!("Transport closed");
                    this.on_transport_close();
                    return;
                }
            }
        }

        if let Some(this) = connection.upgrade() {
            this.on_transport_close();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryPeer, MemoryTransport};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn connect() -> (Arc<Connection>, MemoryPeer) {
        let (transport, inbound, peer) = MemoryTransport::pair();
        (Connection::new(transport, inbound), peer)
    }

    #[derive(Default)]
    struct RecordingLogger {
        lines: Mutex<Vec<String>>,
    }

    impl ProtocolLogger for RecordingLogger {
        fn on_send(&self, message: &str) {
            self.lines.lock().push(format!("send {}", message));
        }

        fn on_receive(&self, message: &str) {
            self.lines.lock().push(format!("recv {}", message));
        }

        fn on_close(&self) {
            self.lines.lock().push("close".to_string());
        }
    }

    #[tokio::test]
    async fn test_root_session_get_targets() {
        let (connection, mut peer) = connect();
        let root = connection.browser_session();
        assert!(root.id().is_empty());
        assert!(Arc::ptr_eq(&connection.session("").unwrap(), &root));

        let targets = root.send_or_die("Target.getTargets", None);

        let request = peer.recv().await.unwrap();
        assert_eq!(
            request,
            json!({"id": 1, "method": "Target.getTargets", "params": {}})
        );

        peer.deliver(json!({"id": 1, "result": {"targets": []}}));
        assert_eq!(targets.await.unwrap(), json!({"targets": []}));
        assert_eq!(root.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_increase_across_sessions() {
        let (connection, mut peer) = connect();
        let root = connection.browser_session();
        let child = connection.create_session("A1");

        let _a = root.send_or_die("Target.setDiscoverTargets", None);
        let _b = child.send_or_die("Runtime.enable", None);
        let _c = root.send_or_die("Target.getTargets", None);
        let _d = child.send_or_die("Debugger.enable", None);

        let mut ids = Vec::new();
        while let Some(request) = peer.try_recv() {
            ids.push(request["id"].as_u64().unwrap());
        }
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_replies_correlate_by_id_not_order() {
        let (connection, _peer) = connect();
        let session = connection.create_session("A1");

        let first = session.send_or_die("Runtime.evaluate", Some(json!({"expression": "1"})));
        let second = session.send_or_die("Runtime.evaluate", Some(json!({"expression": "2"})));

        connection
            .on_message(&json!({"id": 2, "result": {"value": 2}, "sessionId": "A1"}).to_string())
            .unwrap();
        connection
            .on_message(&json!({"id": 1, "result": {"value": 1}, "sessionId": "A1"}).to_string())
            .unwrap();

        assert_eq!(first.await.unwrap()["value"], 1);
        assert_eq!(second.await.unwrap()["value"], 2);
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending_in_every_session() {
        let (connection, _peer) = connect();
        let child = connection.create_session("A1");

        let enable = child.send_or_die("Debugger.enable", None);
        let targets = connection
            .browser_session()
            .send_or_die("Target.getTargets", None);

        connection.dispose();

        let err = enable.await.unwrap_err();
        assert!(err.to_string().contains("Target closed."));
        assert!(err.to_string().contains("Debugger.enable"));

        let err = targets.await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Protocol error (Target.getTargets): Target closed."
        );

        assert!(connection.is_closed());
        assert!(connection.session("A1").is_none());
        assert!(connection.session("").is_none());
        assert!(child.is_closed());
        assert!(connection.browser_session().is_closed());
        assert_eq!(child.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let recorder = Arc::new(RecordingLogger::default());
        let (transport, inbound, _peer) = MemoryTransport::pair();
        let connection = Connection::with_logger(transport, inbound, recorder.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let _disconnected = connection.on_disconnected(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        connection.dispose();
        connection.dispose();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.lines.lock(), vec!["close".to_string()]);
    }

    #[tokio::test]
    async fn test_remote_close_rejects_pending() {
        let (connection, peer) = connect();
        let session = connection.create_session("A1");
        let pending = session.send_or_die("Debugger.enable", None);

        peer.close();

        let err = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CDPError::TargetClosed { ref method, .. } if method == "Debugger.enable"));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_session_is_fatal() {
        let (connection, _peer) = connect();

        let err = connection
            .on_message(r#"{"method":"Debugger.paused","params":{},"sessionId":"ghost"}"#)
            .unwrap_err();

        assert_eq!(err.to_string(), "unknown session id: ghost");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_unexpected_response_tears_down_connection() {
        let (connection, peer) = connect();
        let session = connection.create_session("A1");
        let pending = session.send_or_die("Debugger.enable", None);

        // No command 99 was ever sent.
        peer.deliver(json!({"id": 99, "result": {}}));

        let err = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("Target closed."));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped() {
        let (connection, mut peer) = connect();
        let targets = connection
            .browser_session()
            .send_or_die("Target.getTargets", None);
        let id = peer.recv().await.unwrap()["id"].clone();

        peer.deliver_raw("{not json");
        peer.deliver(json!({"id": id, "result": {"targets": []}}));

        assert_eq!(targets.await.unwrap(), json!({"targets": []}));
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_dispose_session_unregisters_only_that_session() {
        let (connection, _peer) = connect();
        let a1 = connection.create_session("A1");
        let a2 = connection.create_session("A2");
        let pending = a1.send_or_die("Debugger.enable", None);

        connection.dispose_session(&a1);

        assert!(pending.await.unwrap_err().to_string().contains("Target closed."));
        assert!(connection.session("A1").is_none());
        assert!(Arc::ptr_eq(&connection.session("A2").unwrap(), &a2));
        assert!(!a2.is_closed());

        connection.dispose_session(&connection.browser_session());
        assert!(!connection.browser_session().is_closed());
    }

    #[tokio::test]
    async fn test_create_session_after_close_is_closed() {
        let (connection, _peer) = connect();
        connection.dispose();

        let late = connection.create_session("late");
        assert!(late.is_closed());
        assert!(connection.session("late").is_none());
    }

    #[tokio::test]
    async fn test_attach_to_target_registers_session() {
        let (connection, mut peer) = connect();

        let attach = tokio::spawn({
            let connection = connection.clone();
            async move { connection.attach_to_target("T1").await }
        });

        let request = peer.recv().await.unwrap();
        assert_eq!(request["method"], "Target.attachToTarget");
        assert_eq!(request["params"], json!({"targetId": "T1", "flatten": true}));
        peer.deliver(json!({"id": request["id"], "result": {"sessionId": "S1"}}));

        let session = attach.await.unwrap().unwrap();
        assert_eq!(session.id(), "S1");
        assert!(Arc::ptr_eq(&connection.session("S1").unwrap(), &session));
    }

    #[tokio::test]
    async fn test_logger_sees_wire_traffic() {
        let recorder = Arc::new(RecordingLogger::default());
        let (transport, inbound, _peer) = MemoryTransport::pair();
        let connection = Connection::with_logger(transport, inbound, recorder.clone());

        let _version = connection
            .browser_session()
            .send_or_die("Browser.getVersion", None);
        connection
            .on_message(r#"{"id":1,"result":{}}"#)
            .unwrap();

        let lines = recorder.lines.lock().clone();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("send ") && lines[0].contains("Browser.getVersion"));
        assert_eq!(lines[1], r#"recv {"id":1,"result":{}}"#);
    }

    #[tokio::test]
    async fn test_dropping_connection_rejects_pending() {
        let (connection, _peer) = connect();
        let session = connection.create_session("A1");
        let pending = session.send_or_die("Debugger.enable", None);

        drop(connection);

        assert!(pending.await.unwrap_err().to_string().contains("Target closed."));
        assert!(session.is_closed());
    }
}
