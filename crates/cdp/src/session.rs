//! CDP Session - one debug target on a shared connection
//!
//! All sessions share the connection's transport. A session only owns its
//! pending commands and its event subscribers; once the back-reference to
//! the connection is cleared the session is closed for good.

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::error::{CallSite, CDPError, Result};
use crate::events::{EventEmitter, Subscription};
use crate::protocol::{CDPMessage, RequestId, SessionId};

/// Event name for the close notification, on sessions and connections
pub(crate) const DISCONNECTED: &str = "disconnected";

/// Settles when the reply arrives or the session closes
pub type CommandFuture = BoxFuture<'static, Result<Value>>;

struct PendingCommand {
    method: String,
    call_site: CallSite,
    responder: oneshot::Sender<Result<Value>>,
}

impl PendingCommand {
    fn settle(self, outcome: Result<Value>) {
        let _ = self.responder.send(outcome); // Caller stopped waiting
    }
}

struct SessionState {
    /// `None` once closed
    connection: Option<Weak<Connection>>,
    pending: BTreeMap<RequestId, PendingCommand>,
}

/// CDP Session bound to a single target (or the browser, for the root)
pub struct Session {
    id: SessionId,
    state: Mutex<SessionState>,
    events: EventEmitter<Value>,
    lifecycle: EventEmitter<()>,
}

impl Session {
    pub(crate) fn new(id: SessionId, connection: Weak<Connection>) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                connection: Some(connection),
                pending: BTreeMap::new(),
            }),
            events: EventEmitter::new(),
            lifecycle: EventEmitter::new(),
        }
    }

    /// Session ID; empty for the root session
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().connection.is_none()
    }

    /// Commands sent and not yet settled
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.state.lock().connection.as_ref().and_then(Weak::upgrade)
    }

    /// Send a command whose failure doesn't matter to the caller.
    ///
    /// Yields `None` instead of an error.
    #[track_caller]
    pub fn send(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> impl Future<Output = Option<Value>> + Send + 'static {
        let command = self.send_or_die(method, params);
        async move {
            match command.await {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::debug!("Ignoring failed command: {}", e);
                    None
                }
            }
        }
    }

    /// Send a command and surface any failure.
    ///
    /// The ID is allocated and the command written before this returns; the
    /// future only waits for the outcome. Errors carry the caller's location.
    #[track_caller]
    pub fn send_or_die(&self, method: &str, params: Option<Value>) -> CommandFuture {
        let call_site = CallSite::capture();

        match self.register(method, params, call_site) {
            Ok(reply) => {
                let method = method.to_string();
                async move {
                    reply
                        .await
                        .unwrap_or_else(|_| Err(CDPError::TargetClosed { method, call_site }))
                }
                .boxed()
            }
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }

    fn register(
        &self,
        method: &str,
        params: Option<Value>,
        call_site: CallSite,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        // Held across send + insert so a reply or a close can't slip between.
        let mut state = self.state.lock();
        let Some(connection) = state.connection.as_ref().and_then(Weak::upgrade) else {
            return Err(CDPError::SessionClosed {
                method: method.to_string(),
                call_site,
            });
        };

        let registered = connection.send(method, params, &self.id).map(|id| {
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                id,
                PendingCommand {
                    method: method.to_string(),
                    call_site,
                    responder: tx,
                },
            );
            rx
        });

        // Dropping the last connection handle closes this session.
        drop(state);
        drop(connection);
        registered
    }

    /// Ask the browser to detach this target. Local state is cleared later,
    /// when the connection closes the session.
    #[track_caller]
    pub fn detach(&self) -> CommandFuture {
        let call_site = CallSite::capture();

        match self.connection() {
            Some(connection) if !self.is_closed() => connection.browser_session().send_or_die(
                "Target.detachFromTarget",
                Some(json!({ "sessionId": self.id })),
            ),
            _ => future::ready(Err(CDPError::SessionClosed {
                method: "Target.detachFromTarget".to_string(),
                call_site,
            }))
            .boxed(),
        }
    }

    /// Close this session locally and unregister it from its connection.
    pub fn dispose(&self) {
        if let Some(connection) = self.connection() {
            connection.dispose_session(self);
        }
    }

    /// Subscribe to a protocol event, e.g. "Debugger.paused"
    pub fn on<F>(&self, method: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.events.on(method, handler)
    }

    pub fn on_disconnected<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.lifecycle.on(DISCONNECTED, move |_| handler())
    }

    /// Params of the next `method` event, or `None` if the session closes first.
    pub fn wait_for_event(
        &self,
        method: &str,
    ) -> impl Future<Output = Option<Value>> + Send + 'static {
        let (tx, rx) = oneshot::channel::<Option<Value>>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let event_tx = tx.clone();
        let on_event = self.on(method, move |params| {
            if let Some(tx) = event_tx.lock().take() {
                let _ = tx.send(Some(params.clone()));
            }
        });
        let on_close = self.on_disconnected(move || {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(None);
            }
        });
        let closed = self.is_closed();

        async move {
            let params = if closed { None } else { rx.await.ok().flatten() };
            drop((on_event, on_close));
            params
        }
    }

    pub(crate) fn on_message(&self, message: CDPMessage) -> Result<()> {
        match message {
            CDPMessage::Response(response) => {
                let command = self
                    .state
                    .lock()
                    .pending
                    .remove(&response.id)
                    .ok_or(CDPError::UnexpectedResponse(response.id))?;

                let outcome = match response.error {
                    Some(error) => Err(CDPError::Protocol {
                        method: command.method.clone(),
                        code: error.code,
                        message: error.message,
                        data: error
                            .data
                            .as_ref()
                            .map(Value::to_string)
                            .unwrap_or_else(|| "null".to_string()),
                        call_site: command.call_site,
                    }),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                command.settle(outcome);
            }
            CDPMessage::Event(event) => {
                self.events.emit(&event.method, &event.params);
            }
        }
        Ok(())
    }

    pub(crate) fn on_close(&self) {
        let pending = {
            let mut state = self.state.lock();
            if state.connection.take().is_none() {
                return;
            }
            std::mem::take(&mut state.pending)
        };

        if !pending.is_empty() {
            tracing::debug!(
                "Session '{}' closed with {} pending commands",
                self.id,
                pending.len()
            );
        }
        for command in pending.into_values() {
            let err = CDPError::TargetClosed {
                method: command.method.clone(),
                call_site: command.call_site,
            };
            command.settle(Err(err));
        }

        self.lifecycle.emit(DISCONNECTED, &());
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
