//! CDP Protocol Types
//!
//! Wire shapes for the flattened session protocol. Every message may carry
//! a `sessionId`; absent or empty means the root (browser) session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command ID - monotonically increasing per connection
pub type RequestId = u64;

/// Target ID from the remote runtime
pub type TargetId = String;

/// Session ID for attached targets. Empty for the root session.
pub type SessionId = String;

/// Command sent to the remote runtime
#[derive(Debug, Clone, Serialize)]
pub struct CDPRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl CDPRequest {
    pub fn new(id: RequestId, method: &str, params: Option<Value>, session_id: &str) -> Self {
        Self {
            id,
            method: method.to_string(),
            params: params.unwrap_or_else(|| Value::Object(Default::default())),
            session_id: (!session_id.is_empty()).then(|| session_id.to_string()),
        }
    }
}

/// Reply to a command
#[derive(Debug, Clone, Deserialize)]
pub struct CDPResponse {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ProtocolErrorPayload>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Structured error carried by a failed reply
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolErrorPayload {
    #[serde(default)]
    pub code: Option<i64>,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Unsolicited event (no command ID)
#[derive(Debug, Clone, Deserialize)]
pub struct CDPEvent {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Inbound message: a reply or an event
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CDPMessage {
    Response(CDPResponse),
    Event(CDPEvent),
}

impl CDPMessage {
    /// Owning session, with absent normalized to the root's empty id.
    pub fn session_id(&self) -> &str {
        let id = match self {
            CDPMessage::Response(response) => response.session_id.as_deref(),
            CDPMessage::Event(event) => event.session_id.as_deref(),
        };
        id.unwrap_or("")
    }
}

/// Target Info from Target.getTargetInfo / Target.getTargets
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetInfo {
    #[serde(rename = "targetId")]
    pub target_id: TargetId,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    pub attached: bool,
}

/// Result of Target.attachToTarget
#[derive(Debug, Clone, Deserialize)]
pub struct AttachToTargetResult {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}
