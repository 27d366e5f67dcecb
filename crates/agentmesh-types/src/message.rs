//! Message envelopes for the agentmesh message bus.
//!
//! A message is either directed (recipient set) or broadcast (recipient
//! absent). Request/response pairs share a correlation ID.

use crate::error::MeshResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of message carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Ask an agent to perform a task.
    TaskRequest,
    /// Answer to a task request.
    TaskResponse,
    /// Progress or state report.
    StatusUpdate,
    /// Error report.
    Error,
    /// Workflow lifecycle notification.
    WorkflowEvent,
    /// An agent joined the bus.
    Registration,
    /// Service discovery query or answer.
    Discovery,
    /// Shared context between agents.
    ContextShare,
    /// Liveness ping.
    Heartbeat,
}

impl MessageType {
    /// Snake-case name, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskRequest => "task_request",
            Self::TaskResponse => "task_response",
            Self::StatusUpdate => "status_update",
            Self::Error => "error",
            Self::WorkflowEvent => "workflow_event",
            Self::Registration => "registration",
            Self::Discovery => "discovery",
            Self::ContextShare => "context_share",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID.
    pub id: MessageId,
    /// The agent that sent this message.
    pub sender_id: String,
    /// Target agent. `None` means broadcast.
    pub recipient_id: Option<String>,
    /// Message kind; subscriptions are indexed by it.
    pub message_type: MessageType,
    /// Arbitrary structured payload.
    pub payload: HashMap<String, serde_json::Value>,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Links a response to its request.
    pub correlation_id: Option<String>,
    /// The message must not be delivered after this instant.
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Create a broadcast message.
    pub fn new(
        sender_id: impl Into<String>,
        message_type: MessageType,
        payload: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender_id: sender_id.into(),
            recipient_id: None,
            message_type,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
            expires_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Address the message to a single agent.
    pub fn to(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    /// Set the correlation ID for request-response linking.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Expire the message `ttl` after its creation timestamp. A ttl too large
    /// to represent leaves it without expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl));
        self
    }

    /// Set an absolute expiry.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the message has passed its expiry.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the message is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// True when no recipient is set.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// Build a `TaskResponse` addressed back to this message's sender,
    /// carrying the same correlation ID.
    pub fn reply(
        &self,
        sender_id: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Self {
        let mut response =
            Message::new(sender_id, MessageType::TaskResponse, payload).to(self.sender_id.clone());
        response.correlation_id = self.correlation_id.clone();
        response
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> MeshResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(json: &str) -> MeshResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_message_creation() {
        let msg = Message::new("agent-a", MessageType::StatusUpdate, HashMap::new());
        assert_eq!(msg.sender_id, "agent-a");
        assert!(msg.is_broadcast());
        assert!(msg.correlation_id.is_none());
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_directed_message() {
        let msg = Message::new("a", MessageType::TaskRequest, HashMap::new()).to("b");
        assert_eq!(msg.recipient_id.as_deref(), Some("b"));
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn test_expiry() {
        let msg = Message::new("a", MessageType::Heartbeat, HashMap::new())
            .with_expiry(Utc::now() - chrono::Duration::seconds(1));
        assert!(msg.is_expired());

        let fresh =
            Message::new("a", MessageType::Heartbeat, HashMap::new()).with_ttl(Duration::from_secs(60));
        assert!(!fresh.is_expired());
        assert!(fresh.is_expired_at(fresh.timestamp + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() {
        let msg = Message::new("a", MessageType::Heartbeat, HashMap::new())
            .with_ttl(Duration::from_secs(9_000_000_000_000));
        assert!(msg.expires_at.is_none());
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_reply_links_correlation() {
        let request = Message::new("requester", MessageType::TaskRequest, HashMap::new())
            .to("worker")
            .with_correlation("corr-1");
        let response = request.reply("worker", payload(&[("ok", json!(true))]));
        assert_eq!(response.message_type, MessageType::TaskResponse);
        assert_eq!(response.recipient_id.as_deref(), Some("requester"));
        assert_eq!(response.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(response.payload["ok"], json!(true));
    }

    #[test]
    fn test_json_wire_shape() {
        let msg = Message::new("a", MessageType::ContextShare, payload(&[("k", json!("v"))]))
            .with_correlation("c-9");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["message_type"], json!("context_share"));
        assert_eq!(value["recipient_id"], serde_json::Value::Null);
        assert_eq!(value["expires_at"], serde_json::Value::Null);
        // ISO-8601 timestamp
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());

        let back = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(Message::from_json("{not json").is_err());
    }

    #[test]
    fn test_msgpack_round_trip() {
        let msg = Message::new("a", MessageType::TaskRequest, payload(&[("task", json!("index"))]))
            .to("b")
            .with_ttl(Duration::from_secs(30))
            .with_metadata("origin", json!("cli"));
        let blob = rmp_serde::to_vec_named(&msg).unwrap();
        let back: Message = rmp_serde::from_slice(&blob).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_message_type_display_matches_serde() {
        for ty in [
            MessageType::TaskRequest,
            MessageType::Registration,
            MessageType::Heartbeat,
        ] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{ty}\""));
        }
    }
}
