//! Protocol message definitions
//!
//! Defines the JSON envelope pushed by the election-updates server and the
//! control messages the client sends back. Every frame is a single JSON object
//! carried in a WebSocket text frame.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Types
// ============================================================================

/// Known message types, with a fallback for anything the server adds later
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Client keepalive
    Ping,
    /// Server keepalive acknowledgement
    Pong,
    /// A guarantee (pledged voter) record changed
    GuaranteeUpdate,
    /// An attendance record changed
    AttendanceUpdate,
    /// Vote counts or election results changed
    VotingUpdate,
    /// A dashboard aggregate changed
    DashboardUpdate,
    /// Any type this client does not know about
    Unknown(String),
}

impl MessageType {
    /// The wire name of this type
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::GuaranteeUpdate => "guarantee_update",
            MessageType::AttendanceUpdate => "attendance_update",
            MessageType::VotingUpdate => "voting_update",
            MessageType::DashboardUpdate => "dashboard_update",
            MessageType::Unknown(name) => name,
        }
    }
}

impl From<&str> for MessageType {
    fn from(name: &str) -> Self {
        match name {
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "guarantee_update" => MessageType::GuaranteeUpdate,
            "attendance_update" => MessageType::AttendanceUpdate,
            "voting_update" => MessageType::VotingUpdate,
            "dashboard_update" => MessageType::DashboardUpdate,
            other => MessageType::Unknown(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        MessageType::from(name.as_str())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain action carried by update messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    Created,
    Updated,
    Deleted,
    /// Any action string this client does not recognise
    #[serde(other)]
    Other,
}

/// Message timestamp: epoch milliseconds on outbound pings, free text from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

// ============================================================================
// Message Envelope
// ============================================================================

/// A single protocol message, inbound or outbound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type, used for routing
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Domain action for update messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<UpdateAction>,
    /// Free-form payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Which dashboard a dashboard_update refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_type: Option<String>,
}

impl Message {
    /// Create a bare message of the given type
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            action: None,
            data: None,
            timestamp: None,
            dashboard_type: None,
        }
    }

    /// Create a keepalive ping stamped with the current time
    pub fn ping() -> Self {
        Self {
            timestamp: Some(Timestamp::Millis(Utc::now().timestamp_millis())),
            ..Self::new(MessageType::Ping)
        }
    }

    /// Create an update message with an action and payload
    pub fn update(kind: MessageType, action: UpdateAction, data: Value) -> Self {
        Self {
            action: Some(action),
            data: Some(data),
            ..Self::new(kind)
        }
    }

    /// Set the dashboard type
    pub fn with_dashboard_type(mut self, dashboard_type: impl Into<String>) -> Self {
        self.dashboard_type = Some(dashboard_type.into());
        self
    }

    /// Whether this is a heartbeat acknowledgement
    pub fn is_pong(&self) -> bool {
        self.kind == MessageType::Pong
    }

    /// Look up a field of the payload object
    pub fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref()?.get(key)
    }

    /// Read a payload identifier as a string; numeric ids are stringified
    pub fn data_id(&self, key: &str) -> Option<String> {
        match self.data_field(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Parse a message from a text frame
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(ProtocolError::InvalidMessage(
                "frame is not a JSON object".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
