//! Envelope types for the Courier protocol.
//!
//! Envelopes are the unit of exchange on a connection. Clients send
//! [`ClientEnvelope`]s, the server answers with [`ServerEnvelope`]s. The
//! `payload` field is an opaque string the relay never interprets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message kinds.
///
/// Client-originated: `message`, `typing`, `read`, `presence`, `ping`.
/// Server-originated: `delivery`, `error`, `status`, `pong`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Encrypted chat payload.
    Message,
    /// Typing indicator.
    Typing,
    /// Read receipt.
    Read,
    /// Own presence status update.
    Presence,
    /// Application-level keepalive.
    Ping,
    /// Acknowledgment that a message was accepted for relay.
    Delivery,
    /// Protocol error report.
    Error,
    /// Informational server frame.
    Status,
    /// Reply to `ping`.
    Pong,
    /// Any kind string this server does not understand.
    #[serde(other)]
    #[default]
    Unknown,
}

impl MessageKind {
    /// Kinds a client is allowed to send.
    #[must_use]
    pub fn is_client_kind(self) -> bool {
        matches!(
            self,
            MessageKind::Message
                | MessageKind::Typing
                | MessageKind::Read
                | MessageKind::Presence
                | MessageKind::Ping
        )
    }

    /// Whether a relay of this kind survives the recipient being offline.
    ///
    /// Only chat messages are queued; typing, read and presence are
    /// ephemeral and dropped when nobody is connected.
    #[must_use]
    pub fn is_persistable(self) -> bool {
        self == MessageKind::Message
    }

    /// Kinds that must carry a non-empty `to`.
    #[must_use]
    pub fn requires_recipient(self) -> bool {
        matches!(
            self,
            MessageKind::Message | MessageKind::Typing | MessageKind::Read
        )
    }

    /// The wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Message => "message",
            MessageKind::Typing => "typing",
            MessageKind::Read => "read",
            MessageKind::Presence => "presence",
            MessageKind::Ping => "ping",
            MessageKind::Delivery => "delivery",
            MessageKind::Error => "error",
            MessageKind::Status => "status",
            MessageKind::Pong => "pong",
            MessageKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Message kind. A missing `type` reads as [`MessageKind::Unknown`].
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Target user ID. Required for `message`, `typing` and `read`.
    #[serde(default)]
    pub to: String,
    /// Opaque, client-encrypted content.
    #[serde(default)]
    pub payload: String,
}

impl ClientEnvelope {
    /// Create a client envelope.
    #[must_use]
    pub fn new(kind: MessageKind, to: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            kind,
            to: to.into(),
            payload: payload.into(),
        }
    }
}

/// What the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sending user ID. Omitted for system frames.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    /// Opaque content. Omitted when not applicable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
    /// Generation time in UTC.
    pub timestamp: DateTime<Utc>,
    /// Message identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
}

/// Payload of an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code, one of the `codes` constants.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Error codes carried in [`ErrorBody::code`].
pub mod codes {
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
    pub const MISSING_RECIPIENT: &str = "MISSING_RECIPIENT";
}

/// Relayed payload of a `typing` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub user_id: String,
    pub is_typing: bool,
}

/// Relayed payload of a `read` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: String,
    pub read_at: DateTime<Utc>,
}

/// Payload of the `status` frame sent when a connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub user_id: String,
    pub device_id: String,
    pub connection_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        let kind: MessageKind = serde_json::from_str("\"typing\"").unwrap();
        assert_eq!(kind, MessageKind::Typing);
        assert_eq!(serde_json::to_string(&MessageKind::Delivery).unwrap(), "\"delivery\"");
        assert_eq!(MessageKind::Pong.to_string(), "pong");
    }

    #[test]
    fn test_unrecognized_kind_is_unknown() {
        let kind: MessageKind = serde_json::from_str("\"shout\"").unwrap();
        assert_eq!(kind, MessageKind::Unknown);
        assert!(!kind.is_client_kind());
    }

    #[test]
    fn test_kind_classes() {
        assert!(MessageKind::Message.is_persistable());
        assert!(!MessageKind::Typing.is_persistable());
        assert!(!MessageKind::Read.is_persistable());
        assert!(!MessageKind::Presence.is_persistable());

        assert!(MessageKind::Read.requires_recipient());
        assert!(!MessageKind::Ping.requires_recipient());
        assert!(!MessageKind::Delivery.is_client_kind());
    }

    #[test]
    fn test_server_envelope_omits_empty_fields() {
        let env = ServerEnvelope {
            kind: MessageKind::Pong,
            from: String::new(),
            payload: String::new(),
            timestamp: Utc::now(),
            message_id: "m-1".into(),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("from").is_none());
        assert!(json.get("payload").is_none());
        assert_eq!(json["type"], "pong");
        assert_eq!(json["message_id"], "m-1");
    }
}
