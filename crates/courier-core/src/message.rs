//! Internal relay types.
//!
//! A [`RelayEnvelope`] is what a connection worker hands to the hub once a
//! client frame has been validated. It is also the record persisted for
//! offline recipients.

use bytes::Bytes;
use courier_protocol::codec::{encode_server_with_id, ProtocolError};
use courier_protocol::{generate_message_id, MessageKind};
use serde::{Deserialize, Serialize};

/// A validated frame on its way to a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Sending user ID.
    pub from: String,
    /// Recipient user ID.
    pub to: String,
    /// Sending device, if known.
    #[serde(default)]
    pub device_id: String,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Opaque payload, forwarded unchanged.
    pub payload: String,
    /// Stable identifier shared by the relayed frame, the acknowledgment
    /// and message metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl RelayEnvelope {
    /// Create a relay envelope without a device or message ID.
    #[must_use]
    pub fn new(
        kind: MessageKind,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            device_id: String::new(),
            kind,
            payload: payload.into(),
            message_id: None,
        }
    }

    /// Attach the sending device.
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Attach a message ID.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Encode as the frame recipients receive.
    ///
    /// Envelopes without a message ID get a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        match &self.message_id {
            Some(id) => encode_server_with_id(self.kind, &self.from, &self.payload, id),
            None => encode_server_with_id(self.kind, &self.from, &self.payload, &generate_message_id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::decode_server;

    #[test]
    fn test_encode_keeps_message_id() {
        let env = RelayEnvelope::new(MessageKind::Message, "u2", "u1", "Zm9v")
            .with_device("d1")
            .with_message_id("m-1");
        let frame = decode_server(&env.encode().unwrap()).unwrap();

        assert_eq!(frame.kind, MessageKind::Message);
        assert_eq!(frame.from, "u2");
        assert_eq!(frame.payload, "Zm9v");
        assert_eq!(frame.message_id, "m-1");
    }

    #[test]
    fn test_encode_assigns_message_id() {
        let env = RelayEnvelope::new(MessageKind::Typing, "u2", "u1", "{}");
        let frame = decode_server(&env.encode().unwrap()).unwrap();
        assert!(!frame.message_id.is_empty());
    }

    #[test]
    fn test_persisted_form() {
        let env = RelayEnvelope::new(MessageKind::Message, "u2", "u1", "x").with_message_id("m-9");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["message_id"], "m-9");

        let back: RelayEnvelope =
            serde_json::from_str(r#"{"from":"a","to":"b","type":"message","payload":"p"}"#).unwrap();
        assert!(back.device_id.is_empty());
        assert!(back.message_id.is_none());
    }
}
