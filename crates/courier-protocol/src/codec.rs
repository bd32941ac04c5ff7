//! Codec for encoding and decoding Courier envelopes.
//!
//! Envelopes travel as UTF-8 JSON text, one envelope per transport message.

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;

use crate::envelope::{ClientEnvelope, ErrorBody, MessageKind, ServerEnvelope};
use crate::id::generate_message_id;

/// Maximum inbound envelope size (512 KiB).
pub const MAX_ENVELOPE_SIZE: usize = 512 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    TooLarge(usize),

    /// Input was empty.
    #[error("Empty envelope")]
    Empty,

    /// JSON decoding error (malformed structure or wrong field types).
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Decode a client envelope.
///
/// The payload is never inspected. Unrecognized kinds decode successfully as
/// [`MessageKind::Unknown`] so the caller can answer with `UNKNOWN_TYPE`.
///
/// # Errors
///
/// Returns an error if the data is empty, too large, or not a valid envelope.
pub fn decode(data: &[u8]) -> Result<ClientEnvelope, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }
    serde_json::from_slice(data).map_err(ProtocolError::Decode)
}

/// Decode a server envelope. Used by clients and tests.
///
/// # Errors
///
/// Returns an error if the data is not a valid server envelope.
pub fn decode_server(data: &[u8]) -> Result<ServerEnvelope, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::Empty);
    }
    serde_json::from_slice(data).map_err(ProtocolError::Decode)
}

/// Encode a server envelope stamped with the current time and a fresh ID.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_server(kind: MessageKind, from: &str, payload: &str) -> Result<Bytes, ProtocolError> {
    encode_server_with_id(kind, from, payload, &generate_message_id())
}

/// Encode a server envelope with a caller-supplied message ID.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_server_with_id(
    kind: MessageKind,
    from: &str,
    payload: &str,
    message_id: &str,
) -> Result<Bytes, ProtocolError> {
    let envelope = ServerEnvelope {
        kind,
        from: from.to_string(),
        payload: payload.to_string(),
        timestamp: Utc::now(),
        message_id: message_id.to_string(),
    };
    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(ProtocolError::Encode)
}

/// Encode an `error` frame carrying `{code, message}` as its payload.
#[must_use]
pub fn encode_error(code: &str, message: &str) -> Bytes {
    let body = ErrorBody {
        code: code.to_string(),
        message: message.to_string(),
    };
    // Both structs contain only strings and a timestamp; serialization cannot fail.
    let payload = serde_json::to_string(&body).unwrap_or_default();
    encode_server(MessageKind::Error, "", &payload).unwrap_or_default()
}

/// Parse the `{code, message}` body of an `error` frame.
///
/// # Errors
///
/// Returns an error if the payload is not an error body.
pub fn decode_error_body(envelope: &ServerEnvelope) -> Result<ErrorBody, ProtocolError> {
    serde_json::from_str(&envelope.payload).map_err(ProtocolError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::codes;

    #[test]
    fn test_decode_client_envelope() {
        let env = decode(br#"{"type":"message","to":"u1","payload":"Zm9v"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Message);
        assert_eq!(env.to, "u1");
        assert_eq!(env.payload, "Zm9v");
    }

    #[test]
    fn test_decode_defaults_optional_fields() {
        let env = decode(br#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Ping);
        assert!(env.to.is_empty());
        assert!(env.payload.is_empty());
    }

    #[test]
    fn test_decode_unknown_kind() {
        let env = decode(br#"{"type":"dance","to":"u1"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Unknown);
    }

    #[test]
    fn test_decode_missing_kind_is_unknown() {
        let env = decode(br#"{"to":"u1","payload":"x"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Unknown);
        assert_eq!(env.to, "u1");
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode(b""), Err(ProtocolError::Empty)));
        assert!(matches!(decode(b"not json"), Err(ProtocolError::Decode(_))));
        assert!(matches!(
            decode(br#"{"type":"message","to":42}"#),
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(decode(br#"{"type":"#), Err(ProtocolError::Decode(_))));
        assert!(matches!(decode(br#"{"type":7}"#), Err(ProtocolError::Decode(_))));
        assert!(matches!(decode(b"[1,2]"), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_too_large() {
        let big = vec![b' '; MAX_ENVELOPE_SIZE + 1];
        assert!(matches!(decode(&big), Err(ProtocolError::TooLarge(_))));
    }

    #[test]
    fn test_server_roundtrip() {
        let encoded = encode_server(MessageKind::Message, "u2", "Zm9v").unwrap();
        let decoded = decode_server(&encoded).unwrap();
        assert_eq!(decoded.kind, MessageKind::Message);
        assert_eq!(decoded.from, "u2");
        assert_eq!(decoded.payload, "Zm9v");
        assert!(!decoded.message_id.is_empty());
    }

    #[test]
    fn test_fresh_ids_per_encode() {
        let a = decode_server(&encode_server(MessageKind::Pong, "", "").unwrap()).unwrap();
        let b = decode_server(&encode_server(MessageKind::Pong, "", "").unwrap()).unwrap();
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_encode_with_id() {
        let encoded = encode_server_with_id(MessageKind::Delivery, "", "m-7", "m-7").unwrap();
        let decoded = decode_server(&encoded).unwrap();
        assert_eq!(decoded.message_id, "m-7");
        assert_eq!(decoded.payload, "m-7");
        assert!(decoded.from.is_empty());
    }

    #[test]
    fn test_error_frame_shape() {
        let encoded = encode_error(codes::PARSE_ERROR, "Invalid message format");
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["type"], "error");
        assert!(value.get("from").is_none());

        let envelope = decode_server(&encoded).unwrap();
        let body = decode_error_body(&envelope).unwrap();
        assert_eq!(body.code, "PARSE_ERROR");
        assert_eq!(body.message, "Invalid message format");
    }
}
