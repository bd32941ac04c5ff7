//! # courier-protocol
//!
//! Wire protocol definitions for the Courier relay.
//!
//! Clients and the server exchange JSON envelopes. The relay routes on the
//! `type`, `to` and `from` fields only; the `payload` is encrypted by the
//! clients and treated as an opaque string.
//!
//! ## Kinds
//!
//! - `message` / `typing` / `read` / `presence` / `ping` - sent by clients
//! - `delivery` / `error` / `status` / `pong` - sent by the server
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, MessageKind};
//!
//! let inbound = codec::decode(br#"{"type":"message","to":"u1","payload":"Zm9v"}"#).unwrap();
//! assert_eq!(inbound.kind, MessageKind::Message);
//!
//! let outbound = codec::encode_server(MessageKind::Message, "u2", &inbound.payload).unwrap();
//! let decoded = codec::decode_server(&outbound).unwrap();
//! assert_eq!(decoded.from, "u2");
//! ```

pub mod codec;
pub mod envelope;
pub mod id;

pub use codec::{decode, decode_server, encode_error, encode_server, ProtocolError};
pub use envelope::{
    codes, ClientEnvelope, ErrorBody, MessageKind, ReadReceipt, ServerEnvelope, TypingIndicator,
    Welcome,
};
pub use id::{generate_connection_id, generate_message_id, MessageId};
