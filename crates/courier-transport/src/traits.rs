//! Connection abstraction traits for Courier.
//!
//! A physical connection is an already-upgraded, ordered, reliable,
//! bidirectional stream. The relay drives it from two tasks at once, so
//! every connection splits into a [`ConnectionReader`] and a
//! [`ConnectionWriter`].

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Identifies one accepted connection for its whole lifetime.
///
/// The hub compares these to tell a device's current connection from one
/// it has already replaced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failures on either half of a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is closed, locally or by the peer.
    #[error("Connection closed")]
    Closed,

    /// Inbound message over the configured limit.
    #[error("Inbound message of {size} bytes exceeds limit of {limit}")]
    Oversized { size: usize, limit: usize },

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),
}

/// One complete inbound unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text message.
    Text(Bytes),
    /// A binary message.
    Binary(Bytes),
    /// A transport-level liveness signal (pong from the peer, or a peer ping).
    Heartbeat,
}

/// The receiving half of a connection.
#[async_trait]
pub trait ConnectionReader: Send {
    /// Receive the next inbound unit.
    ///
    /// Returns `None` if the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// The sending half of a connection.
#[async_trait]
pub trait ConnectionWriter: Send {
    /// Send one encoded envelope.
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Send a transport-level liveness ping.
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An accepted connection that has not been split yet.
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned reader and writer halves.
    fn split(self: Box<Self>) -> (Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_uuids() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert_eq!(a.to_string(), a.as_str());
    }

    #[test]
    fn test_error_messages() {
        let err = TransportError::Oversized { size: 10, limit: 4 };
        assert_eq!(err.to_string(), "Inbound message of 10 bytes exceeds limit of 4");
        assert_eq!(TransportError::Closed.to_string(), "Connection closed");
    }
}
