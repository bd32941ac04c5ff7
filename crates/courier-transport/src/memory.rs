//! In-memory connection pair.
//!
//! [`pair`] returns a server-side [`MemoryConnection`] and the matching
//! client-side [`MemoryPeer`]. Used by tests and benchmarks to drive
//! connection workers without sockets.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::traits::{
    Connection, ConnectionId, ConnectionReader, ConnectionWriter, Inbound, TransportError,
};

/// What the server side wrote to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// An encoded envelope.
    Frame(Bytes),
    /// A liveness ping.
    Ping,
    /// The server closed the connection.
    Closed,
}

/// Create a connected in-memory pair with the given per-direction capacity.
#[must_use]
pub fn pair(capacity: usize) -> (MemoryConnection, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let conn = MemoryConnection {
        id: ConnectionId::generate(),
        inbound: inbound_rx,
        outbound: outbound_tx,
    };
    let peer = MemoryPeer {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
    };
    (conn, peer)
}

/// Server side of an in-memory pair.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<PeerEvent>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>) {
        let reader = MemoryReader {
            inbound: self.inbound,
        };
        let writer = MemoryWriter {
            outbound: self.outbound,
            closed: false,
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct MemoryReader {
    inbound: mpsc::Receiver<Inbound>,
}

#[async_trait]
impl ConnectionReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        Ok(self.inbound.recv().await)
    }
}

struct MemoryWriter {
    outbound: mpsc::Sender<PeerEvent>,
    closed: bool,
}

impl MemoryWriter {
    async fn push(&mut self, event: PeerEvent) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(event)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl ConnectionWriter for MemoryWriter {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        trace!(size = data.len(), "Memory write");
        self.push(PeerEvent::Frame(data)).await
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.push(PeerEvent::Ping).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        // Peer may be gone already.
        let _ = self.outbound.send(PeerEvent::Closed).await;
        self.closed = true;
        Ok(())
    }
}

/// Client side of an in-memory pair.
pub struct MemoryPeer {
    inbound: Option<mpsc::Sender<Inbound>>,
    outbound: mpsc::Receiver<PeerEvent>,
}

impl MemoryPeer {
    /// Send a text message to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone or this peer hung up.
    pub async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.push(Inbound::Text(Bytes::copy_from_slice(text.as_bytes())))
            .await
    }

    /// Send raw binary data to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone or this peer hung up.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.push(Inbound::Binary(data.into())).await
    }

    /// Answer a liveness ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone or this peer hung up.
    pub async fn heartbeat(&self) -> Result<(), TransportError> {
        self.push(Inbound::Heartbeat).await
    }

    /// Receive the next event written by the server.
    ///
    /// Returns `None` once the server side has been dropped.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.outbound.recv().await
    }

    /// Receive the next envelope, skipping pings.
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.outbound.recv().await? {
                PeerEvent::Frame(data) => return Some(data),
                PeerEvent::Ping => continue,
                PeerEvent::Closed => return None,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.outbound.try_recv().ok()
    }

    /// Hang up: the server's reader sees an orderly close.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    async fn push(&self, inbound: Inbound) -> Result<(), TransportError> {
        let tx = self.inbound.as_ref().ok_or(TransportError::Closed)?;
        tx.send(inbound)
            .await
            .map_err(|_| TransportError::Closed)
    }
}
