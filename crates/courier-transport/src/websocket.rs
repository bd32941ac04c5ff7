//! WebSocket connection implementation.
//!
//! This module adapts an upgraded axum [`WebSocket`] to the split
//! reader/writer traits.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::traits::{
    Connection, ConnectionId, ConnectionReader, ConnectionWriter, Inbound, TransportError,
};

/// Default maximum inbound message size (512 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// An upgraded WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<String>,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, max_message_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
            max_message_size,
        }
    }

    /// Attach the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>) {
        let (sink, stream) = self.socket.split();
        let reader = WebSocketReader {
            id: self.id.clone(),
            stream,
            max_message_size: self.max_message_size,
        };
        let writer = WebSocketWriter {
            id: self.id,
            sink,
            closed: false,
        };
        (Box::new(reader), Box::new(writer))
    }
}

/// Receiving half of a [`WebSocketConnection`].
pub struct WebSocketReader {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

impl WebSocketReader {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                connection = %self.id,
                size = len,
                max = self.max_message_size,
                "Message too large"
            );
            return Err(TransportError::Oversized {
                size: len,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => {
                self.check_size(text.len())?;
                Ok(Some(Inbound::Text(Bytes::from(text))))
            }
            Some(Ok(Message::Binary(data))) => {
                self.check_size(data.len())?;
                Ok(Some(Inbound::Binary(Bytes::from(data))))
            }
            // Pings are answered by the socket itself on the next flush.
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Ok(Some(Inbound::Heartbeat)),
            Some(Ok(Message::Close(_))) => {
                debug!(connection = %self.id, "Received close frame");
                Ok(None)
            }
            Some(Err(e)) => Err(TransportError::Read(e.to_string())),
            None => {
                debug!(connection = %self.id, "WebSocket stream ended");
                Ok(None)
            }
        }
    }
}

/// Sending half of a [`WebSocketConnection`].
pub struct WebSocketWriter {
    id: ConnectionId,
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl ConnectionWriter for WebSocketWriter {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| TransportError::Write(e.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!(connection = %self.id, "Closing WebSocket");

        // The peer may already be gone; a failed close frame is not an error.
        let _ = self.sink.send(Message::Close(None)).await;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}
