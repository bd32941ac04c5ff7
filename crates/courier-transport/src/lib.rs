//! # courier-transport
//!
//! Connection abstraction layer for the Courier relay.
//!
//! The relay never deals with upgrade handshakes. It is handed an accepted
//! connection and splits it into two halves, one per worker task:
//!
//! - **WebSocket** - an upgraded axum socket
//! - **Memory** - an in-process pair for tests and benchmarks
//!
//! ```rust,ignore
//! use courier_transport::{Connection, Inbound};
//!
//! async fn drain(conn: Box<dyn Connection>) {
//!     let (mut reader, _writer) = conn.split();
//!     while let Ok(Some(Inbound::Text(data))) = reader.recv().await {
//!         // Process envelope
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{
    Connection, ConnectionId, ConnectionReader, ConnectionWriter, Inbound, TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
