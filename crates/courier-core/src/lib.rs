//! # courier-core
//!
//! Routing, connection workers and presence tracking for the Courier relay.
//!
//! This crate provides the building blocks behind the acceptor:
//!
//! - **Hub** - Registry of connected devices and relay fan-out
//! - **Client** - Per-connection reader/writer workers
//! - **Presence** - Online status, offline queue and delivery metadata
//! - **Store** - The key-value service presence is kept in
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  register   ┌─────────────┐  relay   ┌─────────────┐
//! │   Client    │────────────▶│     Hub     │─────────▶│   Client    │
//! └─────────────┘  relay      └─────────────┘          └─────────────┘
//!                                    │ offline / replay
//!                                    ▼
//!                             ┌─────────────┐     ┌─────────────┐
//!                             │  Presence   │────▶│    Store    │
//!                             └─────────────┘     └─────────────┘
//! ```

pub mod client;
pub mod hub;
pub mod message;
pub mod presence;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use client::{Client, ClientConfig, ClientHandle, ClientState, ClientTask};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats};
pub use message::RelayEnvelope;
pub use presence::{MessageMeta, PresenceHandle, PresenceRecord, Tracker};
pub use store::{KeyValueStore, MemoryStore, StoreError};

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
