//! # courier-server
//!
//! The acceptor in front of the Courier relay: bearer-token
//! authentication, WebSocket upgrade, configuration and metrics.
//!
//! ```rust,ignore
//! use courier_server::{config::Config, handlers};
//!
//! let config = Config::load()?;
//! handlers::run_server(config).await?;
//! ```

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;
