//! # Courier Server
//!
//! Real-time relay for end-to-end-encrypted chat clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with an explicit config file
//! courier ./courier.toml
//!
//! # Run with environment variables
//! COURIER_PORT=8080 COURIER_HOST=0.0.0.0 COURIER_PRESENCE__BACKEND=redis courier
//! ```

use anyhow::Result;
use courier_server::{config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args_os().nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Courier server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
