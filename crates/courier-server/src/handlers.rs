//! Connection acceptor for the Courier server.
//!
//! Authenticates upgrade requests, hands each upgraded socket to a
//! connection worker, and serves health and statistics endpoints.

use crate::auth::{self, StaticTokens, TokenValidator};
use crate::config::{Config, PresenceBackend, PresenceConfig};
use crate::metrics::{self, ConnectionGauge};
use anyhow::Result;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use courier_core::{
    Client, Hub, HubHandle, KeyValueStore, MemoryStore, PresenceHandle, Tracker,
};
use courier_transport::WebSocketConnection;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the running hub.
    pub hub: HubHandle,
    /// Presence pipeline, if a backend is configured.
    pub presence: Option<PresenceHandle>,
    /// Validates bearer tokens.
    pub validator: Arc<dyn TokenValidator>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Start the hub, presence pipeline and background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence backend cannot be reached.
    pub async fn new(config: Config, validator: Arc<dyn TokenValidator>) -> Result<Self> {
        let presence = presence_handle(&config.presence).await?;
        let (hub, handle) = Hub::new(config.hub_config(), presence.clone());
        hub.spawn();

        if let Some(presence) = &presence {
            spawn_presence_cleanup(presence.clone(), &config.presence);
        }
        if config.metrics.enabled {
            spawn_stats_export(
                handle.clone(),
                Duration::from_millis(config.metrics.export_interval_ms),
            );
        }

        Ok(Self {
            hub: handle,
            presence,
            validator,
            config,
        })
    }
}

async fn presence_handle(config: &PresenceConfig) -> Result<Option<PresenceHandle>> {
    let store: Arc<dyn KeyValueStore> = match config.backend {
        PresenceBackend::Disabled => {
            warn!("Presence disabled; offline messages will be dropped");
            return Ok(None);
        }
        PresenceBackend::Memory => Arc::new(MemoryStore::new()),
        PresenceBackend::Redis => redis_store(&config.redis_url).await?,
    };
    Ok(Some(PresenceHandle::spawn(Arc::new(Tracker::new(store)))))
}

#[cfg(feature = "redis")]
async fn redis_store(url: &str) -> Result<Arc<dyn KeyValueStore>> {
    use anyhow::Context;

    let store = courier_core::RedisStore::connect(url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {url}"))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn redis_store(_url: &str) -> Result<Arc<dyn KeyValueStore>> {
    anyhow::bail!("The redis presence backend requires the `redis` feature")
}

fn spawn_presence_cleanup(presence: PresenceHandle, config: &PresenceConfig) {
    let period = Duration::from_millis(config.cleanup_interval_ms);
    let threshold = Duration::from_millis(config.inactive_threshold_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            debug!("Running presence cleanup");
            presence.cleanup_inactive(threshold);
        }
    });
}

fn spawn_stats_export(hub: HubHandle, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            metrics::record_hub_stats(&hub.stats());
        }
    });
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("{:#}", e);
        }
    }

    let validator = StaticTokens::new(&config.auth.tokens);
    if validator.is_empty() {
        warn!("No tokens configured; every connection will be rejected");
    }

    let addr = config.bind_addr()?;
    let websocket_path = config.transport.websocket_path.clone();
    let state = Arc::new(AppState::new(config, Arc::new(validator)).await?);

    let listener = TcpListener::bind(addr).await?;
    info!("Courier server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, websocket_path);

    serve(listener, state).await
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve the router on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops with an I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Relay statistics. Requires a valid access token.
async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) =
        auth::authenticate(state.validator.as_ref(), query.token.as_deref(), &headers).await
    {
        metrics::record_error("auth");
        return e.into_response();
    }

    let online_users = match &state.presence {
        Some(presence) => match presence.tracker().list_online().await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "Failed to list online users");
                state.hub.online_users()
            }
        },
        None => state.hub.online_users(),
    };

    Json(serde_json::json!({
        "websocket": state.hub.stats(),
        "users": {
            "online_count": online_users.len(),
            "online_users": online_users,
        },
    }))
    .into_response()
}

/// WebSocket upgrade handler.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let claims =
        match auth::authenticate(state.validator.as_ref(), query.token.as_deref(), &headers).await
        {
            Ok(claims) => claims,
            Err(e) => {
                warn!(remote = %addr, error = %e, "Rejected connection");
                metrics::record_error("auth");
                return e.into_response();
            }
        };

    debug!(
        remote = %addr,
        user = %claims.user_id,
        device = %claims.device_id,
        "Upgrade authenticated"
    );

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, addr, claims, state))
}

/// Drive one upgraded connection until it closes.
async fn handle_websocket(
    socket: WebSocket,
    addr: SocketAddr,
    claims: auth::Claims,
    state: Arc<AppState>,
) {
    let _gauge = ConnectionGauge::open();

    let connection = WebSocketConnection::new(socket, state.config.limits.max_message_size)
        .with_remote_addr(addr.to_string());
    let client = Client::new(
        Box::new(connection),
        claims.user_id,
        claims.device_id,
        state.hub.clone(),
        state.presence.clone(),
        state.config.client_config(),
    );

    match client.start().await {
        Ok(task) => task.wait().await,
        Err(e) => {
            error!(remote = %addr, error = %e, "Failed to start connection worker");
            metrics::record_error("hub");
        }
    }
}
