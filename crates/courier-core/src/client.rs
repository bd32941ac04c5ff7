//! Connection workers.
//!
//! A [`Client`] owns one accepted connection for one `(user, device)` pair.
//! Once started it runs two tasks bridged by a bounded outbound queue:
//!
//! - the reader decodes client frames under a read deadline and dispatches
//!   them to the hub, the presence pipeline, or back to its own queue;
//! - the writer drains the queue to the connection and sends liveness
//!   pings on a fixed interval.
//!
//! Either side failing closes the [`ClientHandle`], which stops the other
//! side. The reader then unregisters from the hub.

use bytes::Bytes;
use chrono::Utc;
use courier_protocol::codec::{self, encode_server_with_id};
use courier_protocol::{
    codes, generate_connection_id, generate_message_id, MessageKind, ReadReceipt,
    TypingIndicator, Welcome,
};
use courier_transport::{Connection, ConnectionReader, ConnectionWriter, Inbound};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::hub::{HubError, HubHandle};
use crate::message::RelayEnvelope;
use crate::presence::PresenceHandle;

/// Connection worker configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Outbound queue capacity in frames.
    pub outbound_capacity: usize,
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// Read deadline. Must exceed `ping_interval`.
    pub pong_wait: Duration,
    /// Upper bound on a single write.
    pub write_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of a connection worker. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClientState {
    Created = 0,
    Registered = 1,
    Draining = 2,
    Closed = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Created,
            1 => ClientState::Registered,
            2 => ClientState::Draining,
            _ => ClientState::Closed,
        }
    }
}

struct Shared {
    connection_id: String,
    user_id: String,
    device_id: String,
    outbound: mpsc::Sender<Bytes>,
    last_active: Mutex<Instant>,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
    dropped: AtomicU64,
}

/// Shared handle to a connection worker.
///
/// Cloned into the hub registry. All methods are non-blocking.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("connection_id", &self.shared.connection_id)
            .field("user_id", &self.shared.user_id)
            .field("device_id", &self.shared.device_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientHandle {
    /// Create a handle with a fresh connection ID and its outbound queue.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        Self::with_connection_id(generate_connection_id(), user_id, device_id, capacity)
    }

    /// Create a handle for an existing connection ID.
    #[must_use]
    pub fn with_connection_id(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let shared = Shared {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            device_id: device_id.into(),
            outbound,
            last_active: Mutex::new(Instant::now()),
            state: AtomicU8::new(ClientState::Created as u8),
            shutdown,
            dropped: AtomicU64::new(0),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.shared.connection_id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    /// Queue an encoded frame for the writer.
    ///
    /// Returns `false` if the queue is full or the worker is closing. The
    /// frame is dropped in both cases.
    pub fn enqueue(&self, frame: Bytes) -> bool {
        if self.is_closing() {
            return false;
        }
        match self.shared.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    user = %self.shared.user_id,
                    device = %self.shared.device_id,
                    "Outbound queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(connection = %self.shared.connection_id, "Outbound queue closed");
                false
            }
        }
    }

    /// Frames dropped because the queue was full.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self
            .shared
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time of the last recorded activity.
    #[must_use]
    pub fn last_active(&self) -> Instant {
        *self
            .shared
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// How long the worker has been idle at `now`.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    /// Signal both loops to stop. Idempotent.
    pub fn close(&self) {
        let was_closing = self.shared.shutdown.send_replace(true);
        if !was_closing {
            self.set_state(ClientState::Draining);
            debug!(
                user = %self.shared.user_id,
                device = %self.shared.device_id,
                connection = %self.shared.connection_id,
                "Closing connection worker"
            );
        }
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Advance the lifecycle. Moving backwards is a no-op.
    pub fn set_state(&self, state: ClientState) {
        self.shared.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// A receiver that observes [`ClientHandle::close`].
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }
}

/// A connection worker that has not been started yet.
pub struct Client {
    connection: Box<dyn Connection>,
    handle: ClientHandle,
    outbound: mpsc::Receiver<Bytes>,
    hub: HubHandle,
    presence: Option<PresenceHandle>,
    config: ClientConfig,
}

impl Client {
    /// Bind an accepted connection to an authenticated `(user, device)` pair.
    #[must_use]
    pub fn new(
        connection: Box<dyn Connection>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        hub: HubHandle,
        presence: Option<PresenceHandle>,
        config: ClientConfig,
    ) -> Self {
        let (handle, outbound) = ClientHandle::with_connection_id(
            connection.id().as_str(),
            user_id,
            device_id,
            config.outbound_capacity,
        );
        Self {
            connection,
            handle,
            outbound,
            hub,
            presence,
            config,
        }
    }

    #[must_use]
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Register with the hub and start both loops.
    ///
    /// The welcome `status` frame is queued before registration, so it is
    /// always the first frame the client receives.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running.
    pub async fn start(self) -> Result<ClientTask, HubError> {
        let Client {
            connection,
            handle,
            outbound,
            hub,
            presence,
            config,
        } = self;

        let remote = connection.remote_addr();
        let (reader, writer) = connection.split();

        let welcome = Welcome {
            user_id: handle.user_id().to_string(),
            device_id: handle.device_id().to_string(),
            connection_id: handle.connection_id().to_string(),
        };
        if let Some(frame) = encode_frame(MessageKind::Status, "", &welcome) {
            handle.enqueue(frame);
        }

        hub.register(handle.clone()).await?;
        info!(
            user = %handle.user_id(),
            device = %handle.device_id(),
            connection = %handle.connection_id(),
            remote = ?remote,
            "Connection established"
        );

        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound,
            handle.clone(),
            config.clone(),
        ));

        let session = Session {
            handle: handle.clone(),
            hub,
            presence,
        };
        let join = tokio::spawn(async move {
            session.read_loop(reader, config.pong_wait).await;

            if let Err(e) = session.hub.unregister(session.handle.clone()).await {
                debug!(error = %e, "Unregister after hub shutdown");
            }
            session.handle.close();
            if let Err(e) = writer_task.await {
                warn!(error = %e, "Writer task failed");
            }
            session.handle.set_state(ClientState::Closed);
            info!(
                user = %session.handle.user_id(),
                device = %session.handle.device_id(),
                connection = %session.handle.connection_id(),
                "Connection closed"
            );
        });

        Ok(ClientTask { handle, join })
    }
}

/// A running connection worker.
pub struct ClientTask {
    handle: ClientHandle,
    join: JoinHandle<()>,
}

impl ClientTask {
    #[must_use]
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Wait until both loops have exited.
    pub async fn wait(self) {
        if let Err(e) = self.join.await {
            warn!(error = %e, "Connection worker failed");
        }
    }
}

fn encode_frame<T: Serialize>(kind: MessageKind, from: &str, body: &T) -> Option<Bytes> {
    let payload = to_payload(body)?;
    match codec::encode_server(kind, from, &payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(kind = %kind, error = %e, "Failed to encode frame");
            None
        }
    }
}

/// Reader-side context.
struct Session {
    handle: ClientHandle,
    hub: HubHandle,
    presence: Option<PresenceHandle>,
}

impl Session {
    async fn read_loop(&self, mut reader: Box<dyn ConnectionReader>, pong_wait: Duration) {
        let mut shutdown = self.handle.shutdown_signal();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                _ = shutdown.changed() => break,
                result = timeout(pong_wait, reader.recv()) => result,
            };

            let inbound = match next {
                Err(_) => {
                    info!(
                        user = %self.handle.user_id(),
                        device = %self.handle.device_id(),
                        "Read deadline expired"
                    );
                    break;
                }
                Ok(Err(e)) => {
                    debug!(user = %self.handle.user_id(), error = %e, "Read failed");
                    break;
                }
                Ok(Ok(None)) => {
                    debug!(user = %self.handle.user_id(), "Peer closed connection");
                    break;
                }
                Ok(Ok(Some(inbound))) => inbound,
            };

            self.handle.touch();
            let result = match inbound {
                Inbound::Heartbeat => {
                    if let Some(presence) = &self.presence {
                        presence.heartbeat(self.handle.user_id());
                    }
                    Ok(())
                }
                Inbound::Text(data) | Inbound::Binary(data) => self.dispatch(&data).await,
            };

            if let Err(e) = result {
                warn!(user = %self.handle.user_id(), error = %e, "Stopping reader");
                break;
            }
        }
    }

    async fn dispatch(&self, data: &[u8]) -> Result<(), HubError> {
        let envelope = match codec::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(user = %self.handle.user_id(), error = %e, "Invalid frame");
                self.reply_error(codes::PARSE_ERROR, "Invalid message format");
                return Ok(());
            }
        };

        if envelope.kind.requires_recipient() && envelope.to.is_empty() {
            self.reply_error(codes::MISSING_RECIPIENT, "Recipient ID required");
            return Ok(());
        }

        let user_id = self.handle.user_id();
        trace!(user = %user_id, kind = %envelope.kind, to = %envelope.to, "Inbound frame");

        match envelope.kind {
            MessageKind::Message => {
                let message_id = generate_message_id();
                if let Some(presence) = &self.presence {
                    presence.record_message_meta(&message_id, user_id, &envelope.to);
                }
                let relay = self
                    .relay_envelope(MessageKind::Message, &envelope.to, envelope.payload)
                    .with_message_id(message_id.clone());
                self.hub.relay(relay).await?;

                match encode_server_with_id(MessageKind::Delivery, "", &message_id, &message_id) {
                    Ok(ack) => {
                        self.handle.enqueue(ack);
                    }
                    Err(e) => warn!(error = %e, "Failed to encode delivery ack"),
                }
            }
            MessageKind::Typing => {
                let indicator = TypingIndicator {
                    user_id: user_id.to_string(),
                    is_typing: envelope.payload == "true",
                };
                if let Some(payload) = to_payload(&indicator) {
                    let relay = self.relay_envelope(MessageKind::Typing, &envelope.to, payload);
                    self.hub.relay(relay).await?;
                }
            }
            MessageKind::Read => {
                let receipt = ReadReceipt {
                    message_id: envelope.payload.clone(),
                    read_at: Utc::now(),
                };
                if let Some(payload) = to_payload(&receipt) {
                    let relay = self.relay_envelope(MessageKind::Read, &envelope.to, payload);
                    self.hub.relay(relay).await?;
                }
                if let Some(presence) = &self.presence {
                    if !envelope.payload.is_empty() {
                        presence.mark_read(&envelope.payload);
                    }
                }
            }
            MessageKind::Presence => {
                if let Some(presence) = &self.presence {
                    presence.update_status(user_id, &envelope.payload);
                }
            }
            MessageKind::Ping => {
                if let Some(presence) = &self.presence {
                    presence.heartbeat(user_id);
                }
                match codec::encode_server(MessageKind::Pong, "", "") {
                    Ok(pong) => {
                        self.handle.enqueue(pong);
                    }
                    Err(e) => warn!(error = %e, "Failed to encode pong"),
                }
            }
            MessageKind::Delivery
            | MessageKind::Error
            | MessageKind::Status
            | MessageKind::Pong
            | MessageKind::Unknown => {
                debug!(user = %user_id, kind = %envelope.kind, "Unsupported kind from client");
                self.reply_error(codes::UNKNOWN_TYPE, "Unknown message type");
            }
        }
        Ok(())
    }

    fn relay_envelope(&self, kind: MessageKind, to: &str, payload: String) -> RelayEnvelope {
        RelayEnvelope::new(kind, self.handle.user_id(), to, payload)
            .with_device(self.handle.device_id())
    }

    fn reply_error(&self, code: &str, message: &str) {
        self.handle.enqueue(codec::encode_error(code, message));
    }
}

fn to_payload<T: Serialize>(body: &T) -> Option<String> {
    match serde_json::to_string(body) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(error = %e, "Failed to serialize payload");
            None
        }
    }
}

async fn write_loop(
    mut writer: Box<dyn ConnectionWriter>,
    mut outbound: mpsc::Receiver<Bytes>,
    handle: ClientHandle,
    config: ClientConfig,
) {
    let mut shutdown = handle.shutdown_signal();
    let mut ticker = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                match timeout(config.write_timeout, writer.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(user = %handle.user_id(), error = %e, "Write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(user = %handle.user_id(), "Write timed out");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                match timeout(config.write_timeout, writer.send_ping()).await {
                    Ok(Ok(())) => trace!(user = %handle.user_id(), "Ping sent"),
                    Ok(Err(e)) => {
                        debug!(user = %handle.user_id(), error = %e, "Ping failed");
                        break;
                    }
                    Err(_) => {
                        warn!(user = %handle.user_id(), "Ping timed out");
                        break;
                    }
                }
            }
        }
    }

    handle.close();
    match timeout(config.write_timeout, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Close failed"),
        Err(_) => debug!("Close timed out"),
    }
}
