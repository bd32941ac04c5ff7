//! The hub: registry of connected devices and relay fan-out.
//!
//! A single [`Hub`] task owns every mutation of the registry. Connection
//! workers and the acceptor talk to it through a cloneable [`HubHandle`],
//! which also offers read-only lookups guarded by the registry lock.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::client::{ClientHandle, ClientState};
use crate::message::RelayEnvelope;
use crate::presence::PresenceHandle;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub task has stopped.
    #[error("Hub is not running")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the event channel.
    pub event_capacity: usize,
    /// Interval between liveness sweeps.
    pub cleanup_interval: Duration,
    /// Devices idle longer than this are removed by the sweep.
    pub inactive_threshold: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1000,
            cleanup_interval: Duration::from_secs(30),
            inactive_threshold: Duration::from_secs(5 * 60),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registrations since start.
    pub total_connections: u64,
    /// Devices currently registered.
    pub active_connections: usize,
    /// Relays accepted by at least one device.
    pub messages_relayed: u64,
    /// Frames dropped on full outbound queues, from any source.
    pub dropped_frames: u64,
    /// Time of the last register, unregister or relay.
    pub last_activity: Option<DateTime<Utc>>,
}

pub(crate) enum HubEvent {
    Register(ClientHandle),
    Unregister(ClientHandle),
    Relay(RelayEnvelope),
    Barrier(oneshot::Sender<()>),
}

type Devices = HashMap<String, ClientHandle>;

#[derive(Default)]
struct Registry {
    users: RwLock<HashMap<String, Devices>>,
    stats: RwLock<HubStats>,
    /// Drops of workers no longer in the registry.
    retired_dropped: AtomicU64,
}

impl Registry {
    fn users(&self) -> RwLockReadGuard<'_, HashMap<String, Devices>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn users_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Devices>> {
        self.users.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> RwLockReadGuard<'_, HubStats> {
        self.stats.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats_mut(&self) -> RwLockWriteGuard<'_, HubStats> {
        self.stats.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn retire(&self, client: &ClientHandle) {
        self.retired_dropped
            .fetch_add(client.dropped_frames(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> HubStats {
        let live: u64 = self
            .users()
            .values()
            .flat_map(HashMap::values)
            .map(ClientHandle::dropped_frames)
            .sum();
        let mut stats = self.stats().clone();
        stats.dropped_frames = self.retired_dropped.load(Ordering::Relaxed) + live;
        stats
    }
}

/// Relays held back while a user's offline queue is replayed.
#[derive(Default)]
struct HeldRelays {
    /// Replays submitted and not yet reported done.
    outstanding: usize,
    relays: Vec<RelayEnvelope>,
}

/// The hub event loop.
pub struct Hub {
    config: HubConfig,
    events: mpsc::Receiver<HubEvent>,
    registry: Arc<Registry>,
    presence: Option<PresenceHandle>,
    replaying: HashMap<String, HeldRelays>,
    replay_done_tx: mpsc::UnboundedSender<String>,
    replay_done_rx: mpsc::UnboundedReceiver<String>,
}

impl Hub {
    /// Create a hub and the handle used to reach it.
    ///
    /// Without a presence handle, offline messages are dropped.
    #[must_use]
    pub fn new(config: HubConfig, presence: Option<PresenceHandle>) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let registry = Arc::new(Registry::default());
        let (replay_done_tx, replay_done_rx) = mpsc::unbounded_channel();
        let hub = Self {
            config,
            events: rx,
            registry: Arc::clone(&registry),
            presence,
            replaying: HashMap::new(),
            replay_done_tx,
            replay_done_rx,
        };
        (hub, HubHandle { events: tx, registry })
    }

    /// Run the hub on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process events until every [`HubHandle`] is dropped.
    pub async fn run(mut self) {
        info!(
            cleanup_interval = ?self.config.cleanup_interval,
            inactive_threshold = ?self.config.inactive_threshold,
            "Hub started"
        );
        let period = self.config.cleanup_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => self.cleanup(Instant::now()),
                Some(user_id) = self.replay_done_rx.recv() => self.finish_replay(&user_id),
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        info!("Hub stopped");
    }

    fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(client) => self.register(client),
            HubEvent::Unregister(client) => self.unregister(&client),
            HubEvent::Relay(envelope) => self.relay(envelope),
            HubEvent::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    fn register(&mut self, client: ClientHandle) {
        let replaced = self
            .registry
            .users_mut()
            .entry(client.user_id().to_string())
            .or_default()
            .insert(client.device_id().to_string(), client.clone());

        if let Some(old) = &replaced {
            if old.connection_id() != client.connection_id() {
                info!(
                    user = %client.user_id(),
                    device = %client.device_id(),
                    old = %old.connection_id(),
                    new = %client.connection_id(),
                    "Replacing existing connection"
                );
                old.close();
                self.registry.retire(old);
            }
        }
        client.set_state(ClientState::Registered);

        {
            let mut stats = self.registry.stats_mut();
            stats.total_connections += 1;
            if replaced.is_none() {
                stats.active_connections += 1;
            }
            stats.last_activity = Some(Utc::now());
        }

        if let Some(presence) = &self.presence {
            presence.set_online(client.user_id(), client.device_id());
            if presence.replay_pending(client.clone(), self.replay_done_tx.clone()) {
                self.replaying
                    .entry(client.user_id().to_string())
                    .or_default()
                    .outstanding += 1;
            }
        }

        debug!(
            user = %client.user_id(),
            device = %client.device_id(),
            connection = %client.connection_id(),
            "Registered"
        );
    }

    /// Release relays held for `user_id` once its last replay has finished.
    fn finish_replay(&mut self, user_id: &str) {
        let Entry::Occupied(mut entry) = self.replaying.entry(user_id.to_string()) else {
            return;
        };
        let held = entry.get_mut();
        held.outstanding = held.outstanding.saturating_sub(1);
        if held.outstanding > 0 {
            return;
        }

        let relays = entry.remove().relays;
        if !relays.is_empty() {
            debug!(user = %user_id, count = relays.len(), "Releasing held relays");
        }
        for envelope in relays {
            self.relay(envelope);
        }
    }

    fn unregister(&mut self, client: &ClientHandle) {
        let (removed, user_gone) = {
            let mut users = self.registry.users_mut();
            match users.get_mut(client.user_id()) {
                Some(devices)
                    if devices
                        .get(client.device_id())
                        .is_some_and(|c| c.connection_id() == client.connection_id()) =>
                {
                    devices.remove(client.device_id());
                    let gone = devices.is_empty();
                    if gone {
                        users.remove(client.user_id());
                    }
                    (true, gone)
                }
                _ => (false, false),
            }
        };

        client.close();
        if removed {
            self.registry.retire(client);
        } else {
            trace!(connection = %client.connection_id(), "Unregister ignored");
            return;
        }

        {
            let mut stats = self.registry.stats_mut();
            stats.active_connections = stats.active_connections.saturating_sub(1);
            stats.last_activity = Some(Utc::now());
        }

        if user_gone {
            if let Some(presence) = &self.presence {
                presence.set_offline(client.user_id());
            }
        }

        debug!(
            user = %client.user_id(),
            device = %client.device_id(),
            connection = %client.connection_id(),
            "Unregistered"
        );
    }

    fn relay(&mut self, envelope: RelayEnvelope) {
        if let Some(held) = self.replaying.get_mut(&envelope.to) {
            trace!(to = %envelope.to, "Holding relay until replay completes");
            held.relays.push(envelope);
            return;
        }

        let targets: Vec<ClientHandle> = self
            .registry
            .users()
            .get(&envelope.to)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default();

        if targets.is_empty() {
            self.route_offline(envelope);
            return;
        }

        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(from = %envelope.from, to = %envelope.to, error = %e, "Failed to encode relay");
                return;
            }
        };

        let accepted = targets
            .iter()
            .filter(|target| !target.is_closing() && target.enqueue(frame.clone()))
            .count();

        {
            let mut stats = self.registry.stats_mut();
            if accepted > 0 {
                stats.messages_relayed += 1;
            }
            stats.last_activity = Some(Utc::now());
        }

        if accepted == 0 {
            warn!(
                from = %envelope.from,
                to = %envelope.to,
                kind = %envelope.kind,
                devices = targets.len(),
                "No device accepted relay"
            );
            return;
        }

        if envelope.kind.is_persistable() {
            if let (Some(presence), Some(id)) = (&self.presence, &envelope.message_id) {
                presence.mark_delivered(id);
            }
        }

        trace!(
            from = %envelope.from,
            to = %envelope.to,
            kind = %envelope.kind,
            accepted,
            "Relayed"
        );
    }

    fn route_offline(&self, envelope: RelayEnvelope) {
        if !envelope.kind.is_persistable() {
            trace!(to = %envelope.to, kind = %envelope.kind, "Recipient offline, dropping");
            return;
        }
        match &self.presence {
            Some(presence) => {
                debug!(from = %envelope.from, to = %envelope.to, "Recipient offline, queueing");
                presence.store_pending(envelope);
            }
            None => {
                warn!(from = %envelope.from, to = %envelope.to, "Recipient offline and no store, dropping");
            }
        }
    }

    fn cleanup(&mut self, now: Instant) {
        let threshold = self.config.inactive_threshold;
        let stale: Vec<ClientHandle> = self
            .registry
            .users()
            .values()
            .flat_map(HashMap::values)
            .filter(|client| client.idle_for(now) > threshold)
            .cloned()
            .collect();

        for client in &stale {
            info!(
                user = %client.user_id(),
                device = %client.device_id(),
                idle = ?client.idle_for(now),
                "Removing inactive connection"
            );
            self.unregister(client);
        }

        if !stale.is_empty() {
            debug!(removed = stale.len(), "Liveness sweep");
        }
    }
}

/// Cloneable access to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
    registry: Arc<Registry>,
}

impl HubHandle {
    async fn send(&self, event: HubEvent) -> Result<(), HubError> {
        self.events.send(event).await.map_err(|_| HubError::Closed)
    }

    /// Submit a worker for registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        self.send(HubEvent::Register(client)).await
    }

    /// Submit a worker for removal. Stale or repeated calls are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn unregister(&self, client: ClientHandle) -> Result<(), HubError> {
        self.send(HubEvent::Unregister(client)).await
    }

    /// Submit an envelope for relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn relay(&self, envelope: RelayEnvelope) -> Result<(), HubError> {
        self.send(HubEvent::Relay(envelope)).await
    }

    /// Wait until every event submitted before this call has been handled.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn flush(&self) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubEvent::Barrier(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// A snapshot of the hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        self.registry.snapshot()
    }

    /// Registered devices of a user, sorted.
    #[must_use]
    pub fn user_devices(&self, user_id: &str) -> Vec<String> {
        let mut devices: Vec<String> = self
            .registry
            .users()
            .get(user_id)
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default();
        devices.sort();
        devices
    }

    /// Registered worker handles of a user.
    #[must_use]
    pub fn user_clients(&self, user_id: &str) -> Vec<ClientHandle> {
        self.registry
            .users()
            .get(user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Users with at least one registered device, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.registry.users().keys().cloned().collect();
        users.sort();
        users
    }

    #[must_use]
    pub fn is_connected(&self, user_id: &str) -> bool {
        self.registry.users().contains_key(user_id)
    }

    /// Number of registered devices.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.users().values().map(HashMap::len).sum()
    }

    /// Enqueue an encoded frame on every device of a user.
    ///
    /// Returns the number of devices that accepted it.
    pub fn send_to_user(&self, user_id: &str, frame: Bytes) -> usize {
        self.user_clients(user_id)
            .iter()
            .filter(|client| client.enqueue(frame.clone()))
            .count()
    }
}
