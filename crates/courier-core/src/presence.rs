//! Presence tracking and the offline queue.
//!
//! [`Tracker`] maps presence and delivery operations onto a
//! [`KeyValueStore`]. The hub and connection workers never call it directly:
//! they go through a [`PresenceHandle`], which feeds a single background task
//! so store latency never stalls the hub loop and commands for one user are
//! applied in submission order.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::client::ClientHandle;
use crate::message::RelayEnvelope;
use crate::store::{KeyValueStore, StoreError};

/// Maximum number of queued offline messages per user.
pub const PENDING_CAPACITY: usize = 100;

/// Lifetime of an offline queue.
pub const PENDING_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Lifetime of presence records.
pub const PRESENCE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifetime of message delivery metadata.
pub const META_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default upper bound on one pipeline command.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// Store key layout.
pub mod keys {
    /// Set of every user currently online.
    pub const ONLINE_USERS: &str = "presence:online_users";

    #[must_use]
    pub fn user(user_id: &str) -> String {
        format!("presence:user:{user_id}")
    }

    #[must_use]
    pub fn devices(user_id: &str) -> String {
        format!("presence:devices:{user_id}")
    }

    #[must_use]
    pub fn pending(user_id: &str) -> String {
        format!("pending:messages:{user_id}")
    }

    #[must_use]
    pub fn message_meta(message_id: &str) -> String {
        format!("message:meta:{message_id}")
    }
}

/// A user's presence hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    /// `online`, `offline`, or a client-supplied status.
    pub status: String,
    /// Unix seconds of the last observed activity.
    pub last_seen: i64,
}

/// Delivery state of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageMeta {
    pub from: String,
    pub to: String,
    pub timestamp: i64,
    pub delivered: bool,
    pub delivered_at: Option<i64>,
    pub read: bool,
    pub read_at: Option<i64>,
}

impl MessageMeta {
    fn from_hash(map: &HashMap<String, String>) -> Self {
        let int = |field: &str| map.get(field).and_then(|v| v.parse::<i64>().ok());
        let flag = |field: &str| map.get(field).is_some_and(|v| v == "true");
        Self {
            from: map.get("from").cloned().unwrap_or_default(),
            to: map.get("to").cloned().unwrap_or_default(),
            timestamp: int("timestamp").unwrap_or_default(),
            delivered: flag("delivered"),
            delivered_at: int("delivered_at"),
            read: flag("read"),
            read_at: int("read_at"),
        }
    }
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Presence and offline-queue operations over a key-value store.
///
/// Every operation is idempotent.
#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn KeyValueStore>,
}

impl Tracker {
    /// Create a tracker over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Mark a device online.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn set_online(&self, user_id: &str, device_id: &str) -> Result<(), StoreError> {
        let user_key = keys::user(user_id);
        self.store
            .hset(
                &user_key,
                &[
                    ("status", STATUS_ONLINE.to_string()),
                    ("last_seen", now_secs().to_string()),
                ],
            )
            .await?;
        self.store.expire(&user_key, PRESENCE_TTL).await?;

        let devices_key = keys::devices(user_id);
        self.store.sadd(&devices_key, device_id).await?;
        self.store.expire(&devices_key, PRESENCE_TTL).await?;

        self.store.sadd(keys::ONLINE_USERS, user_id).await?;
        debug!(user = %user_id, device = %device_id, "Presence: online");
        Ok(())
    }

    /// Mark a user offline and forget their devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn set_offline(&self, user_id: &str) -> Result<(), StoreError> {
        self.store
            .hset(
                &keys::user(user_id),
                &[
                    ("status", STATUS_OFFLINE.to_string()),
                    ("last_seen", now_secs().to_string()),
                ],
            )
            .await?;
        self.store.srem(keys::ONLINE_USERS, user_id).await?;
        self.store.del(&keys::devices(user_id)).await?;
        debug!(user = %user_id, "Presence: offline");
        Ok(())
    }

    /// Check whether a user is in the online set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn is_online(&self, user_id: &str) -> Result<bool, StoreError> {
        self.store.sismember(keys::ONLINE_USERS, user_id).await
    }

    /// All online users, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_online(&self) -> Result<Vec<String>, StoreError> {
        let mut users = self.store.smembers(keys::ONLINE_USERS).await?;
        users.sort();
        Ok(users)
    }

    /// A user's presence hash, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn user_status(&self, user_id: &str) -> Result<Option<PresenceRecord>, StoreError> {
        let map = self.store.hgetall(&keys::user(user_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(PresenceRecord {
            status: map.get("status").cloned().unwrap_or_default(),
            last_seen: map
                .get("last_seen")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        }))
    }

    /// Devices currently recorded for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn active_devices(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.store.smembers(&keys::devices(user_id)).await
    }

    /// Set a client-supplied status string.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn update_status(&self, user_id: &str, status: &str) -> Result<(), StoreError> {
        self.store
            .hset(&keys::user(user_id), &[("status", status.to_string())])
            .await
    }

    /// Refresh a user's `last_seen`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn heartbeat(&self, user_id: &str) -> Result<(), StoreError> {
        self.store
            .hset(&keys::user(user_id), &[("last_seen", now_secs().to_string())])
            .await
    }

    /// Append an envelope to a user's offline queue.
    ///
    /// The queue keeps the newest [`PENDING_CAPACITY`] entries.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the store fails.
    pub async fn store_pending(
        &self,
        user_id: &str,
        envelope: &RelayEnvelope,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(envelope)?;
        let key = keys::pending(user_id);
        self.store.lpush(&key, &data).await?;
        self.store
            .ltrim(&key, 0, PENDING_CAPACITY as isize - 1)
            .await?;
        self.store.expire(&key, PENDING_TTL).await?;
        debug!(user = %user_id, from = %envelope.from, "Queued offline message");
        Ok(())
    }

    /// A user's offline queue, oldest first.
    ///
    /// Entries that fail to decode are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_pending(&self, user_id: &str) -> Result<Vec<RelayEnvelope>, StoreError> {
        let raw = self.store.lrange(&keys::pending(user_id), 0, -1).await?;
        Ok(raw
            .iter()
            .rev()
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(user = %user_id, error = %e, "Skipping undecodable pending message");
                    None
                }
            })
            .collect())
    }

    /// Drop a user's offline queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn clear_pending(&self, user_id: &str) -> Result<(), StoreError> {
        self.store.del(&keys::pending(user_id)).await
    }

    /// Record that a message was accepted for relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn record_message_meta(
        &self,
        message_id: &str,
        from: &str,
        to: &str,
    ) -> Result<(), StoreError> {
        let key = keys::message_meta(message_id);
        self.store
            .hset(
                &key,
                &[
                    ("from", from.to_string()),
                    ("to", to.to_string()),
                    ("timestamp", now_secs().to_string()),
                    ("delivered", "false".to_string()),
                    ("read", "false".to_string()),
                ],
            )
            .await?;
        self.store.expire(&key, META_TTL).await
    }

    /// Mark a message delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn mark_delivered(&self, message_id: &str) -> Result<(), StoreError> {
        self.store
            .hset(
                &keys::message_meta(message_id),
                &[
                    ("delivered", "true".to_string()),
                    ("delivered_at", now_secs().to_string()),
                ],
            )
            .await
    }

    /// Mark a message read.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn mark_read(&self, message_id: &str) -> Result<(), StoreError> {
        self.store
            .hset(
                &keys::message_meta(message_id),
                &[
                    ("read", "true".to_string()),
                    ("read_at", now_secs().to_string()),
                ],
            )
            .await
    }

    /// Delivery metadata of a message, if recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn message_meta(&self, message_id: &str) -> Result<Option<MessageMeta>, StoreError> {
        let map = self.store.hgetall(&keys::message_meta(message_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(MessageMeta::from_hash(&map)))
    }

    /// Mark offline every online user not seen within `threshold`.
    ///
    /// Returns the number of users marked offline.
    ///
    /// # Errors
    ///
    /// Returns an error if the online set cannot be read.
    pub async fn cleanup_inactive(&self, threshold: Duration) -> Result<usize, StoreError> {
        let cutoff = now_secs() - threshold.as_secs() as i64;
        let mut removed = 0;

        for user_id in self.list_online().await? {
            let record = match self.user_status(&user_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(user = %user_id, error = %e, "Failed to read presence");
                    continue;
                }
            };
            if record.last_seen < cutoff {
                self.set_offline(&user_id).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Marked inactive users offline");
        }
        Ok(removed)
    }
}

enum StoreOp {
    Online { user_id: String, device_id: String },
    Offline { user_id: String },
    Status { user_id: String, status: String },
    Heartbeat { user_id: String },
    StorePending { envelope: RelayEnvelope },
    RecordMeta { message_id: String, from: String, to: String },
    Delivered { message_id: String },
    Read { message_id: String },
    CleanupInactive { threshold: Duration },
}

impl StoreOp {
    fn name(&self) -> &'static str {
        match self {
            StoreOp::Online { .. } => "set_online",
            StoreOp::Offline { .. } => "set_offline",
            StoreOp::Status { .. } => "update_status",
            StoreOp::Heartbeat { .. } => "heartbeat",
            StoreOp::StorePending { .. } => "store_pending",
            StoreOp::RecordMeta { .. } => "record_message_meta",
            StoreOp::Delivered { .. } => "mark_delivered",
            StoreOp::Read { .. } => "mark_read",
            StoreOp::CleanupInactive { .. } => "cleanup_inactive",
        }
    }

    async fn execute(self, tracker: &Tracker) -> Result<(), StoreError> {
        match self {
            StoreOp::Online { user_id, device_id } => tracker.set_online(&user_id, &device_id).await,
            StoreOp::Offline { user_id } => tracker.set_offline(&user_id).await,
            StoreOp::Status { user_id, status } => tracker.update_status(&user_id, &status).await,
            StoreOp::Heartbeat { user_id } => tracker.heartbeat(&user_id).await,
            StoreOp::StorePending { envelope } => tracker.store_pending(&envelope.to, &envelope).await,
            StoreOp::RecordMeta {
                message_id,
                from,
                to,
            } => tracker.record_message_meta(&message_id, &from, &to).await,
            StoreOp::Delivered { message_id } => tracker.mark_delivered(&message_id).await,
            StoreOp::Read { message_id } => tracker.mark_read(&message_id).await,
            StoreOp::CleanupInactive { threshold } => {
                tracker.cleanup_inactive(threshold).await.map(|_| ())
            }
        }
    }
}

enum PresenceCommand {
    Op(StoreOp),
    Replay {
        client: ClientHandle,
        done: mpsc::UnboundedSender<String>,
    },
    Barrier(oneshot::Sender<()>),
}

/// Fire-and-forget access to a [`Tracker`].
///
/// Commands run one at a time on a background task in submission order.
/// Each command is bounded by an operation timeout, so a stalled store
/// delays the pipeline but never wedges it. Store failures and timeouts are
/// logged and swallowed.
#[derive(Clone)]
pub struct PresenceHandle {
    tx: mpsc::UnboundedSender<PresenceCommand>,
    tracker: Arc<Tracker>,
}

impl PresenceHandle {
    /// Spawn the pipeline task for a tracker with [`OPERATION_TIMEOUT`].
    ///
    /// The task exits once every handle has been dropped.
    #[must_use]
    pub fn spawn(tracker: Arc<Tracker>) -> Self {
        Self::spawn_with_timeout(tracker, OPERATION_TIMEOUT)
    }

    /// Spawn the pipeline task with a custom per-command timeout.
    #[must_use]
    pub fn spawn_with_timeout(tracker: Arc<Tracker>, limit: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = Arc::clone(&tracker);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                apply(&worker, command, limit).await;
            }
            debug!("Presence pipeline stopped");
        });
        Self { tx, tracker }
    }

    /// The tracker behind this handle, for direct reads.
    #[must_use]
    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn set_online(&self, user_id: &str, device_id: &str) {
        self.submit_op(StoreOp::Online {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
        });
    }

    pub fn set_offline(&self, user_id: &str) {
        self.submit_op(StoreOp::Offline {
            user_id: user_id.to_string(),
        });
    }

    pub fn update_status(&self, user_id: &str, status: &str) {
        self.submit_op(StoreOp::Status {
            user_id: user_id.to_string(),
            status: status.to_string(),
        });
    }

    pub fn heartbeat(&self, user_id: &str) {
        self.submit_op(StoreOp::Heartbeat {
            user_id: user_id.to_string(),
        });
    }

    /// Queue an envelope for its offline recipient.
    pub fn store_pending(&self, envelope: RelayEnvelope) {
        self.submit_op(StoreOp::StorePending { envelope });
    }

    /// Deliver a user's offline queue to a newly registered device, then
    /// clear it.
    ///
    /// The user ID is sent on `done` once the replay has finished, failed or
    /// timed out. Returns `false` if the pipeline is gone, in which case
    /// nothing will be sent.
    pub fn replay_pending(&self, client: ClientHandle, done: mpsc::UnboundedSender<String>) -> bool {
        self.submit(PresenceCommand::Replay { client, done })
    }

    pub fn record_message_meta(&self, message_id: &str, from: &str, to: &str) {
        self.submit_op(StoreOp::RecordMeta {
            message_id: message_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    pub fn mark_delivered(&self, message_id: &str) {
        self.submit_op(StoreOp::Delivered {
            message_id: message_id.to_string(),
        });
    }

    pub fn mark_read(&self, message_id: &str) {
        self.submit_op(StoreOp::Read {
            message_id: message_id.to_string(),
        });
    }

    pub fn cleanup_inactive(&self, threshold: Duration) {
        self.submit_op(StoreOp::CleanupInactive { threshold });
    }

    /// Wait until every command submitted before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.submit(PresenceCommand::Barrier(tx)) {
            let _ = rx.await;
        }
    }

    fn submit_op(&self, op: StoreOp) {
        self.submit(PresenceCommand::Op(op));
    }

    fn submit(&self, command: PresenceCommand) -> bool {
        if self.tx.send(command).is_err() {
            warn!("Presence pipeline is gone; command dropped");
            return false;
        }
        true
    }
}

async fn apply(tracker: &Tracker, command: PresenceCommand, limit: Duration) {
    match command {
        PresenceCommand::Op(op) => {
            let name = op.name();
            bounded(name, limit, op.execute(tracker)).await;
        }
        PresenceCommand::Replay { client, done } => {
            bounded("replay", limit, replay(tracker, &client)).await;
            let _ = done.send(client.user_id().to_string());
        }
        PresenceCommand::Barrier(done) => {
            let _ = done.send(());
        }
    }
}

async fn bounded(
    op: &'static str,
    limit: Duration,
    work: impl Future<Output = Result<(), StoreError>>,
) {
    match timeout(limit, work).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(op, error = %e, "Presence operation failed"),
        Err(_) => warn!(op, timeout = ?limit, "Presence operation timed out"),
    }
}

async fn replay(tracker: &Tracker, client: &ClientHandle) -> Result<(), StoreError> {
    let user_id = client.user_id();
    let pending = tracker.get_pending(user_id).await?;
    if pending.is_empty() {
        return Ok(());
    }

    let mut delivered = 0usize;
    for envelope in &pending {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Failed to encode pending message");
                continue;
            }
        };
        if client.enqueue(frame) {
            delivered += 1;
            if let Some(id) = &envelope.message_id {
                tracker.mark_delivered(id).await?;
            }
        }
    }

    info!(
        user = %user_id,
        device = %client.device_id(),
        pending = pending.len(),
        delivered,
        "Replayed offline messages"
    );
    tracker.clear_pending(user_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use courier_protocol::{decode_server, MessageKind};

    fn tracker() -> (Arc<MemoryStore>, Tracker) {
        let store = Arc::new(MemoryStore::new());
        let tracker = Tracker::new(store.clone());
        (store, tracker)
    }

    fn envelope(to: &str, payload: &str) -> RelayEnvelope {
        RelayEnvelope::new(MessageKind::Message, "u2", to, payload)
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_offline() {
        let (store, tracker) = tracker();
        tracker.set_online("u1", "d1").await.unwrap();
        tracker.set_online("u1", "d2").await.unwrap();

        assert!(tracker.is_online("u1").await.unwrap());
        assert_eq!(tracker.list_online().await.unwrap(), vec!["u1"]);
        assert_eq!(tracker.active_devices("u1").await.unwrap(), vec!["d1", "d2"]);
        assert_eq!(
            tracker.user_status("u1").await.unwrap().unwrap().status,
            STATUS_ONLINE
        );
        assert_eq!(store.ttl(&keys::user("u1")), Some(PRESENCE_TTL));

        tracker.set_offline("u1").await.unwrap();
        tracker.set_offline("u1").await.unwrap();
        assert!(!tracker.is_online("u1").await.unwrap());
        assert!(tracker.active_devices("u1").await.unwrap().is_empty());
        assert_eq!(
            tracker.user_status("u1").await.unwrap().unwrap().status,
            STATUS_OFFLINE
        );
    }

    #[tokio::test]
    async fn test_update_status() {
        let (_, tracker) = tracker();
        assert!(tracker.user_status("u1").await.unwrap().is_none());

        tracker.set_online("u1", "d1").await.unwrap();
        tracker.update_status("u1", "away").await.unwrap();
        assert_eq!(tracker.user_status("u1").await.unwrap().unwrap().status, "away");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_oldest_first() {
        let (store, tracker) = tracker();
        for payload in ["m1", "m2", "m3"] {
            tracker.store_pending("u3", &envelope("u3", payload)).await.unwrap();
        }

        let pending = tracker.get_pending("u3").await.unwrap();
        let payloads: Vec<_> = pending.iter().map(|e| e.payload.as_str()).collect();
        assert_eq!(payloads, vec!["m1", "m2", "m3"]);
        assert_eq!(store.ttl(&keys::pending("u3")), Some(PENDING_TTL));

        tracker.clear_pending("u3").await.unwrap();
        assert!(tracker.get_pending("u3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_capped() {
        let (_, tracker) = tracker();
        for i in 0..(PENDING_CAPACITY + 5) {
            tracker
                .store_pending("u3", &envelope("u3", &i.to_string()))
                .await
                .unwrap();
        }

        let pending = tracker.get_pending("u3").await.unwrap();
        assert_eq!(pending.len(), PENDING_CAPACITY);
        assert_eq!(pending[0].payload, "5");
        assert_eq!(pending[PENDING_CAPACITY - 1].payload, "104");
    }

    #[tokio::test]
    async fn test_pending_skips_garbage() {
        let (store, tracker) = tracker();
        tracker.store_pending("u3", &envelope("u3", "ok")).await.unwrap();
        store.lpush(&keys::pending("u3"), "not json").await.unwrap();

        let pending = tracker.get_pending("u3").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, "ok");
    }

    #[tokio::test]
    async fn test_message_meta_lifecycle() {
        let (_, tracker) = tracker();
        assert!(tracker.message_meta("m-1").await.unwrap().is_none());

        tracker.record_message_meta("m-1", "u2", "u1").await.unwrap();
        let meta = tracker.message_meta("m-1").await.unwrap().unwrap();
        assert_eq!(meta.from, "u2");
        assert_eq!(meta.to, "u1");
        assert!(!meta.delivered && !meta.read);

        tracker.mark_delivered("m-1").await.unwrap();
        tracker.mark_read("m-1").await.unwrap();
        let meta = tracker.message_meta("m-1").await.unwrap().unwrap();
        assert!(meta.delivered && meta.delivered_at.is_some());
        assert!(meta.read && meta.read_at.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_inactive() {
        let (store, tracker) = tracker();
        tracker.set_online("fresh", "d1").await.unwrap();
        tracker.set_online("stale", "d1").await.unwrap();
        let old = (now_secs() - 3600).to_string();
        store
            .hset(&keys::user("stale"), &[("last_seen", old)])
            .await
            .unwrap();

        let removed = tracker
            .cleanup_inactive(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(tracker.list_online().await.unwrap(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_handle_applies_in_order() {
        let (_, tracker) = tracker();
        let handle = PresenceHandle::spawn(Arc::new(tracker));

        handle.set_online("u1", "d1");
        handle.update_status("u1", "busy");
        handle.set_offline("u1");
        handle.set_online("u1", "d2");
        handle.flush().await;

        let tracker = handle.tracker();
        assert!(tracker.is_online("u1").await.unwrap());
        assert_eq!(tracker.active_devices("u1").await.unwrap(), vec!["d2"]);
    }

    #[tokio::test]
    async fn test_replay_enqueues_and_clears() {
        let (_, tracker) = tracker();
        let handle = PresenceHandle::spawn(Arc::new(tracker));
        for (i, payload) in ["m1", "m2"].iter().enumerate() {
            let env = envelope("u3", payload).with_message_id(format!("id-{i}"));
            handle.record_message_meta(&format!("id-{i}"), "u2", "u3");
            handle.store_pending(env);
        }

        let (client, mut outbound) = ClientHandle::new("u3", "d1", 8);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        assert!(handle.replay_pending(client, done_tx));
        handle.flush().await;
        assert_eq!(done_rx.try_recv().unwrap(), "u3");

        for (i, expected) in ["m1", "m2"].iter().enumerate() {
            let frame = decode_server(&outbound.recv().await.unwrap()).unwrap();
            assert_eq!(frame.payload, *expected);
            assert_eq!(frame.message_id, format!("id-{i}"));
        }
        let tracker = handle.tracker();
        assert!(tracker.get_pending("u3").await.unwrap().is_empty());
        assert!(tracker.message_meta("id-0").await.unwrap().unwrap().delivered);
    }

    /// A store whose every call hangs.
    struct StalledStore;

    #[async_trait]
    impl KeyValueStore for StalledStore {
        async fn hset(&self, _: &str, _: &[(&str, String)]) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn hgetall(&self, _: &str) -> Result<HashMap<String, String>, StoreError> {
            std::future::pending().await
        }
        async fn sadd(&self, _: &str, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn srem(&self, _: &str, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn smembers(&self, _: &str) -> Result<Vec<String>, StoreError> {
            std::future::pending().await
        }
        async fn sismember(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn lpush(&self, _: &str, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn ltrim(&self, _: &str, _: isize, _: isize) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn lrange(&self, _: &str, _: isize, _: isize) -> Result<Vec<String>, StoreError> {
            std::future::pending().await
        }
        async fn del(&self, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_times_out() {
        let limit = Duration::from_millis(200);
        let handle = PresenceHandle::spawn_with_timeout(
            Arc::new(Tracker::new(Arc::new(StalledStore))),
            limit,
        );

        let started = tokio::time::Instant::now();
        handle.set_online("u1", "d1");
        let (client, _outbound) = ClientHandle::new("u1", "d1", 8);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        assert!(handle.replay_pending(client, done_tx));
        handle.heartbeat("u1");
        handle.flush().await;

        assert!(started.elapsed() >= limit * 3);
        assert_eq!(done_rx.try_recv().unwrap(), "u1");
    }
}
