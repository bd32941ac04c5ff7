//! Fixtures shared by the Courier benchmarks.

use courier_core::{ClientHandle, Hub, HubConfig, HubHandle, RelayEnvelope};
use courier_protocol::MessageKind;

/// Start a hub without presence on the current runtime.
#[must_use]
pub fn spawn_hub() -> HubHandle {
    let (hub, handle) = Hub::new(HubConfig::default(), None);
    hub.spawn();
    handle
}

/// Register `devices` devices for `user` and drain their queues in the
/// background so fan-out never hits a full queue.
pub async fn register_devices(hub: &HubHandle, user: &str, devices: usize) -> Vec<ClientHandle> {
    let mut handles = Vec::with_capacity(devices);
    for i in 0..devices {
        let (handle, mut outbound) = ClientHandle::new(user, format!("d{i}"), 1024);
        tokio::spawn(async move { while outbound.recv().await.is_some() {} });
        if hub.register(handle.clone()).await.is_err() {
            break;
        }
        handles.push(handle);
    }
    handles
}

/// A chat message of `size` payload bytes.
#[must_use]
pub fn message(to: &str, size: usize) -> RelayEnvelope {
    RelayEnvelope::new(MessageKind::Message, "sender", to, "x".repeat(size))
}
