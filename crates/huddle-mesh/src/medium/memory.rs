//! In-process signaling medium.
//!
//! All clients share one [`RecordStore`]. A client can be severed, which
//! behaves like a dropped network connection: its disconnect writes fire,
//! further operations fail, and its subscriptions stop receiving events
//! until the client is restored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use huddle_common::{
    ConnectionId, Delivery, DisconnectWrite, Key, MediumError, MediumEvent, RecordStore,
    SubscriptionId,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::{SignalingMedium, Subscription};

struct Route {
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<MediumEvent>,
}

struct ClientSlot {
    online: bool,
    connectivity: watch::Sender<bool>,
}

#[derive(Default)]
struct Hub {
    store: RecordStore,
    routes: HashMap<SubscriptionId, Route>,
    clients: HashMap<ConnectionId, ClientSlot>,
    next_connection: ConnectionId,
}

impl Hub {
    fn route(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let Some(route) = self.routes.get(&delivery.subscription) else {
                continue;
            };
            let online = self
                .clients
                .get(&route.connection)
                .is_some_and(|c| c.online);
            if online && route.tx.send(delivery.event).is_err() {
                // Receiver dropped without unsubscribing; forget the route.
                self.routes.remove(&delivery.subscription);
            }
        }
    }

    fn ensure_online(&self, connection: ConnectionId) -> Result<(), MediumError> {
        match self.clients.get(&connection) {
            Some(slot) if slot.online => Ok(()),
            _ => Err(MediumError::Disconnected),
        }
    }
}

// ---------------------------------------------------------------------------
// Medium
// ---------------------------------------------------------------------------

/// Shared in-process medium. Cheap to clone; every clone sees the same
/// records.
#[derive(Clone, Default)]
pub struct MemoryMedium {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection.
    pub fn connect(&self) -> MemoryClient {
        let mut hub = self.lock();
        hub.next_connection += 1;
        let connection = hub.next_connection;
        let (connectivity, _) = watch::channel(true);
        hub.clients.insert(
            connection,
            ClientSlot {
                online: true,
                connectivity,
            },
        );
        debug!(connection, "Memory client connected");
        MemoryClient {
            connection,
            hub: Arc::clone(&self.hub),
        }
    }

    /// Current value at `key`, read outside any client.
    pub fn get(&self, key: &Key) -> Option<serde_json::Value> {
        self.lock().store.get(key).cloned()
    }

    /// Every record at or below `prefix`.
    pub fn records_under(&self, prefix: &Key) -> Vec<(Key, serde_json::Value)> {
        self.lock()
            .store
            .snapshot(prefix)
            .into_iter()
            .filter_map(|event| match event {
                MediumEvent::Added { key, value } => Some((key, value)),
                MediumEvent::Removed { .. } => None,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        lock_hub(&self.hub)
    }
}

fn lock_hub(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    // A panic while holding the lock leaves the hub consistent: every
    // mutation is applied to the store before deliveries are routed.
    hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One client connection to a [`MemoryMedium`]. Dropping the client is a
/// disconnect that never comes back.
pub struct MemoryClient {
    connection: ConnectionId,
    hub: Arc<Mutex<Hub>>,
}

impl MemoryClient {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Drop the connection without any explicit cleanup.
    pub fn sever(&self) {
        let mut hub = lock_hub(&self.hub);
        let Some(slot) = hub.clients.get_mut(&self.connection) else {
            return;
        };
        if !slot.online {
            return;
        }
        slot.online = false;
        slot.connectivity.send_replace(false);
        let deliveries = hub.store.fire_disconnect_writes(self.connection);
        hub.route(deliveries);
        info!(connection = self.connection, "Memory client severed");
    }

    /// Reconnect a severed client and resync its subscriptions.
    pub fn restore(&self) {
        let mut hub = lock_hub(&self.hub);
        let Some(slot) = hub.clients.get_mut(&self.connection) else {
            return;
        };
        if slot.online {
            return;
        }
        slot.online = true;
        slot.connectivity.send_replace(true);
        for subscription in hub.store.subscriptions_of(self.connection) {
            let snapshot = hub.store.resync(subscription);
            if let Some(route) = hub.routes.get(&subscription) {
                for event in snapshot {
                    let _ = route.tx.send(event);
                }
            }
        }
        info!(connection = self.connection, "Memory client restored");
    }

    pub fn is_online(&self) -> bool {
        lock_hub(&self.hub)
            .clients
            .get(&self.connection)
            .is_some_and(|c| c.online)
    }

    pub fn pending_disconnect_writes(&self) -> usize {
        lock_hub(&self.hub)
            .store
            .pending_disconnect_writes(self.connection)
    }

    fn with_online<T>(
        &self,
        op: impl FnOnce(&mut Hub) -> T,
    ) -> Result<T, MediumError> {
        let mut hub = lock_hub(&self.hub);
        hub.ensure_online(self.connection)?;
        Ok(op(&mut hub))
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        let mut hub = lock_hub(&self.hub);
        let deliveries = hub.store.drop_connection(self.connection);
        let connection = self.connection;
        hub.routes.retain(|_, route| route.connection != connection);
        if let Some(slot) = hub.clients.remove(&connection) {
            slot.connectivity.send_replace(false);
        }
        hub.route(deliveries);
    }
}

#[async_trait]
impl SignalingMedium for MemoryClient {
    async fn put(&self, key: &Key, value: serde_json::Value) -> Result<(), MediumError> {
        self.with_online(|hub| {
            let deliveries = hub.store.put(key.clone(), value);
            hub.route(deliveries);
        })
    }

    async fn delete(&self, key: &Key) -> Result<(), MediumError> {
        self.with_online(|hub| {
            let deliveries = hub.store.delete(key);
            hub.route(deliveries);
        })
    }

    async fn append(&self, list: &Key, value: serde_json::Value) -> Result<Key, MediumError> {
        self.with_online(|hub| {
            let (entry, deliveries) = hub.store.append(list, value);
            hub.route(deliveries);
            entry
        })
    }

    async fn subscribe_into(
        &self,
        prefix: &Key,
        tx: mpsc::UnboundedSender<MediumEvent>,
    ) -> Result<Subscription, MediumError> {
        let id = self.with_online(|hub| {
            let (id, initial) = hub.store.subscribe(self.connection, prefix.clone());
            for event in initial {
                let _ = tx.send(event);
            }
            hub.routes.insert(
                id,
                Route {
                    connection: self.connection,
                    tx,
                },
            );
            id
        })?;

        let hub = Arc::clone(&self.hub);
        Ok(Subscription::new(prefix.clone(), move || {
            let mut hub = lock_hub(&hub);
            hub.routes.remove(&id);
            hub.store.unsubscribe(id);
        }))
    }

    async fn register_disconnect_write(
        &self,
        key: &Key,
        write: DisconnectWrite,
    ) -> Result<(), MediumError> {
        self.with_online(|hub| {
            hub.store
                .register_disconnect_write(self.connection, key.clone(), write)
        })
    }

    async fn cancel_disconnect_write(&self, key: &Key) -> Result<(), MediumError> {
        self.with_online(|hub| {
            hub.store.cancel_disconnect_write(self.connection, key);
        })
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        match lock_hub(&self.hub).clients.get(&self.connection) {
            Some(slot) => slot.connectivity.subscribe(),
            None => watch::channel(false).1,
        }
    }
}
