//! Record store engine shared by the in-process medium and the relay server.
//!
//! Holds key-addressed records, prefix subscriptions and per-connection
//! disconnect writes. Mutations return the deliveries they cause; the caller
//! owns the actual channels and routes each delivery to its subscriber.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::key::Key;
use crate::records::resolve_server_values;

pub type ConnectionId = u64;
pub type SubscriptionId = u64;

/// A change observed by a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediumEvent {
    /// A record was created or overwritten.
    Added { key: Key, value: serde_json::Value },
    /// A record was deleted.
    Removed { key: Key },
}

impl MediumEvent {
    pub fn key(&self) -> &Key {
        match self {
            Self::Added { key, .. } | Self::Removed { key } => key,
        }
    }
}

/// A write the store performs on behalf of a connection once that
/// connection is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DisconnectWrite {
    Put { value: serde_json::Value },
    Delete,
}

/// An event addressed to one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub event: MediumEvent,
}

struct Subscriber {
    connection: ConnectionId,
    prefix: Key,
}

#[derive(Default)]
pub struct RecordStore {
    records: BTreeMap<Key, serde_json::Value>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    disconnect_writes: HashMap<ConnectionId, BTreeMap<Key, DisconnectWrite>>,
    next_subscription: SubscriptionId,
    next_entry: u64,
    last_timestamp: u64,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds since the epoch, strictly increasing across calls.
    pub fn now(&mut self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.last_timestamp = wall.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    pub fn get(&self, key: &Key) -> Option<&serde_json::Value> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every record at or below `prefix`, in key order.
    pub fn snapshot(&self, prefix: &Key) -> Vec<MediumEvent> {
        self.records
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.as_str().starts_with(prefix.as_str()))
            .filter(|(k, _)| k.is_within(prefix))
            .map(|(k, v)| MediumEvent::Added {
                key: k.clone(),
                value: v.clone(),
            })
            .collect()
    }

    pub fn put(&mut self, key: Key, mut value: serde_json::Value) -> Vec<Delivery> {
        let now = self.now();
        resolve_server_values(&mut value, now);
        // A record replaces anything stored below it.
        let mut deliveries = self.remove_below(&key);
        self.records.insert(key.clone(), value.clone());
        deliveries.extend(self.fan_out(MediumEvent::Added { key, value }));
        deliveries
    }

    /// Delete `key` and everything below it.
    pub fn delete(&mut self, key: &Key) -> Vec<Delivery> {
        let mut removed: Vec<Key> = self
            .records
            .range(key.clone()..)
            .take_while(|(k, _)| k.as_str().starts_with(key.as_str()))
            .filter(|(k, _)| k.is_within(key))
            .map(|(k, _)| k.clone())
            .collect();
        removed.sort();

        let mut deliveries = Vec::new();
        for k in removed {
            self.records.remove(&k);
            deliveries.extend(self.fan_out(MediumEvent::Removed { key: k }));
        }
        deliveries
    }

    /// Append `value` under `list` with a fresh, lexically increasing entry id.
    pub fn append(&mut self, list: &Key, value: serde_json::Value) -> (Key, Vec<Delivery>) {
        self.next_entry += 1;
        let entry = list.child(format!("{:020}", self.next_entry));
        let deliveries = self.put(entry.clone(), value);
        (entry, deliveries)
    }

    /// Register a subscription. Returns its id and the initial snapshot.
    pub fn subscribe(&mut self, connection: ConnectionId, prefix: Key) -> (SubscriptionId, Vec<MediumEvent>) {
        self.next_subscription += 1;
        let id = self.next_subscription;
        let initial = self.snapshot(&prefix);
        debug!(subscription = id, connection, prefix = %prefix, records = initial.len(), "Subscribed");
        self.subscribers.insert(id, Subscriber { connection, prefix });
        (id, initial)
    }

    pub fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool {
        self.subscribers.remove(&subscription).is_some()
    }

    /// Snapshot for an existing subscription (used to resync after reconnect).
    pub fn resync(&self, subscription: SubscriptionId) -> Vec<MediumEvent> {
        self.subscribers
            .get(&subscription)
            .map(|s| self.snapshot(&s.prefix))
            .unwrap_or_default()
    }

    /// Subscriptions owned by `connection`.
    pub fn subscriptions_of(&self, connection: ConnectionId) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self
            .subscribers
            .iter()
            .filter(|(_, s)| s.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn register_disconnect_write(&mut self, connection: ConnectionId, key: Key, write: DisconnectWrite) {
        self.disconnect_writes
            .entry(connection)
            .or_default()
            .insert(key, write);
    }

    /// Returns true if a pending write was cancelled.
    pub fn cancel_disconnect_write(&mut self, connection: ConnectionId, key: &Key) -> bool {
        let Some(writes) = self.disconnect_writes.get_mut(&connection) else {
            return false;
        };
        let removed = writes.remove(key).is_some();
        if writes.is_empty() {
            self.disconnect_writes.remove(&connection);
        }
        removed
    }

    pub fn pending_disconnect_writes(&self, connection: ConnectionId) -> usize {
        self.disconnect_writes
            .get(&connection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Commit every write `connection` registered. Subscriptions survive.
    pub fn fire_disconnect_writes(&mut self, connection: ConnectionId) -> Vec<Delivery> {
        let writes = self.disconnect_writes.remove(&connection).unwrap_or_default();
        let mut deliveries = Vec::new();
        for (key, write) in writes {
            debug!(connection, key = %key, "Committing disconnect write");
            match write {
                DisconnectWrite::Put { value } => deliveries.extend(self.put(key, value)),
                DisconnectWrite::Delete => deliveries.extend(self.delete(&key)),
            }
        }
        deliveries
    }

    /// Forget a connection entirely: commit its disconnect writes and drop
    /// its subscriptions. Deliveries to the dropped subscriptions are
    /// filtered out.
    pub fn drop_connection(&mut self, connection: ConnectionId) -> Vec<Delivery> {
        for id in self.subscriptions_of(connection) {
            self.subscribers.remove(&id);
        }
        self.fire_disconnect_writes(connection)
    }

    fn remove_below(&mut self, key: &Key) -> Vec<Delivery> {
        let below: Vec<Key> = self
            .records
            .range(key.clone()..)
            .take_while(|(k, _)| k.as_str().starts_with(key.as_str()))
            .filter(|(k, _)| *k != key && k.is_within(key))
            .map(|(k, _)| k.clone())
            .collect();
        let mut deliveries = Vec::new();
        for k in below {
            self.records.remove(&k);
            deliveries.extend(self.fan_out(MediumEvent::Removed { key: k }));
        }
        deliveries
    }

    fn fan_out(&self, event: MediumEvent) -> Vec<Delivery> {
        let mut targets: Vec<SubscriptionId> = self
            .subscribers
            .iter()
            .filter(|(_, s)| event.key().is_within(&s.prefix))
            .map(|(id, _)| *id)
            .collect();
        targets.sort_unstable();
        targets
            .into_iter()
            .map(|subscription| Delivery {
                subscription,
                event: event.clone(),
            })
            .collect()
    }
}
