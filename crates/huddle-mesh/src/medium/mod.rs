//! The shared signaling medium: key-addressed records with prefix
//! subscriptions and disconnect-triggered writes.
//!
//! Two implementations ship with the crate: [`memory::MemoryMedium`], an
//! in-process store whose clients can be severed to simulate a dropped
//! connection, and [`relay::RelayMedium`], a WebSocket client of the relay
//! server.

pub mod memory;
pub mod relay;

use async_trait::async_trait;
use huddle_common::{DisconnectWrite, Key, MediumError, MediumEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Medium
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SignalingMedium: Send + Sync + 'static {
    /// Create or overwrite the record at `key`.
    async fn put(&self, key: &Key, value: serde_json::Value) -> Result<(), MediumError>;

    /// Delete the record at `key` and every record below it.
    async fn delete(&self, key: &Key) -> Result<(), MediumError>;

    /// Append `value` to the list at `list`. Returns the generated entry key;
    /// entries of one list are delivered in append order.
    async fn append(&self, list: &Key, value: serde_json::Value) -> Result<Key, MediumError>;

    /// Subscribe to every record at or below `prefix`. Existing records are
    /// delivered first as `Added` events.
    async fn subscribe(&self, prefix: &Key) -> Result<Subscription, MediumError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(self.subscribe_into(prefix, tx).await?.with_events(rx))
    }

    /// Like [`SignalingMedium::subscribe`], but deliver into `events`. Several
    /// subscriptions may share one channel; their events then arrive in the
    /// order the medium committed them.
    async fn subscribe_into(
        &self,
        prefix: &Key,
        events: mpsc::UnboundedSender<MediumEvent>,
    ) -> Result<Subscription, MediumError>;

    /// Have the medium perform `write` on `key` if this client's connection
    /// drops. Replaces any write previously registered for `key`.
    async fn register_disconnect_write(
        &self,
        key: &Key,
        write: DisconnectWrite,
    ) -> Result<(), MediumError>;

    async fn cancel_disconnect_write(&self, key: &Key) -> Result<(), MediumError>;

    /// Connection state of this client. Flips to `true` again after a
    /// reconnect; live subscriptions then re-deliver their snapshot.
    fn connectivity(&self) -> watch::Receiver<bool>;
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live prefix subscription. Dropping it unsubscribes.
///
/// A subscription opened with [`SignalingMedium::subscribe_into`] carries
/// no receiver of its own; it only keeps the registration alive.
pub struct Subscription {
    prefix: Key,
    events: Option<mpsc::UnboundedReceiver<MediumEvent>>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(prefix: Key, on_drop: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            prefix,
            events: None,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedReceiver<MediumEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn prefix(&self) -> &Key {
        &self.prefix
    }

    /// Wait for the next event. `None` once the medium side is gone or when
    /// the events go to a shared channel.
    pub async fn next(&mut self) -> Option<MediumEvent> {
        match &mut self.events {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Take every event that is already queued without waiting.
    pub fn drain_ready(&mut self) -> Vec<MediumEvent> {
        let mut ready = Vec::new();
        if let Some(events) = &mut self.events {
            while let Ok(event) = events.try_recv() {
                ready.push(event);
            }
        }
        ready
    }

    /// Move the subscription into a task that pushes each event, mapped by
    /// `wrap`, into `tx`. The subscription ends when the task is dropped.
    pub fn forward<T, F>(mut self, tx: mpsc::UnboundedSender<T>, wrap: F) -> Forwarder
    where
        T: Send + 'static,
        F: Fn(MediumEvent) -> T + Send + 'static,
    {
        Forwarder(tokio::spawn(async move {
            while let Some(event) = self.next().await {
                if tx.send(wrap(event)).is_err() {
                    break;
                }
            }
        }))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Background task that is aborted when dropped.
#[derive(Debug)]
pub struct Forwarder(JoinHandle<()>);

impl Forwarder {
    pub fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.0.abort();
    }
}
