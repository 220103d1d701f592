//! Hub: the relay's shared record store plus the outbound channel of every
//! connected client.

use std::collections::HashMap;
use std::sync::Arc;

use huddle_common::wire::{ClientFrame, ServerFrame};
use huddle_common::{ConnectionId, Delivery, Key, MediumEvent, RecordStore, SubscriptionId};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

struct Client {
    tx: mpsc::UnboundedSender<ServerFrame>,
    /// Client-chosen subscription id to store subscription.
    subscriptions: HashMap<u64, SubscriptionId>,
}

#[derive(Default)]
struct HubState {
    store: RecordStore,
    clients: HashMap<ConnectionId, Client>,
    /// Store subscription to its owner and the id the owner chose.
    routes: HashMap<SubscriptionId, (ConnectionId, u64)>,
    next_connection: ConnectionId,
}

/// Thread-safe hub shared by every connection task.
#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client. Frames addressed to it arrive on the returned
    /// receiver.
    pub async fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;
        state.next_connection += 1;
        let connection = state.next_connection;
        state.clients.insert(
            connection,
            Client {
                tx,
                subscriptions: HashMap::new(),
            },
        );
        (connection, rx)
    }

    /// Apply one client frame.
    ///
    /// Replies and the deliveries a mutation causes are queued while the
    /// write lock is held, so every client observes commits in one global
    /// order and receives a subscription's snapshot before its ack.
    pub async fn apply(&self, connection: ConnectionId, frame: ClientFrame) {
        self.state.write().await.apply(connection, frame);
    }

    /// Answer a frame that could not be parsed.
    pub async fn reject(&self, connection: ConnectionId, msg_ref: Option<u64>, message: String) {
        self.state
            .read()
            .await
            .send(connection, ServerFrame::Error { msg_ref, message });
    }

    /// Forget a client: drop its subscriptions and commit its disconnect
    /// writes, notifying everyone else.
    pub async fn disconnect(&self, connection: ConnectionId) {
        let mut state = self.state.write().await;
        let Some(client) = state.clients.remove(&connection) else {
            return;
        };
        for subscription in client.subscriptions.values() {
            state.routes.remove(subscription);
        }
        let deliveries = state.store.drop_connection(connection);
        debug!(connection, deliveries = deliveries.len(), "Connection dropped");
        state.route(deliveries);
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.store.len()
    }

    pub async fn get(&self, key: &Key) -> Option<serde_json::Value> {
        self.state.read().await.store.get(key).cloned()
    }
}

impl HubState {
    fn apply(&mut self, connection: ConnectionId, frame: ClientFrame) {
        if !self.clients.contains_key(&connection) {
            return;
        }
        match frame {
            ClientFrame::Put {
                msg_ref,
                key,
                value,
            } => {
                let deliveries = self.store.put(key, value);
                self.route(deliveries);
                self.ack(connection, msg_ref, None);
            }
            ClientFrame::Delete { msg_ref, key } => {
                let deliveries = self.store.delete(&key);
                self.route(deliveries);
                self.ack(connection, msg_ref, None);
            }
            ClientFrame::Append {
                msg_ref,
                key,
                value,
            } => {
                let (entry, deliveries) = self.store.append(&key, value);
                self.route(deliveries);
                self.ack(connection, msg_ref, Some(entry));
            }
            ClientFrame::Subscribe {
                msg_ref,
                sub,
                prefix,
            } => {
                // A resubscribe after reconnect reuses the client's id.
                self.unsubscribe(connection, sub);
                let (id, initial) = self.store.subscribe(connection, prefix);
                self.routes.insert(id, (connection, sub));
                if let Some(client) = self.clients.get_mut(&connection) {
                    client.subscriptions.insert(sub, id);
                }
                for event in initial {
                    self.send(connection, event_frame(sub, event));
                }
                self.ack(connection, msg_ref, None);
            }
            ClientFrame::Unsubscribe { sub } => self.unsubscribe(connection, sub),
            ClientFrame::OnDisconnect {
                msg_ref,
                key,
                write,
            } => {
                self.store.register_disconnect_write(connection, key, write);
                self.ack(connection, msg_ref, None);
            }
            ClientFrame::CancelOnDisconnect { msg_ref, key } => {
                self.store.cancel_disconnect_write(connection, &key);
                self.ack(connection, msg_ref, None);
            }
            ClientFrame::Ping => self.send(connection, ServerFrame::Pong),
        }
    }

    fn unsubscribe(&mut self, connection: ConnectionId, sub: u64) {
        let removed = self
            .clients
            .get_mut(&connection)
            .and_then(|client| client.subscriptions.remove(&sub));
        if let Some(id) = removed {
            self.store.unsubscribe(id);
            self.routes.remove(&id);
        }
    }

    fn route(&self, deliveries: Vec<Delivery>) {
        for Delivery {
            subscription,
            event,
        } in deliveries
        {
            if let Some(&(connection, sub)) = self.routes.get(&subscription) {
                self.send(connection, event_frame(sub, event));
            }
        }
    }

    fn ack(&self, connection: ConnectionId, msg_ref: u64, key: Option<Key>) {
        self.send(connection, ServerFrame::Ack { msg_ref, key });
    }

    fn send(&self, connection: ConnectionId, frame: ServerFrame) {
        if let Some(client) = self.clients.get(&connection) {
            // The connection task may already be gone; disconnect follows.
            let _ = client.tx.send(frame);
        }
    }
}

fn event_frame(sub: u64, event: MediumEvent) -> ServerFrame {
    match event {
        MediumEvent::Added { key, value } => ServerFrame::Added { sub, key, value },
        MediumEvent::Removed { key } => ServerFrame::Removed { sub, key },
    }
}
