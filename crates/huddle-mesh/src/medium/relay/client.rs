//! Public handle for the relay-backed signaling medium.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use huddle_common::wire::ClientFrame;
use huddle_common::{DisconnectWrite, Key, MediumError, MediumEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::connection::{connection_loop, next_ref};
use super::types::{lock, LiveSubscription, Pending, RelayMediumConfig, Reply};
use crate::medium::{SignalingMedium, Subscription};

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Signaling medium backed by a huddle relay server.
///
/// All operations are forwarded to a background connection task. While the
/// socket is down they fail fast with [`MediumError::Disconnected`], or with
/// [`MediumError::Unauthorized`] when the relay refused the handshake.
pub struct RelayMedium {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    pending: Arc<Mutex<Pending>>,
    connectivity: watch::Receiver<bool>,
    request_timeout: Duration,
    next_sub: AtomicU64,
    task: JoinHandle<()>,
}

impl RelayMedium {
    /// Start the background connection. Returns immediately; watch
    /// [`SignalingMedium::connectivity`] or call [`Self::wait_connected`] to
    /// know when the relay is reachable.
    pub fn connect(config: RelayMediumConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (connectivity_tx, connectivity) = watch::channel(false);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let request_timeout = config.request_timeout;

        let task = tokio::spawn(connection_loop(
            config,
            Arc::clone(&pending),
            connectivity_tx,
            outbound_rx,
        ));

        Self {
            outbound,
            pending,
            connectivity,
            request_timeout,
            next_sub: AtomicU64::new(1),
            task,
        }
    }

    /// Wait until the relay connection is up, at most `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connectivity.clone();
        tokio::time::timeout(timeout, rx.wait_for(|up| *up))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Stop the connection task. The relay commits this client's disconnect
    /// writes once it notices the socket is gone.
    pub fn disconnect(&self) {
        self.task.abort();
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Reply {
        if !*self.connectivity.borrow() {
            return Err(match lock(&self.pending).refusal.clone() {
                Some(reason) => MediumError::Unauthorized(reason),
                None => MediumError::Disconnected,
            });
        }

        let msg_ref = next_ref();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).requests.insert(msg_ref, tx);

        if self.outbound.send(build(msg_ref)).is_err() {
            lock(&self.pending).requests.remove(&msg_ref);
            return Err(MediumError::Disconnected);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(MediumError::Disconnected),
            Err(_) => {
                lock(&self.pending).requests.remove(&msg_ref);
                Err(MediumError::Transport(format!(
                    "no acknowledgement within {}s",
                    self.request_timeout.as_secs()
                )))
            }
        }
    }
}

impl Drop for RelayMedium {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl SignalingMedium for RelayMedium {
    async fn put(&self, key: &Key, value: serde_json::Value) -> Result<(), MediumError> {
        self.request(|msg_ref| ClientFrame::Put {
            msg_ref,
            key: key.clone(),
            value,
        })
        .await
        .map(|_| ())
    }

    async fn delete(&self, key: &Key) -> Result<(), MediumError> {
        self.request(|msg_ref| ClientFrame::Delete {
            msg_ref,
            key: key.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn append(&self, list: &Key, value: serde_json::Value) -> Result<Key, MediumError> {
        self.request(|msg_ref| ClientFrame::Append {
            msg_ref,
            key: list.clone(),
            value,
        })
        .await?
        .ok_or_else(|| MediumError::Rejected("append acknowledged without an entry key".into()))
    }

    async fn subscribe_into(
        &self,
        prefix: &Key,
        tx: mpsc::UnboundedSender<MediumEvent>,
    ) -> Result<Subscription, MediumError> {
        let sub = self.next_sub.fetch_add(1, Ordering::Relaxed);
        lock(&self.pending).subscriptions.insert(
            sub,
            LiveSubscription {
                prefix: prefix.clone(),
                tx,
            },
        );

        if let Err(e) = self
            .request(|msg_ref| ClientFrame::Subscribe {
                msg_ref,
                sub,
                prefix: prefix.clone(),
            })
            .await
        {
            lock(&self.pending).subscriptions.remove(&sub);
            return Err(e);
        }

        let pending = Arc::clone(&self.pending);
        let outbound = self.outbound.clone();
        Ok(Subscription::new(prefix.clone(), move || {
            lock(&pending).subscriptions.remove(&sub);
            let _ = outbound.send(ClientFrame::Unsubscribe { sub });
        }))
    }

    async fn register_disconnect_write(
        &self,
        key: &Key,
        write: DisconnectWrite,
    ) -> Result<(), MediumError> {
        self.request(|msg_ref| ClientFrame::OnDisconnect {
            msg_ref,
            key: key.clone(),
            write,
        })
        .await
        .map(|_| ())
    }

    async fn cancel_disconnect_write(&self, key: &Key) -> Result<(), MediumError> {
        self.request(|msg_ref| ClientFrame::CancelOnDisconnect {
            msg_ref,
            key: key.clone(),
        })
        .await
        .map(|_| ())
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_fail_fast_while_disconnected() {
        let medium = RelayMedium::connect(RelayMediumConfig {
            // Nothing listens on port 9 of the loopback interface.
            url: "ws://127.0.0.1:9".into(),
            ..RelayMediumConfig::default()
        });
        let key = Key::parse("status/a").unwrap();
        assert_eq!(
            medium.put(&key, serde_json::json!({})).await.unwrap_err(),
            MediumError::Disconnected
        );
        assert!(medium.subscribe(&key).await.is_err());
        assert!(lock(&medium.pending).subscriptions.is_empty());
        assert!(!*medium.connectivity().borrow());
    }

    #[tokio::test]
    async fn refused_handshake_surfaces_as_unauthorized() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        let medium = RelayMedium::connect(RelayMediumConfig {
            url: format!("ws://{addr}"),
            ..RelayMediumConfig::default()
        });
        let key = Key::parse("status/a").unwrap();
        let error = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match medium.subscribe(&key).await {
                    Err(MediumError::Unauthorized(reason)) => break reason,
                    _ => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        })
        .await
        .expect("handshake refusal was never reported");
        assert!(error.contains("401"));
        assert!(!*medium.connectivity().borrow());
    }
}
