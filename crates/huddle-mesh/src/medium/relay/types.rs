//! Configuration and shared state for the relay medium client.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use huddle_common::{Key, MediumError, MediumEvent};
use huddle_config::RelayConfig;
use tokio::sync::{mpsc, oneshot};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection settings for [`super::RelayMedium`].
#[derive(Debug, Clone)]
pub struct RelayMediumConfig {
    /// `ws://` or `wss://` URL of the relay.
    pub url: String,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Reconnect base delay in seconds.
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect delay in seconds.
    pub max_reconnect_delay_secs: u64,
    /// How long a request waits for its acknowledgement.
    pub request_timeout: Duration,
}

impl Default for RelayMediumConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RelayMediumConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            url: config.url.clone(),
            heartbeat_interval_secs: u64::from(config.heartbeat_interval),
            reconnect_delay_secs: u64::from(config.reconnect_delay),
            max_reconnect_delay_secs: u64::from(config.max_reconnect_delay),
            request_timeout: Duration::from_secs(u64::from(config.request_timeout)),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared State
// ---------------------------------------------------------------------------

/// Outcome of an acknowledged request: the generated key for appends.
pub(crate) type Reply = Result<Option<Key>, MediumError>;

/// A subscription that is re-sent on every reconnect.
pub(crate) struct LiveSubscription {
    pub(crate) prefix: Key,
    pub(crate) tx: mpsc::UnboundedSender<MediumEvent>,
}

/// State shared between the client handle and the connection task.
#[derive(Default)]
pub(crate) struct Pending {
    pub(crate) requests: HashMap<u64, oneshot::Sender<Reply>>,
    pub(crate) subscriptions: HashMap<u64, LiveSubscription>,
    /// Set while the relay keeps refusing the handshake as unauthorized.
    pub(crate) refusal: Option<String>,
}

impl Pending {
    /// Fail every outstanding request; the connection they were sent on is gone.
    pub(crate) fn fail_requests(&mut self) {
        for (_, reply) in self.requests.drain() {
            let _ = reply.send(Err(MediumError::Disconnected));
        }
    }
}

pub(crate) fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
