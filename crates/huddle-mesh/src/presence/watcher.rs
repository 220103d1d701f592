//! Follows every presence record on the medium.

use std::collections::HashMap;
use std::sync::Arc;

use huddle_common::key::layout;
use huddle_common::{MediumError, MediumEvent, ParticipantId, PresenceRecord};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use super::types::PresenceEvent;
use crate::medium::{Forwarder, SignalingMedium};

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Maintains the set of known presence records and reports changes.
pub struct PresenceWatcher {
    records: Arc<RwLock<HashMap<ParticipantId, PresenceRecord>>>,
    _task: Forwarder,
}

impl PresenceWatcher {
    /// Subscribe to `status/` and start translating record changes into
    /// [`PresenceEvent`]s.
    pub async fn start(
        medium: &dyn SignalingMedium,
    ) -> Result<(Self, mpsc::Receiver<PresenceEvent>), MediumError> {
        let mut subscription = medium.subscribe(&layout::presence_root()).await?;
        let (event_tx, event_rx) = mpsc::channel(256);
        let records = Arc::new(RwLock::new(HashMap::new()));

        let task_records = Arc::clone(&records);
        let task = Forwarder::spawn(async move {
            while let Some(event) = subscription.next().await {
                if let Some(change) = apply(&task_records, event).await {
                    if event_tx.send(change).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                records,
                _task: task,
            },
            event_rx,
        ))
    }

    /// Participants whose latest record says online.
    pub async fn online_participants(&self) -> Vec<ParticipantId> {
        let mut online: Vec<ParticipantId> = self
            .records
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.is_online)
            .map(|(p, _)| p.clone())
            .collect();
        online.sort();
        online
    }

    pub async fn is_online(&self, participant: &ParticipantId) -> bool {
        self.records
            .read()
            .await
            .get(participant)
            .is_some_and(|r| r.is_online)
    }

    pub async fn record(&self, participant: &ParticipantId) -> Option<PresenceRecord> {
        self.records.read().await.get(participant).cloned()
    }
}

/// Fold one medium event into `records`. Returns an event when the stored
/// record for that participant changed.
async fn apply(
    records: &RwLock<HashMap<ParticipantId, PresenceRecord>>,
    event: MediumEvent,
) -> Option<PresenceEvent> {
    match event {
        MediumEvent::Added { key, value } => {
            let root = layout::presence_root();
            let rest = key.relative_to(&root)?;
            let [participant] = rest.as_slice() else {
                debug!(key = %key, "Ignoring nested presence key");
                return None;
            };
            let participant = ParticipantId::from(participant.as_str());
            let record = match PresenceRecord::from_value(&key, &value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed presence record");
                    return None;
                }
            };

            let mut map = records.write().await;
            if map.get(&participant) == Some(&record) {
                return None;
            }
            map.insert(participant.clone(), record.clone());
            let last_changed = record.last_changed.millis();
            Some(if record.is_online {
                PresenceEvent::Online {
                    participant,
                    last_changed,
                }
            } else {
                PresenceEvent::Offline {
                    participant,
                    last_changed,
                }
            })
        }
        MediumEvent::Removed { key } => {
            let participant = ParticipantId::from(key.last());
            let removed = records.write().await.remove(&participant)?;
            removed.is_online.then(|| PresenceEvent::Offline {
                participant,
                last_changed: None,
            })
        }
    }
}
