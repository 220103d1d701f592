//! Publishes the local participant's presence.

use std::sync::Arc;

use huddle_common::key::layout;
use huddle_common::{DisconnectWrite, MediumError, ParticipantId, PresenceRecord};
use tracing::{debug, info, warn};

use crate::medium::{Forwarder, SignalingMedium};

/// Keeps `status/{participant}` accurate for the local participant.
pub struct PresenceTracker {
    medium: Arc<dyn SignalingMedium>,
    participant: ParticipantId,
    keepalive: Option<Forwarder>,
}

impl PresenceTracker {
    pub fn new(medium: Arc<dyn SignalingMedium>, participant: ParticipantId) -> Self {
        Self {
            medium,
            participant,
            keepalive: None,
        }
    }

    /// Activate presence and re-activate it after every medium reconnect.
    /// A dropped connection has already committed the offline write, so the
    /// record must be armed and set online again.
    pub async fn start(&mut self) -> Result<(), MediumError> {
        activate(self.medium.as_ref(), &self.participant).await?;

        let medium = Arc::clone(&self.medium);
        let participant = self.participant.clone();
        let mut connectivity = medium.connectivity();
        connectivity.borrow_and_update();
        self.keepalive = Some(Forwarder::spawn(async move {
            while connectivity.changed().await.is_ok() {
                let up = *connectivity.borrow_and_update();
                if !up {
                    debug!(participant = %participant, "Medium down, presence will re-activate");
                    continue;
                }
                if let Err(e) = activate(medium.as_ref(), &participant).await {
                    warn!(participant = %participant, error = %e, "Failed to re-activate presence");
                }
            }
        }));
        Ok(())
    }

    /// Register the offline disconnect write, then write online.
    pub async fn activate(&self) -> Result<(), MediumError> {
        activate(self.medium.as_ref(), &self.participant).await
    }

    /// Explicit logout: cancel the disconnect write and write offline.
    pub async fn deactivate(&mut self) -> Result<(), MediumError> {
        self.keepalive = None;
        let key = layout::presence(&self.participant);
        self.medium.cancel_disconnect_write(&key).await?;
        self.medium
            .put(&key, PresenceRecord::offline().to_value())
            .await?;
        info!(participant = %self.participant, "Presence deactivated");
        Ok(())
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }
}

async fn activate(medium: &dyn SignalingMedium, participant: &ParticipantId) -> Result<(), MediumError> {
    let key = layout::presence(participant);
    medium
        .register_disconnect_write(
            &key,
            DisconnectWrite::Put {
                value: PresenceRecord::offline().to_value(),
            },
        )
        .await?;
    medium.put(&key, PresenceRecord::online().to_value()).await?;
    info!(participant = %participant, "Presence activated");
    Ok(())
}
