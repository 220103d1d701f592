//! Event types for presence observation.

use huddle_common::ParticipantId;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A change in some participant's presence record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Online {
        participant: ParticipantId,
        last_changed: Option<u64>,
    },
    Offline {
        participant: ParticipantId,
        /// Medium time of the offline write, if resolved.
        last_changed: Option<u64>,
    },
}

impl PresenceEvent {
    pub fn participant(&self) -> &ParticipantId {
        match self {
            Self::Online { participant, .. } | Self::Offline { participant, .. } => participant,
        }
    }
}
