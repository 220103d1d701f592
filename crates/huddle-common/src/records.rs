//! Record schemas stored on the signaling medium.
//!
//! Every value crossing the medium boundary is parsed into one of these
//! types; a record that does not match its schema is rejected with a
//! `ProtocolError` instead of being interpreted loosely.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::id::{NegotiationId, ParticipantId, RoomId};
use crate::key::{Key, SignalingSlot};

// ---------------------------------------------------------------------------
// Server time
// ---------------------------------------------------------------------------

/// Placeholder the medium replaces with its own clock when a write commits.
pub const SERVER_TIMESTAMP_FIELD: &str = ".sv";
pub const SERVER_TIMESTAMP_VALUE: &str = "timestamp";

/// A timestamp that is either still a placeholder (when writing) or resolved
/// to milliseconds on the medium's monotonic clock (when reading).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerTime {
    Resolved(u64),
    Pending(ServerValue),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerValue {
    #[serde(rename = ".sv")]
    pub sv: String,
}

impl ServerTime {
    /// The "use the medium's clock" placeholder.
    pub fn now() -> Self {
        Self::Pending(ServerValue {
            sv: SERVER_TIMESTAMP_VALUE.to_string(),
        })
    }

    pub fn millis(&self) -> Option<u64> {
        match self {
            Self::Resolved(ms) => Some(*ms),
            Self::Pending(_) => None,
        }
    }
}

/// Replace every server-timestamp placeholder inside `value` with `now`.
pub fn resolve_server_values(value: &mut serde_json::Value, now: u64) {
    if is_server_timestamp(value) {
        *value = serde_json::Value::from(now);
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            for v in map.values_mut() {
                resolve_server_values(v, now);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                resolve_server_values(v, now);
            }
        }
        _ => {}
    }
}

fn is_server_timestamp(value: &serde_json::Value) -> bool {
    value.as_object().is_some_and(|map| {
        map.len() == 1
            && map.get(SERVER_TIMESTAMP_FIELD).and_then(|v| v.as_str()) == Some(SERVER_TIMESTAMP_VALUE)
    })
}

fn decode<T: DeserializeOwned>(key: &Key, value: &serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value.clone()).map_err(|e| ProtocolError::InvalidRecord {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(record: &T) -> serde_json::Value {
    // Plain structs of strings, bools and integers always serialize.
    serde_json::to_value(record).unwrap_or(serde_json::Value::Null)
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Liveness of one participant, global across rooms. Last writer wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub is_online: bool,
    pub last_changed: ServerTime,
}

impl PresenceRecord {
    pub fn online() -> Self {
        Self {
            is_online: true,
            last_changed: ServerTime::now(),
        }
    }

    pub fn offline() -> Self {
        Self {
            is_online: false,
            last_changed: ServerTime::now(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        encode(self)
    }

    pub fn from_value(key: &Key, value: &serde_json::Value) -> Result<Self, ProtocolError> {
        decode(key, value)
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Existence of this record is membership of the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub joined_at: ServerTime,
}

impl MembershipRecord {
    pub fn new(participant_id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            participant_id,
            display_name: display_name.into(),
            joined_at: ServerTime::now(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        encode(self)
    }

    /// Parse a membership record; the key's last segment must match the id
    /// inside the record.
    pub fn from_value(key: &Key, value: &serde_json::Value) -> Result<Self, ProtocolError> {
        let record: Self = decode(key, value)?;
        if record.participant_id.as_str() != key.last() {
            return Err(ProtocolError::InvalidRecord {
                key: key.to_string(),
                reason: format!(
                    "participant_id {} does not match key",
                    record.participant_id
                ),
            });
        }
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// An SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionRecord {
    pub negotiation_id: NegotiationId,
    pub sdp: String,
}

/// One ICE candidate appended to a `(from, to)` candidate list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub negotiation_id: NegotiationId,
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

impl DescriptionRecord {
    pub fn to_value(&self) -> serde_json::Value {
        encode(self)
    }
}

impl CandidateRecord {
    pub fn to_value(&self) -> serde_json::Value {
        encode(self)
    }
}

/// A validated signaling record together with its addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer {
        from: ParticipantId,
        to: ParticipantId,
        description: DescriptionRecord,
    },
    Answer {
        from: ParticipantId,
        to: ParticipantId,
        description: DescriptionRecord,
    },
    IceCandidate {
        from: ParticipantId,
        to: ParticipantId,
        entry: String,
        candidate: CandidateRecord,
    },
}

impl SignalingMessage {
    /// Parse the record stored at `key` inside `room`.
    pub fn parse(room: &RoomId, key: &Key, value: &serde_json::Value) -> Result<Self, ProtocolError> {
        let message = match SignalingSlot::classify(room, key)? {
            SignalingSlot::Offer { to, from } => Self::Offer {
                from,
                to,
                description: decode(key, value)?,
            },
            SignalingSlot::Answer { to, from } => Self::Answer {
                from,
                to,
                description: decode(key, value)?,
            },
            SignalingSlot::Candidate { from, to, entry } => Self::IceCandidate {
                from,
                to,
                entry,
                candidate: decode(key, value)?,
            },
        };
        if message.from() == message.to() {
            return Err(ProtocolError::InvalidRecord {
                key: key.to_string(),
                reason: "sender and recipient are the same participant".into(),
            });
        }
        Ok(message)
    }

    pub fn from(&self) -> &ParticipantId {
        match self {
            Self::Offer { from, .. } | Self::Answer { from, .. } | Self::IceCandidate { from, .. } => {
                from
            }
        }
    }

    pub fn to(&self) -> &ParticipantId {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::IceCandidate { to, .. } => to,
        }
    }

    pub fn negotiation_id(&self) -> &NegotiationId {
        match self {
            Self::Offer { description, .. } | Self::Answer { description, .. } => {
                &description.negotiation_id
            }
            Self::IceCandidate { candidate, .. } => &candidate.negotiation_id,
        }
    }
}
