//! Hierarchical record keys and the key layout used by voice rooms.
//!
//! A key is a `/`-separated path. Segments built from ids are escaped so an
//! id containing `/` can never address a record outside its own slot.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::id::{ParticipantId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(String);

impl Key {
    /// Parse a raw path. Empty paths and empty segments are rejected.
    pub fn parse(path: &str) -> Result<Self, ProtocolError> {
        if path.is_empty() || path.split('/').any(str::is_empty) {
            return Err(ProtocolError::MalformedKey(path.to_string()));
        }
        Ok(Self(path.to_string()))
    }

    /// A single-segment key.
    pub fn root(segment: impl AsRef<str>) -> Self {
        Self(escape(segment.as_ref()))
    }

    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        Self(format!("{}/{}", self.0, escape(segment.as_ref())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decoded segments.
    pub fn segments(&self) -> Vec<String> {
        self.0.split('/').map(unescape).collect()
    }

    /// Decoded last segment.
    pub fn last(&self) -> String {
        self.0.rsplit('/').next().map(unescape).unwrap_or_default()
    }

    /// True if `self` equals `prefix` or lies below it.
    pub fn is_within(&self, prefix: &Key) -> bool {
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// Decoded segments below `prefix`, or `None` if `self` is not within it.
    pub fn relative_to(&self, prefix: &Key) -> Option<Vec<String>> {
        if !self.is_within(prefix) {
            return None;
        }
        let rest = &self.0[prefix.0.len()..];
        Some(
            rest.split('/')
                .filter(|s| !s.is_empty())
                .map(unescape)
                .collect(),
        )
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Key {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}

fn escape(segment: &str) -> String {
    if segment.is_empty() {
        return "%00".to_string();
    }
    segment.replace('%', "%25").replace('/', "%2F")
}

fn unescape(segment: &str) -> String {
    if segment == "%00" {
        return String::new();
    }
    segment.replace("%2F", "/").replace("%25", "%")
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Where each record type lives on the medium.
pub mod layout {
    use super::Key;
    use crate::id::{ParticipantId, RoomId};

    /// Root of all presence records.
    pub fn presence_root() -> Key {
        Key::root("status")
    }

    /// `status/{participant}`
    pub fn presence(participant: &ParticipantId) -> Key {
        presence_root().child(participant.as_str())
    }

    /// `rooms/{room}`
    pub fn room_root(room: &RoomId) -> Key {
        Key::root("rooms").child(room.as_str())
    }

    /// `rooms/{room}/users`
    pub fn members(room: &RoomId) -> Key {
        room_root(room).child("users")
    }

    /// `rooms/{room}/users/{participant}`
    pub fn member(room: &RoomId, participant: &ParticipantId) -> Key {
        members(room).child(participant.as_str())
    }

    /// `rooms/{room}/offers/{to}`, every offer addressed to `to`.
    pub fn offers_for(room: &RoomId, to: &ParticipantId) -> Key {
        room_root(room).child("offers").child(to.as_str())
    }

    /// `rooms/{room}/offers/{to}/{from}`
    pub fn offer(room: &RoomId, to: &ParticipantId, from: &ParticipantId) -> Key {
        offers_for(room, to).child(from.as_str())
    }

    /// `rooms/{room}/answers/{to}`
    pub fn answers_for(room: &RoomId, to: &ParticipantId) -> Key {
        room_root(room).child("answers").child(to.as_str())
    }

    /// `rooms/{room}/answers/{to}/{from}`
    pub fn answer(room: &RoomId, to: &ParticipantId, from: &ParticipantId) -> Key {
        answers_for(room, to).child(from.as_str())
    }

    /// `rooms/{room}/candidates/{from}/{to}`, an append-only list.
    pub fn candidates(room: &RoomId, from: &ParticipantId, to: &ParticipantId) -> Key {
        room_root(room)
            .child("candidates")
            .child(from.as_str())
            .child(to.as_str())
    }
}

/// Decoded position of a signaling key relative to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingSlot {
    Offer { to: ParticipantId, from: ParticipantId },
    Answer { to: ParticipantId, from: ParticipantId },
    Candidate { from: ParticipantId, to: ParticipantId, entry: String },
}

impl SignalingSlot {
    /// Classify `key` as one of the room's signaling slots.
    pub fn classify(room: &RoomId, key: &Key) -> Result<Self, ProtocolError> {
        let rest = key
            .relative_to(&layout::room_root(room))
            .ok_or_else(|| ProtocolError::MalformedKey(key.to_string()))?;
        let parts: Vec<&str> = rest.iter().map(String::as_str).collect();
        match parts.as_slice() {
            ["offers", to, from] => Ok(Self::Offer {
                to: ParticipantId::from(*to),
                from: ParticipantId::from(*from),
            }),
            ["answers", to, from] => Ok(Self::Answer {
                to: ParticipantId::from(*to),
                from: ParticipantId::from(*from),
            }),
            ["candidates", from, to, entry] => Ok(Self::Candidate {
                from: ParticipantId::from(*from),
                to: ParticipantId::from(*to),
                entry: entry.to_string(),
            }),
            _ => Err(ProtocolError::MalformedKey(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_empty_segments() {
        assert!(Key::parse("").is_err());
        assert!(Key::parse("a//b").is_err());
        assert!(Key::parse("/a").is_err());
        assert!(Key::parse("a/b").is_ok());
    }

    #[test]
    fn child_escapes_separators() {
        let key = Key::root("status").child("evil/../id");
        assert_eq!(key.as_str(), "status/evil%2F..%2Fid");
        assert_eq!(key.last(), "evil/../id");
        assert_eq!(key.segments().len(), 2);
    }

    #[test]
    fn is_within_respects_segment_boundaries() {
        let prefix = Key::parse("rooms/r1/users").unwrap();
        assert!(Key::parse("rooms/r1/users").unwrap().is_within(&prefix));
        assert!(Key::parse("rooms/r1/users/a").unwrap().is_within(&prefix));
        assert!(!Key::parse("rooms/r1/users2/a").unwrap().is_within(&prefix));
        assert!(!Key::parse("rooms/r1").unwrap().is_within(&prefix));
    }

    #[test]
    fn relative_to_returns_decoded_tail() {
        let prefix = Key::parse("rooms/r1").unwrap();
        let key = Key::parse("rooms/r1/offers/b/a").unwrap();
        assert_eq!(
            key.relative_to(&prefix).unwrap(),
            vec!["offers".to_string(), "b".into(), "a".into()]
        );
        assert!(Key::parse("rooms/r2/x")
            .unwrap()
            .relative_to(&prefix)
            .is_none());
    }

    #[test]
    fn layout_matches_room_paths() {
        let room = RoomId::from("r1");
        let a = ParticipantId::from("a");
        let b = ParticipantId::from("b");
        assert_eq!(layout::presence(&a).as_str(), "status/a");
        assert_eq!(layout::member(&room, &a).as_str(), "rooms/r1/users/a");
        assert_eq!(layout::offer(&room, &b, &a).as_str(), "rooms/r1/offers/b/a");
        assert_eq!(layout::answer(&room, &a, &b).as_str(), "rooms/r1/answers/a/b");
        assert_eq!(
            layout::candidates(&room, &a, &b).as_str(),
            "rooms/r1/candidates/a/b"
        );
    }

    #[test]
    fn classify_signaling_slots() {
        let room = RoomId::from("r1");
        let a = ParticipantId::from("a");
        let b = ParticipantId::from("b");

        let slot = SignalingSlot::classify(&room, &layout::offer(&room, &b, &a)).unwrap();
        assert_eq!(slot, SignalingSlot::Offer { to: b.clone(), from: a.clone() });

        let entry = layout::candidates(&room, &a, &b).child("0001");
        let slot = SignalingSlot::classify(&room, &entry).unwrap();
        assert_eq!(
            slot,
            SignalingSlot::Candidate {
                from: a,
                to: b,
                entry: "0001".into()
            }
        );

        assert!(SignalingSlot::classify(&room, &layout::members(&room)).is_err());
    }

    #[test]
    fn key_serde_validates() {
        let key: Key = serde_json::from_str("\"status/a\"").unwrap();
        assert_eq!(key.as_str(), "status/a");
        assert!(serde_json::from_str::<Key>("\"a//b\"").is_err());
    }
}
