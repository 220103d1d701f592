//! Voice room membership records.
//!
//! The existence of `rooms/{room}/users/{participant}` is membership. Joining
//! also arms a disconnect-triggered delete of that record so a crashed client
//! drops out of the room on its own.

use std::sync::Arc;

use huddle_common::key::layout;
use huddle_common::{
    DisconnectWrite, MediumError, MediumEvent, MembershipRecord, ParticipantId, ProtocolError,
    RoomId,
};
use tokio::sync::mpsc;
use tracing::info;

use crate::identity::Participant;
use crate::medium::{SignalingMedium, Subscription};

/// A change to the member list of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Delivered for every current member on subscribe, then for each join
    /// or record overwrite.
    Added(MembershipRecord),
    Removed(ParticipantId),
}

impl MembershipEvent {
    /// Interpret an event from a subscription on `rooms/{room}/users`.
    /// Returns `Ok(None)` for keys that are not member records.
    pub fn from_medium(room: &RoomId, event: &MediumEvent) -> Result<Option<Self>, ProtocolError> {
        let members = layout::members(room);
        let Some(rest) = event.key().relative_to(&members) else {
            return Ok(None);
        };
        let [participant] = rest.as_slice() else {
            return Ok(None);
        };
        match event {
            MediumEvent::Added { key, value } => {
                MembershipRecord::from_value(key, value).map(|r| Some(Self::Added(r)))
            }
            MediumEvent::Removed { .. } => {
                Ok(Some(Self::Removed(ParticipantId::from(participant.as_str()))))
            }
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        match self {
            Self::Added(record) => &record.participant_id,
            Self::Removed(participant) => participant,
        }
    }
}

/// Membership of the local participant in one room.
pub struct RoomMembership {
    medium: Arc<dyn SignalingMedium>,
    room: RoomId,
    participant: Participant,
}

impl RoomMembership {
    pub fn new(medium: Arc<dyn SignalingMedium>, room: RoomId, participant: Participant) -> Self {
        Self {
            medium,
            room,
            participant,
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Arm the disconnect delete, then write the membership record.
    pub async fn join(&self) -> Result<(), MediumError> {
        let key = layout::member(&self.room, &self.participant.id);
        self.medium
            .register_disconnect_write(&key, DisconnectWrite::Delete)
            .await?;
        let record = MembershipRecord::new(
            self.participant.id.clone(),
            self.participant.display_name.clone(),
        );
        self.medium.put(&key, record.to_value()).await?;
        info!(room = %self.room, participant = %self.participant.id, "Joined room");
        Ok(())
    }

    /// Cancel the disconnect delete, then delete the membership record.
    pub async fn leave(&self) -> Result<(), MediumError> {
        let key = layout::member(&self.room, &self.participant.id);
        self.medium.cancel_disconnect_write(&key).await?;
        self.medium.delete(&key).await?;
        info!(room = %self.room, participant = %self.participant.id, "Left room");
        Ok(())
    }

    /// Remove another participant's record, e.g. one whose presence shows it
    /// went offline after joining. Deleting an absent record is a no-op.
    pub async fn evict(&self, other: &ParticipantId) -> Result<(), MediumError> {
        self.medium.delete(&layout::member(&self.room, other)).await?;
        info!(room = %self.room, participant = %other, "Evicted stale member");
        Ok(())
    }

    /// Subscribe to the member list. Every current member is delivered first.
    pub async fn subscribe(&self) -> Result<Subscription, MediumError> {
        self.medium.subscribe(&layout::members(&self.room)).await
    }

    /// Subscribe to the member list, delivering into a shared channel.
    pub async fn subscribe_into(
        &self,
        events: mpsc::UnboundedSender<MediumEvent>,
    ) -> Result<Subscription, MediumError> {
        self.medium
            .subscribe_into(&layout::members(&self.room), events)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::memory::MemoryMedium;

    fn membership(medium: &MemoryMedium, id: &str) -> (Arc<crate::medium::memory::MemoryClient>, RoomMembership) {
        let client = Arc::new(medium.connect());
        let membership = RoomMembership::new(
            client.clone(),
            RoomId::from("lobby"),
            Participant::new(id, id.to_uppercase()),
        );
        (client, membership)
    }

    fn events(room: &RoomId, sub: &mut Subscription) -> Vec<MembershipEvent> {
        sub.drain_ready()
            .iter()
            .filter_map(|e| MembershipEvent::from_medium(room, e).ok().flatten())
            .collect()
    }

    #[tokio::test]
    async fn join_and_leave_are_observed_with_initial_sync() {
        let medium = MemoryMedium::new();
        let room = RoomId::from("lobby");
        let (_a_client, a) = membership(&medium, "a");
        let (_b_client, b) = membership(&medium, "b");

        a.join().await.unwrap();
        let mut sub = b.subscribe().await.unwrap();
        b.join().await.unwrap();
        a.leave().await.unwrap();

        let seen = events(&room, &mut sub);
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], MembershipEvent::Added(r) if r.participant_id.as_str() == "a"));
        assert!(matches!(&seen[1], MembershipEvent::Added(r) if r.display_name == "B"));
        assert_eq!(seen[2], MembershipEvent::Removed(ParticipantId::from("a")));
        assert!(seen[1].participant().as_str() == "b");
    }

    #[tokio::test]
    async fn join_records_server_time_and_arms_delete() {
        let medium = MemoryMedium::new();
        let (client, a) = membership(&medium, "a");
        a.join().await.unwrap();

        let key = layout::member(a.room(), &ParticipantId::from("a"));
        let record = MembershipRecord::from_value(&key, &medium.get(&key).unwrap()).unwrap();
        assert!(record.joined_at.millis().is_some());
        assert_eq!(client.pending_disconnect_writes(), 1);

        client.sever();
        assert!(medium.get(&key).is_none());
    }

    #[tokio::test]
    async fn leave_cancels_disconnect_delete() {
        let medium = MemoryMedium::new();
        let (client, a) = membership(&medium, "a");
        a.join().await.unwrap();
        a.leave().await.unwrap();
        assert_eq!(client.pending_disconnect_writes(), 0);
    }

    #[tokio::test]
    async fn evict_removes_other_member_and_is_idempotent() {
        let medium = MemoryMedium::new();
        let (_a_client, a) = membership(&medium, "a");
        let (_b_client, b) = membership(&medium, "b");
        b.join().await.unwrap();

        let stale = ParticipantId::from("b");
        a.evict(&stale).await.unwrap();
        a.evict(&stale).await.unwrap();
        assert!(medium.get(&layout::member(a.room(), &stale)).is_none());
    }

    #[test]
    fn mismatched_record_is_a_protocol_error() {
        let room = RoomId::from("lobby");
        let event = MediumEvent::Added {
            key: layout::member(&room, &ParticipantId::from("a")),
            value: MembershipRecord::new(ParticipantId::from("b"), "B").to_value(),
        };
        assert!(MembershipEvent::from_medium(&room, &event).is_err());

        let nested = MediumEvent::Removed {
            key: layout::member(&room, &ParticipantId::from("a")).child("extra"),
        };
        assert_eq!(MembershipEvent::from_medium(&room, &nested).unwrap(), None);
    }
}
