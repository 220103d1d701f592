//! Peer session coordination for mesh voice rooms.
//!
//! Participants discover each other through a shared signaling medium,
//! negotiate one media connection per pair, and tear down cleanly when a
//! peer leaves or its medium connection drops. Media transport and audio
//! capture are collaborators behind the traits in [`transport`] and
//! [`media`].

pub mod identity;
pub mod media;
pub mod medium;
pub mod membership;
pub mod mesh;
pub mod presence;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use identity::Participant;
pub use media::{AudioDevice, DeviceKind, LocalStream, LocalTrack, MediaSource, RemoteStream};
pub use medium::memory::{MemoryClient, MemoryMedium};
pub use medium::relay::{RelayMedium, RelayMediumConfig};
pub use medium::{SignalingMedium, Subscription};
pub use membership::{MembershipEvent, RoomMembership};
pub use mesh::{MeshConfig, MeshCoordinator, MeshEvent, MeshSnapshot, PeerSummary};
pub use presence::{PresenceEvent, PresenceTracker, PresenceWatcher};
pub use session::{PeerSession, Role, SessionPhase};
pub use transport::{
    ConnectionState, IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventKind, PeerEventSink, RtcConfig, SdpKind, SessionDescription,
};
