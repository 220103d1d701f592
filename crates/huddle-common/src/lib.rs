pub mod errors;
pub mod id;
pub mod key;
pub mod records;
pub mod store;
pub mod wire;

pub use errors::{
    ConfigError, HuddleError, MediaError, MediumError, ProtocolError, TransportError,
};
pub use id::{new_id, NegotiationId, ParticipantId, RoomId};
pub use key::Key;
pub use records::{
    CandidateRecord, DescriptionRecord, MembershipRecord, PresenceRecord, ServerTime,
    SignalingMessage,
};
pub use store::{ConnectionId, Delivery, DisconnectWrite, MediumEvent, RecordStore, SubscriptionId};

pub type Result<T> = std::result::Result<T, HuddleError>;
