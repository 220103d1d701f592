//! Per-remote-peer negotiation.
//!
//! One [`PeerSession`] exists for every other member of the room. It owns
//! the peer connection, drives the offer/answer exchange for its role and
//! relays ICE candidates through the medium.

mod manager;
mod state;


pub use manager::{CandidateFeedEvent, Cleanup, PeerSession, SessionContext};
pub use state::{Role, SessionPhase};
