//! Global liveness of participants.
//!
//! [`PresenceTracker`] publishes the local participant's record and arms the
//! medium to flip it offline if the connection drops. [`PresenceWatcher`]
//! follows every record and reports online/offline transitions.

mod tracker;
mod types;
mod watcher;

pub use tracker::PresenceTracker;
pub use types::PresenceEvent;
pub use watcher::PresenceWatcher;
