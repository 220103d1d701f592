//! WebSocket client of the huddle relay.
//!
//! Speaks the JSON frame protocol from `huddle_common::wire`: requests are
//! correlated with acknowledgements by ref, a heartbeat keeps the relay from
//! timing the client out, and the connection is re-established with
//! exponential backoff. Live subscriptions are re-sent after every
//! reconnect so they resync from the relay's snapshot.

mod client;
mod connection;
mod types;

pub use client::RelayMedium;
pub use types::RelayMediumConfig;
