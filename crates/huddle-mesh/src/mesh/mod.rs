//! Full-mesh coordination for one voice room.
//!
//! [`MeshCoordinator`] keeps exactly one peer session per other member of
//! the joined room and publishes a [`MeshSnapshot`] of the aggregated state.

mod coordinator;
mod types;

#[cfg(test)]
mod tests;

pub use coordinator::MeshCoordinator;
pub use types::{MeshConfig, MeshEvent, MeshSnapshot, PeerSummary};
