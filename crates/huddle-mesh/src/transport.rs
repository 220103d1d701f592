//! The peer connection collaborator.
//!
//! The mesh never touches media itself. It drives a standards-based
//! transport through [`PeerConnection`] and learns about candidates, tracks
//! and connection state through a [`PeerEventSink`].

use async_trait::async_trait;
use huddle_common::{ParticipantId, TransportError};
use huddle_config::{IceServerConfig, VoiceConfig};
use tokio::sync::mpsc;

use crate::media::{LocalTrack, RemoteStream};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

/// Transport-level state as reported by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `Failed` and `Closed` never recover.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Settings handed to every new peer connection.
#[derive(Debug, Clone, Default)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServerConfig>,
}

impl From<&VoiceConfig> for RtcConfig {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    IceCandidate(IceCandidate),
    TrackAdded(RemoteStream),
    ConnectionState(ConnectionState),
}

/// A connection callback, tagged with the session generation that created
/// the connection so late events from a replaced connection can be dropped.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub remote: ParticipantId,
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Handed to the factory; the connection reports its callbacks here.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    remote: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(remote: ParticipantId, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            remote,
            generation,
            tx,
        }
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerEventKind::IceCandidate(candidate));
    }

    pub fn track_added(&self, stream: RemoteStream) {
        self.emit(PeerEventKind::TrackAdded(stream));
    }

    pub fn connection_state(&self, state: ConnectionState) {
        self.emit(PeerEventKind::ConnectionState(state));
    }

    fn emit(&self, kind: PeerEventKind) {
        // The coordinator may already be gone.
        let _ = self.tx.send(PeerEvent {
            remote: self.remote.clone(),
            generation: self.generation,
            kind,
        });
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), TransportError>;
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        remote: &ParticipantId,
        config: &RtcConfig,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, TransportError>;
}
