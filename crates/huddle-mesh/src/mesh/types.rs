//! Configuration, events and the read-only view of a mesh.

use std::collections::BTreeMap;

use huddle_common::{HuddleError, ParticipantId, RoomId};
use huddle_config::HuddleConfig;
use tokio::sync::oneshot;

use crate::media::{AudioDevice, RemoteStream};
use crate::session::{Role, SessionPhase};
use crate::transport::{ConnectionState, RtcConfig};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Coordinator settings, derived from [`HuddleConfig`].
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub enabled: bool,
    /// Room capacity including the local participant.
    pub max_participants: usize,
    /// Publish the local participant's presence while the coordinator runs.
    pub presence_enabled: bool,
    pub evict_offline_members: bool,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub rtc: RtcConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::from(&HuddleConfig::default())
    }
}

impl From<&HuddleConfig> for MeshConfig {
    fn from(config: &HuddleConfig) -> Self {
        Self {
            enabled: config.voice.enabled,
            max_participants: config.voice.max_participants as usize,
            presence_enabled: config.presence.enabled,
            evict_offline_members: config.presence.enabled && config.presence.evict_offline_members,
            input_device: config.voice.input_device.clone(),
            output_device: config.voice.output_device.clone(),
            rtc: RtcConfig::from(&config.voice),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Notifications for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    Joined { room: RoomId },
    Left { room: RoomId },
    ParticipantJoined { participant: ParticipantId, display_name: String },
    ParticipantLeft { participant: ParticipantId },
    StreamAdded { participant: ParticipantId, stream: RemoteStream },
    StreamRemoved { participant: ParticipantId },
    PeerConnected { participant: ParticipantId },
    PeerFailed { participant: ParticipantId, reason: String },
    /// A member was removed because presence showed it offline.
    Evicted { participant: ParticipantId },
    MuteChanged { muted: bool },
    DeafenChanged { deafened: bool },
    InputDeviceChanged { device: Option<String> },
    OutputDeviceChanged { device: Option<String> },
    /// The medium connection dropped; every peer session was torn down.
    SignalingUnavailable,
    /// The medium is back and the room was rejoined.
    Reconnected,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub display_name: String,
    pub role: Role,
    pub phase: SessionPhase,
    pub connection: ConnectionState,
}

/// What the rendering layer reads. Published after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshSnapshot {
    pub room: Option<RoomId>,
    pub connected_to_medium: bool,
    /// Id of the local outbound stream while joined.
    pub local_stream: Option<String>,
    pub remote_streams: BTreeMap<ParticipantId, RemoteStream>,
    pub peers: BTreeMap<ParticipantId, PeerSummary>,
    pub muted: bool,
    pub deafened: bool,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl MeshSnapshot {
    pub fn is_joined(&self) -> bool {
        self.room.is_some()
    }

    /// Peers whose negotiation completed and whose transport is up.
    pub fn connected_peers(&self) -> Vec<&ParticipantId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.phase == SessionPhase::Connected && p.connection == ConnectionState::Connected)
            .map(|(id, _)| id)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) type Reply<T> = oneshot::Sender<Result<T, HuddleError>>;

pub(crate) enum Command {
    Join { room: RoomId, reply: Reply<()> },
    Leave { reply: Reply<()> },
    SetMuted { muted: bool, reply: Reply<()> },
    SetDeafened { deafened: bool, reply: Reply<()> },
    SelectInputDevice { device: Option<String>, reply: Reply<()> },
    SelectOutputDevice { device: Option<String>, reply: Reply<()> },
    ListDevices { reply: Reply<Vec<AudioDevice>> },
    Shutdown { reply: Reply<()> },
}
