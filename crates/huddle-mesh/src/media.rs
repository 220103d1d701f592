//! Local audio capture and remote stream handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use huddle_common::MediaError;

/// One captured audio track. Clones share the enabled flag, so muting a
/// clone mutes the track the transport is sending.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: String,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// The local outbound stream: audio tracks from one input device.
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    /// Device the tracks were captured from; `None` is the system default.
    pub device: Option<String>,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Enable or disable every track. Disabled tracks send silence.
    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.tracks.iter().all(|t| !t.is_enabled())
    }
}

/// An inbound stream reported by a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub track_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Input,
    Output,
}

/// An audio device the host can capture from or play to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl AudioDevice {
    pub fn input(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: DeviceKind::Input,
        }
    }

    pub fn output(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: DeviceKind::Output,
        }
    }
}

/// Local audio: microphone capture and the speaker remote audio plays on.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open the microphone. `device` of `None` picks the default input.
    async fn acquire(&self, device: Option<&str>) -> Result<LocalStream, MediaError>;

    /// Stop capturing. Called once per acquired stream.
    async fn release(&self, stream: LocalStream);

    /// Every input and output device currently present.
    async fn devices(&self) -> Result<Vec<AudioDevice>, MediaError>;

    /// Play remote audio on `device`; `None` is the default output.
    async fn set_output(&self, device: Option<&str>) -> Result<(), MediaError>;
}

/// Keep the devices of one kind, in the order the host listed them.
pub fn devices_of(devices: &[AudioDevice], kind: DeviceKind) -> Vec<AudioDevice> {
    devices.iter().filter(|d| d.kind == kind).cloned().collect()
}
