//! In-process collaborators for tests: a simulated peer connection factory
//! and a fake microphone.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use huddle_common::{MediaError, ParticipantId, TransportError};

use crate::media::{AudioDevice, DeviceKind, LocalStream, LocalTrack, MediaSource, RemoteStream};
use crate::transport::{
    ConnectionState, IceCandidate, PeerConnection, PeerConnectionFactory, PeerEventSink,
    RtcConfig, SdpKind, SessionDescription,
};

/// Poll `condition` until it holds. Panics after five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Peer connections
// ---------------------------------------------------------------------------

/// What the simulated transport saw for one remote.
#[derive(Debug, Default, Clone)]
pub struct ConnectionLog {
    pub created: usize,
    pub remote_descriptions: usize,
    /// Candidates applied to the most recent connection, in order.
    pub candidates: Vec<String>,
    pub closed: usize,
}

#[derive(Default)]
struct SimState {
    logs: HashMap<ParticipantId, ConnectionLog>,
    sinks: HashMap<ParticipantId, PeerEventSink>,
    refuse: HashSet<ParticipantId>,
}

/// Connections that "connect" once both descriptions are set.
#[derive(Clone, Default)]
pub struct SimFactory {
    state: Arc<Mutex<SimState>>,
}

impl SimFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, remote: &str) -> ConnectionLog {
        let state = self.state.lock().unwrap();
        state
            .logs
            .get(&ParticipantId::from(remote))
            .cloned()
            .unwrap_or_default()
    }

    /// Make `create` fail for `remote`.
    pub fn refuse(&self, remote: &str) {
        self.state.lock().unwrap().refuse.insert(ParticipantId::from(remote));
    }

    /// Report a transport state change on the live connection to `remote`.
    pub fn report_state(&self, remote: &str, state: ConnectionState) {
        let sink = self.state.lock().unwrap().sinks.get(&ParticipantId::from(remote)).cloned();
        if let Some(sink) = sink {
            sink.connection_state(state);
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for SimFactory {
    async fn create(
        &self,
        remote: &ParticipantId,
        _config: &RtcConfig,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse.contains(remote) {
            return Err(TransportError::Connection(format!("refused {remote}")));
        }
        let log = state.logs.entry(remote.clone()).or_default();
        log.created += 1;
        log.candidates.clear();
        state.sinks.insert(remote.clone(), events.clone());
        Ok(Box::new(SimConnection {
            remote: remote.clone(),
            state: self.state.clone(),
            events,
            progress: Mutex::new(Progress::default()),
        }))
    }
}

#[derive(Default)]
struct Progress {
    local: bool,
    remote: bool,
    connected: bool,
}

struct SimConnection {
    remote: ParticipantId,
    state: Arc<Mutex<SimState>>,
    events: PeerEventSink,
    progress: Mutex<Progress>,
}

impl SimConnection {
    fn maybe_connect(&self) {
        let mut progress = self.progress.lock().unwrap();
        if progress.local && progress.remote && !progress.connected {
            progress.connected = true;
            self.events.connection_state(ConnectionState::Connecting);
            self.events.connection_state(ConnectionState::Connected);
            self.events.track_added(RemoteStream {
                id: format!("stream-{}", self.remote),
                track_ids: vec![format!("audio-{}", self.remote)],
            });
        }
    }
}

#[async_trait]
impl PeerConnection for SimConnection {
    async fn add_local_track(&self, _track: &LocalTrack) -> Result<(), TransportError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0 offer-to-{}", self.remote),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("v=0 answer-to-{}", self.remote),
        })
    }

    async fn set_local_description(&self, _description: SessionDescription) -> Result<(), TransportError> {
        self.progress.lock().unwrap().local = true;
        for n in 0..2 {
            self.events.ice_candidate(IceCandidate {
                candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 500{n} typ host"),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            });
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<(), TransportError> {
        self.progress.lock().unwrap().remote = true;
        if let Some(log) = self.state.lock().unwrap().logs.get_mut(&self.remote) {
            log.remote_descriptions += 1;
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !self.progress.lock().unwrap().remote {
            return Err(TransportError::Candidate(
                "candidate before remote description".into(),
            ));
        }
        if let Some(log) = self.state.lock().unwrap().logs.get_mut(&self.remote) {
            log.candidates.push(candidate.candidate);
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(log) = self.state.lock().unwrap().logs.get_mut(&self.remote) {
            log.closed += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// A microphone with a fixed device list.
#[derive(Default)]
pub struct SimMedia {
    acquired: AtomicUsize,
    released: AtomicUsize,
    missing: Mutex<HashSet<String>>,
    streams: Mutex<Vec<LocalStream>>,
    output: Mutex<Option<String>>,
}

const SIM_DEVICES: [(&str, DeviceKind); 5] = [
    ("default", DeviceKind::Input),
    ("usb-mic", DeviceKind::Input),
    ("default", DeviceKind::Output),
    ("speakers", DeviceKind::Output),
    ("headset", DeviceKind::Output),
];

impl SimMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device remote audio currently plays on.
    pub fn output(&self) -> Option<String> {
        self.output.lock().unwrap().clone()
    }

    /// `device` disappears from the device list and acquiring it fails.
    pub fn remove_device(&self, device: &str) {
        self.missing.lock().unwrap().insert(device.to_string());
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// The most recently acquired stream. Shares its track flags with the
    /// stream handed out.
    pub fn last_stream(&self) -> Option<LocalStream> {
        self.streams.lock().unwrap().last().cloned()
    }

    /// Streams acquired and not yet released.
    pub fn open_streams(&self) -> usize {
        self.acquired() - self.released()
    }
}

#[async_trait]
impl MediaSource for SimMedia {
    async fn acquire(&self, device: Option<&str>) -> Result<LocalStream, MediaError> {
        let name = device.unwrap_or("default");
        if self.missing.lock().unwrap().contains(name) {
            return Err(MediaError::DeviceNotFound(name.to_string()));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        let stream = LocalStream {
            id: format!("local-{n}"),
            device: device.map(str::to_string),
            tracks: vec![LocalTrack::new(format!("mic-{n}"))],
        };
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }

    async fn release(&self, _stream: LocalStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    async fn devices(&self) -> Result<Vec<AudioDevice>, MediaError> {
        let missing = self.missing.lock().unwrap();
        Ok(SIM_DEVICES
            .iter()
            .filter(|(id, _)| !missing.contains(*id))
            .map(|(id, kind)| AudioDevice {
                id: id.to_string(),
                label: format!("Sim {id}"),
                kind: *kind,
            })
            .collect())
    }

    async fn set_output(&self, device: Option<&str>) -> Result<(), MediaError> {
        if let Some(name) = device {
            let known = SIM_DEVICES
                .iter()
                .any(|(id, kind)| *id == name && *kind == DeviceKind::Output);
            if !known || self.missing.lock().unwrap().contains(name) {
                return Err(MediaError::DeviceNotFound(name.to_string()));
            }
        }
        *self.output.lock().unwrap() = device.map(str::to_string);
        Ok(())
    }
}
