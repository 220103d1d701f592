//! The mesh coordinator: one actor task per local participant that owns
//! every peer session of the current room.
//!
//! Commands arrive through a cloneable [`MeshCoordinator`] handle. Medium
//! subscriptions, candidate feeds and connection callbacks are forwarded
//! into channels the actor selects over, so all state changes happen one at
//! a time on the actor task. Room inputs carry the epoch of the
//! subscriptions that produced them and connection events carry the session
//! generation; anything from a replaced epoch or generation is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use huddle_common::key::layout;
use huddle_common::{
    HuddleError, MediaError, MediumError, MediumEvent, MembershipRecord, ParticipantId, Result,
    RoomId, SignalingMessage,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::types::{Command, MeshConfig, MeshEvent, MeshSnapshot, PeerSummary, Reply};
use crate::identity::Participant;
use crate::media::{devices_of, AudioDevice, DeviceKind, LocalStream, MediaSource};
use crate::medium::{Forwarder, SignalingMedium, Subscription};
use crate::membership::{MembershipEvent, RoomMembership};
use crate::presence::{PresenceEvent, PresenceTracker, PresenceWatcher};
use crate::session::{CandidateFeedEvent, Cleanup, PeerSession, SessionContext, SessionPhase};
use crate::transport::{ConnectionState, PeerConnectionFactory, PeerEvent, PeerEventKind, RtcConfig};

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running coordinator. Cheap to clone; the actor stops when
/// every handle is dropped or [`MeshCoordinator::shutdown`] is called.
#[derive(Clone)]
pub struct MeshCoordinator {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<MeshSnapshot>,
}

impl MeshCoordinator {
    /// Start the actor. Presence is activated right away when enabled.
    pub fn spawn(
        participant: Participant,
        medium: Arc<dyn SignalingMedium>,
        factory: Arc<dyn PeerConnectionFactory>,
        media: Arc<dyn MediaSource>,
        config: MeshConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (room_tx, room_rx) = mpsc::unbounded_channel();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(MeshSnapshot::default());

        let actor = MeshActor {
            links: Links {
                medium,
                factory,
                rtc: config.rtc.clone(),
                peer_tx,
                feed_tx,
            },
            input_device: config.input_device.clone(),
            output_device: config.output_device.clone(),
            participant,
            config,
            media,
            presence: None,
            room: None,
            local_stream: None,
            muted: false,
            deafened: false,
            connected: false,
            epoch: 0,
            generation: 0,
            room_tx,
            events: event_tx,
            snapshot: snapshot_tx,
        };
        tokio::spawn(actor.run(command_rx, room_rx, feed_rx, peer_rx));

        (
            Self {
                commands: command_tx,
                snapshot: snapshot_rx,
            },
            event_rx,
        )
    }

    /// Join `room`: acquire the microphone, write membership and start a
    /// session with every member.
    pub async fn join(&self, room: RoomId) -> Result<()> {
        self.request(|reply| Command::Join { room, reply }).await
    }

    /// Leave the current room. A no-op when not in a room.
    pub async fn leave(&self) -> Result<()> {
        self.request(|reply| Command::Leave { reply }).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.request(|reply| Command::SetMuted { muted, reply }).await
    }

    /// Deafening also mutes. Undeafening leaves the mute state alone.
    pub async fn set_deafened(&self, deafened: bool) -> Result<()> {
        self.request(|reply| Command::SetDeafened { deafened, reply })
            .await
    }

    /// Switch microphones. The new device is opened first; if that fails the
    /// current one stays in use. While in a room, the room is rejoined with
    /// the new stream.
    pub async fn select_input_device(&self, device: Option<String>) -> Result<()> {
        self.request(|reply| Command::SelectInputDevice { device, reply })
            .await
    }

    /// Play remote audio on `device`; `None` is the default output. The
    /// device must be one [`Self::devices`] lists as an output.
    pub async fn select_output_device(&self, device: Option<String>) -> Result<()> {
        self.request(|reply| Command::SelectOutputDevice { device, reply })
            .await
    }

    /// Input and output devices currently present on the host.
    pub async fn devices(&self) -> Result<Vec<AudioDevice>> {
        self.request(|reply| Command::ListDevices { reply }).await
    }

    /// Leave, deactivate presence and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MeshSnapshot> {
        self.snapshot.clone()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| HuddleError::Stopped)?;
        reply_rx.await.map_err(|_| HuddleError::Stopped)?
    }
}

// ---------------------------------------------------------------------------
// Actor state
// ---------------------------------------------------------------------------

/// Collaborators every session borrows.
struct Links {
    medium: Arc<dyn SignalingMedium>,
    factory: Arc<dyn PeerConnectionFactory>,
    rtc: RtcConfig,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    feed_tx: mpsc::UnboundedSender<CandidateFeedEvent>,
}

impl Links {
    fn context<'a>(&'a self, local_stream: &'a LocalStream) -> SessionContext<'a> {
        SessionContext {
            medium: self.medium.as_ref(),
            factory: self.factory.as_ref(),
            rtc: &self.rtc,
            local_stream,
            peer_events: &self.peer_tx,
            candidate_events: &self.feed_tx,
        }
    }
}

enum RoomSignal {
    /// Membership, offers or answers, in commit order.
    Medium(MediumEvent),
    Presence(PresenceEvent),
}

struct RoomInput {
    epoch: u64,
    signal: RoomSignal,
}

/// One channel shared by the member, offer and answer subscriptions of a
/// room, so an offer is never seen before the membership change that
/// preceded it.
struct RoomFeed {
    tx: mpsc::UnboundedSender<MediumEvent>,
    rx: mpsc::UnboundedReceiver<MediumEvent>,
    subscriptions: Vec<Subscription>,
}

struct RoomState {
    id: RoomId,
    membership: RoomMembership,
    epoch: u64,
    /// Other members, by identity.
    members: BTreeMap<ParticipantId, MembershipRecord>,
    sessions: BTreeMap<ParticipantId, PeerSession>,
    /// Offers and answers from participants not yet seen as members.
    stash: HashMap<ParticipantId, Vec<SignalingMessage>>,
    subscriptions: Vec<Subscription>,
    feeds: Vec<Forwarder>,
    watcher: Option<PresenceWatcher>,
}

impl RoomState {
    /// Drop subscriptions and forget everything learned through them.
    /// Inputs still queued under the old epoch are ignored from now on.
    fn detach(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.feeds.clear();
        self.subscriptions.clear();
        self.watcher = None;
        self.members.clear();
        self.stash.clear();
    }
}

struct MeshActor {
    participant: Participant,
    config: MeshConfig,
    links: Links,
    media: Arc<dyn MediaSource>,
    presence: Option<PresenceTracker>,
    room: Option<RoomState>,
    /// Held only while joined.
    local_stream: Option<LocalStream>,
    muted: bool,
    deafened: bool,
    input_device: Option<String>,
    output_device: Option<String>,
    connected: bool,
    epoch: u64,
    generation: u64,
    room_tx: mpsc::UnboundedSender<RoomInput>,
    events: mpsc::UnboundedSender<MeshEvent>,
    snapshot: watch::Sender<MeshSnapshot>,
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

impl MeshActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut room_rx: mpsc::UnboundedReceiver<RoomInput>,
        mut feed_rx: mpsc::UnboundedReceiver<CandidateFeedEvent>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let mut connectivity = self.links.medium.connectivity();
        self.connected = *connectivity.borrow_and_update();
        let mut medium_alive = true;
        self.start_presence().await;
        self.apply_output_device().await;
        self.publish();

        info!(participant = %self.participant.id, "Mesh coordinator started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(input) = room_rx.recv() => self.handle_room_input(input).await,
                Some(event) = feed_rx.recv() => self.handle_candidate_feed(event).await,
                Some(event) = peer_rx.recv() => self.handle_peer_event(event).await,
                changed = connectivity.changed(), if medium_alive => {
                    if changed.is_err() {
                        medium_alive = false;
                        self.handle_connectivity(false).await;
                    } else {
                        let up = *connectivity.borrow_and_update();
                        self.handle_connectivity(up).await;
                    }
                }
            }
            self.publish();
        }

        self.publish();
        info!(participant = %self.participant.id, "Mesh coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { room, reply } => {
                let result = self.join(room).await;
                let _ = reply.send(result);
            }
            Command::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(Ok(()));
            }
            Command::SetMuted { muted, reply } => {
                self.set_muted(muted);
                let _ = reply.send(Ok(()));
            }
            Command::SetDeafened { deafened, reply } => {
                self.set_deafened(deafened);
                let _ = reply.send(Ok(()));
            }
            Command::SelectInputDevice { device, reply } => {
                let result = self.select_input_device(device).await;
                let _ = reply.send(result);
            }
            Command::SelectOutputDevice { device, reply } => {
                let result = self.select_output_device(device).await;
                let _ = reply.send(result);
            }
            Command::ListDevices { reply } => {
                let result = self.media.devices().await.map_err(HuddleError::from);
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let mut snapshot = MeshSnapshot {
            room: None,
            connected_to_medium: self.connected,
            local_stream: self.local_stream.as_ref().map(|s| s.id.clone()),
            remote_streams: BTreeMap::new(),
            peers: BTreeMap::new(),
            muted: self.muted,
            deafened: self.deafened,
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
        };
        if let Some(room) = &self.room {
            snapshot.room = Some(room.id.clone());
            for (remote, session) in &room.sessions {
                if let Some(stream) = session.remote_stream() {
                    snapshot.remote_streams.insert(remote.clone(), stream.clone());
                }
                let display_name = room
                    .members
                    .get(remote)
                    .map(|m| m.display_name.clone())
                    .unwrap_or_default();
                snapshot.peers.insert(
                    remote.clone(),
                    PeerSummary {
                        display_name,
                        role: session.role(),
                        phase: session.phase(),
                        connection: session.connection_state(),
                    },
                );
            }
        }
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    // -- Presence --------------------------------------------------------

    async fn start_presence(&mut self) {
        if !self.config.presence_enabled {
            return;
        }
        let mut tracker = PresenceTracker::new(
            Arc::clone(&self.links.medium),
            self.participant.id.clone(),
        );
        if let Err(e) = tracker.start().await {
            warn!(participant = %self.participant.id, error = %e, "Failed to activate presence");
        }
        self.presence = Some(tracker);
    }

    async fn shutdown(&mut self) {
        self.leave().await;
        if let Some(mut tracker) = self.presence.take() {
            if let Err(e) = tracker.deactivate().await {
                warn!(participant = %self.participant.id, error = %e, "Failed to deactivate presence");
            }
        }
    }

    // -- Join / leave ----------------------------------------------------

    async fn join(&mut self, room: RoomId) -> Result<()> {
        if !self.config.enabled {
            return Err(HuddleError::Disabled);
        }
        if let Some(current) = &self.room {
            if current.id == room {
                return Err(HuddleError::AlreadyJoined(room.to_string()));
            }
            self.leave().await;
        }

        let stream = match self.local_stream.take() {
            Some(stream) => stream,
            None => self.media.acquire(self.input_device.as_deref()).await?,
        };
        stream.set_enabled(!self.muted);
        self.local_stream = Some(stream);

        if let Err(e) = self.enter(room.clone()).await {
            warn!(room = %room, error = %e, "Join failed");
            if let Some(stream) = self.local_stream.take() {
                self.media.release(stream).await;
            }
            return Err(e);
        }

        info!(room = %room, participant = %self.participant.id, "Joined voice room");
        self.emit(MeshEvent::Joined { room });
        Ok(())
    }

    /// Check capacity, write membership and subscribe. Nothing is written
    /// when the room is full.
    async fn enter(&mut self, room: RoomId) -> Result<()> {
        let membership = RoomMembership::new(
            Arc::clone(&self.links.medium),
            room.clone(),
            self.participant.clone(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let members = membership.subscribe_into(tx.clone()).await?;
        let mut initial = Vec::new();
        while let Ok(event) = rx.try_recv() {
            initial.push(event);
        }

        let others = initial
            .iter()
            .filter_map(|e| MembershipEvent::from_medium(&room, e).ok().flatten())
            .filter(|e| matches!(e, MembershipEvent::Added(r) if r.participant_id != self.participant.id))
            .count();
        if others >= self.config.max_participants {
            info!(room = %room, members = others, "Room is full");
            return Err(HuddleError::RoomFull(room.to_string()));
        }

        membership.join().await?;
        self.room = Some(RoomState {
            id: room,
            membership,
            epoch: 0,
            members: BTreeMap::new(),
            sessions: BTreeMap::new(),
            stash: HashMap::new(),
            subscriptions: Vec::new(),
            feeds: Vec::new(),
            watcher: None,
        });

        let feed = RoomFeed {
            tx,
            rx,
            subscriptions: vec![members],
        };
        if let Err(e) = self.attach(Some(feed)).await {
            if let Some(state) = self.room.take() {
                let _ = state.membership.leave().await;
            }
            return Err(e.into());
        }

        for event in initial {
            self.handle_room_signal(RoomSignal::Medium(event)).await;
        }
        Ok(())
    }

    /// Subscribe to the room under a fresh epoch. `feed` carries a member
    /// subscription whose snapshot was already consumed.
    async fn attach(&mut self, feed: Option<RoomFeed>) -> std::result::Result<(), MediumError> {
        let epoch = self.next_epoch();
        let medium = Arc::clone(&self.links.medium);
        let Some(room) = self.room.as_mut() else {
            return Ok(());
        };

        let mut feed = match feed {
            Some(feed) => feed,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                let members = room.membership.subscribe_into(tx.clone()).await?;
                RoomFeed {
                    tx,
                    rx,
                    subscriptions: vec![members],
                }
            }
        };
        let signaling = [
            layout::offers_for(&room.id, &self.participant.id),
            layout::answers_for(&room.id, &self.participant.id),
        ];
        for prefix in &signaling {
            let subscription = medium.subscribe_into(prefix, feed.tx.clone()).await?;
            feed.subscriptions.push(subscription);
        }

        let RoomFeed {
            mut rx,
            subscriptions,
            ..
        } = feed;
        let room_tx = self.room_tx.clone();
        let mut feeds = vec![Forwarder::spawn(async move {
            while let Some(event) = rx.recv().await {
                let input = RoomInput {
                    epoch,
                    signal: RoomSignal::Medium(event),
                };
                if room_tx.send(input).is_err() {
                    break;
                }
            }
        })];

        let watcher = if self.config.evict_offline_members {
            let (watcher, mut presence_rx) = PresenceWatcher::start(medium.as_ref()).await?;
            let room_tx = self.room_tx.clone();
            feeds.push(Forwarder::spawn(async move {
                while let Some(event) = presence_rx.recv().await {
                    let input = RoomInput {
                        epoch,
                        signal: RoomSignal::Presence(event),
                    };
                    if room_tx.send(input).is_err() {
                        break;
                    }
                }
            }));
            Some(watcher)
        } else {
            None
        };

        room.epoch = epoch;
        room.subscriptions = subscriptions;
        room.feeds = feeds;
        room.watcher = watcher;
        debug!(room = %room.id, epoch, "Room subscriptions attached");
        Ok(())
    }

    async fn leave(&mut self) {
        let Some(mut room) = self.room.take() else {
            return;
        };
        room.detach(0);

        let cleanup = if self.connected {
            Cleanup::Pair
        } else {
            Cleanup::Skip
        };
        for (_, mut session) in std::mem::take(&mut room.sessions) {
            session.teardown(self.links.medium.as_ref(), cleanup).await;
        }
        if let Err(e) = room.membership.leave().await {
            warn!(room = %room.id, error = %e, "Failed to remove membership");
        }
        if let Some(stream) = self.local_stream.take() {
            self.media.release(stream).await;
        }

        info!(room = %room.id, participant = %self.participant.id, "Left voice room");
        self.emit(MeshEvent::Left { room: room.id });
    }

    // -- Local audio -----------------------------------------------------

    fn set_muted(&mut self, muted: bool) {
        if let Some(stream) = &self.local_stream {
            stream.set_enabled(!muted);
        }
        if self.muted != muted {
            self.muted = muted;
            debug!(muted, "Mute changed");
            self.emit(MeshEvent::MuteChanged { muted });
        }
    }

    fn set_deafened(&mut self, deafened: bool) {
        if deafened {
            self.set_muted(true);
        }
        if self.deafened != deafened {
            self.deafened = deafened;
            debug!(deafened, "Deafen changed");
            self.emit(MeshEvent::DeafenChanged { deafened });
        }
    }

    async fn select_input_device(&mut self, device: Option<String>) -> Result<()> {
        let stream = self.media.acquire(device.as_deref()).await?;
        self.input_device = device.clone();

        match self.room.as_ref().map(|r| r.id.clone()) {
            Some(room) => {
                self.leave().await;
                self.local_stream = Some(stream);
                self.join(room).await?;
            }
            None => self.media.release(stream).await,
        }

        info!(device = ?device, "Input device changed");
        self.emit(MeshEvent::InputDeviceChanged { device });
        Ok(())
    }

    async fn select_output_device(&mut self, device: Option<String>) -> Result<()> {
        if let Some(name) = &device {
            let outputs = devices_of(&self.media.devices().await?, DeviceKind::Output);
            if !outputs.iter().any(|d| &d.id == name) {
                return Err(MediaError::DeviceNotFound(name.clone()).into());
            }
        }
        self.media.set_output(device.as_deref()).await?;
        if self.output_device != device {
            self.output_device = device.clone();
            info!(device = ?device, "Output device changed");
            self.emit(MeshEvent::OutputDeviceChanged { device });
        }
        Ok(())
    }

    /// Route remote audio to the configured speaker, falling back to the
    /// default output when it is gone.
    async fn apply_output_device(&mut self) {
        let Some(device) = self.output_device.clone() else {
            return;
        };
        if let Err(e) = self.media.set_output(Some(&device)).await {
            warn!(device = %device, error = %e, "Configured output device unavailable; using the default");
            self.output_device = None;
        }
    }

    // -- Medium connectivity ---------------------------------------------

    async fn handle_connectivity(&mut self, up: bool) {
        if up == self.connected {
            return;
        }
        self.connected = up;

        if !up {
            warn!(participant = %self.participant.id, "Signaling medium unavailable");
            let epoch = self.next_epoch();
            if let Some(room) = self.room.as_mut() {
                room.detach(epoch);
                for (_, mut session) in std::mem::take(&mut room.sessions) {
                    session
                        .teardown(self.links.medium.as_ref(), Cleanup::Skip)
                        .await;
                }
            }
            self.emit(MeshEvent::SignalingUnavailable);
            return;
        }

        info!(participant = %self.participant.id, "Signaling medium reconnected");
        if let Some(room) = &self.room {
            if let Err(e) = room.membership.join().await {
                warn!(room = %room.id, error = %e, "Failed to rejoin after reconnect");
                return;
            }
            if let Err(e) = self.attach(None).await {
                warn!(error = %e, "Failed to resubscribe after reconnect");
                return;
            }
        }
        self.emit(MeshEvent::Reconnected);
    }

    // -- Room inputs -----------------------------------------------------

    async fn handle_room_input(&mut self, input: RoomInput) {
        match &self.room {
            Some(room) if room.epoch == input.epoch => {}
            _ => {
                debug!(epoch = input.epoch, "Dropping room input from a detached subscription");
                return;
            }
        }
        self.handle_room_signal(input.signal).await;
    }

    async fn handle_room_signal(&mut self, signal: RoomSignal) {
        let Some(room) = &self.room else {
            return;
        };
        match signal {
            RoomSignal::Medium(event) if event.key().is_within(&layout::members(&room.id)) => {
                match MembershipEvent::from_medium(&room.id, &event) {
                    Ok(Some(MembershipEvent::Added(record))) => self.member_added(record).await,
                    Ok(Some(MembershipEvent::Removed(participant))) => {
                        self.member_removed(participant).await
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Ignoring malformed membership record"),
                }
            }
            RoomSignal::Medium(event) => {
                let MediumEvent::Added { key, value } = event else {
                    return;
                };
                match SignalingMessage::parse(&room.id, &key, &value) {
                    Ok(message) if *message.to() == self.participant.id => {
                        self.route_signaling(message).await
                    }
                    Ok(_) => debug!(key = %key, "Ignoring signaling addressed elsewhere"),
                    Err(e) => warn!(error = %e, "Ignoring malformed signaling record"),
                }
            }
            RoomSignal::Presence(event) => self.presence_changed(event).await,
        }
    }

    async fn member_added(&mut self, record: MembershipRecord) {
        let remote = record.participant_id.clone();
        if remote == self.participant.id {
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        let (Some(room), Some(stream)) = (self.room.as_mut(), self.local_stream.as_ref()) else {
            return;
        };

        let display_name = record.display_name.clone();
        let is_new = room.members.insert(remote.clone(), record).is_none();
        if room.sessions.contains_key(&remote) {
            return;
        }

        let ctx = self.links.context(stream);
        let mut session = PeerSession::new(
            room.id.clone(),
            self.participant.id.clone(),
            remote.clone(),
            generation,
        );
        session.start(&ctx).await;
        report_failure(&self.events, &session, SessionPhase::Idle, false);
        room.sessions.insert(remote.clone(), session);
        let stashed = room.stash.remove(&remote).unwrap_or_default();

        if is_new {
            info!(room = %room.id, participant = %remote, "Participant joined");
            self.emit(MeshEvent::ParticipantJoined {
                participant: remote,
                display_name,
            });
        }
        for message in stashed {
            self.route_signaling(message).await;
        }
    }

    async fn member_removed(&mut self, remote: ParticipantId) {
        let Some(room) = self.room.as_mut() else {
            return;
        };

        if remote == self.participant.id {
            if self.connected {
                warn!(room = %room.id, "Own membership record removed, re-asserting");
                if let Err(e) = room.membership.join().await {
                    warn!(room = %room.id, error = %e, "Failed to re-assert membership");
                }
            }
            return;
        }

        room.stash.remove(&remote);
        let was_member = room.members.remove(&remote).is_some();
        if let Some(mut session) = room.sessions.remove(&remote) {
            let had_stream = session.remote_stream().is_some();
            session
                .teardown(self.links.medium.as_ref(), Cleanup::Pair)
                .await;
            if had_stream {
                self.emit(MeshEvent::StreamRemoved {
                    participant: remote.clone(),
                });
            }
        }
        if was_member {
            info!(participant = %remote, "Participant left");
            self.emit(MeshEvent::ParticipantLeft { participant: remote });
        }
    }

    /// Hand an offer or answer to its session, replacing the session when a
    /// restarted remote opens a new negotiation.
    async fn route_signaling(&mut self, message: SignalingMessage) {
        let (Some(room), Some(stream)) = (self.room.as_mut(), self.local_stream.as_ref()) else {
            return;
        };
        let remote = message.from().clone();
        if !room.members.contains_key(&remote) {
            debug!(participant = %remote, "Holding signaling from a participant not yet seen as member");
            room.stash.entry(remote).or_default().push(message);
            return;
        }
        let ctx = self.links.context(stream);

        match message {
            SignalingMessage::Offer { description, .. } => {
                let replace = room
                    .sessions
                    .get(&remote)
                    .map_or(true, |s| s.superseded_by(&description.negotiation_id));
                if replace {
                    if let Some(mut old) = room.sessions.remove(&remote) {
                        info!(participant = %remote, "Remote restarted negotiation, replacing session");
                        old.teardown(ctx.medium, Cleanup::Own).await;
                    }
                    self.generation += 1;
                    let mut session = PeerSession::new(
                        room.id.clone(),
                        self.participant.id.clone(),
                        remote.clone(),
                        self.generation,
                    );
                    session.start(&ctx).await;
                    room.sessions.insert(remote.clone(), session);
                }
                if let Some(session) = room.sessions.get_mut(&remote) {
                    let before = (session.phase(), session.remote_stream().is_some());
                    session.handle_offer(&ctx, description).await;
                    report_failure(&self.events, session, before.0, before.1);
                }
            }
            SignalingMessage::Answer { description, .. } => {
                if let Some(session) = room.sessions.get_mut(&remote) {
                    let before = (session.phase(), session.remote_stream().is_some());
                    session.handle_answer(&ctx, description).await;
                    report_failure(&self.events, session, before.0, before.1);
                }
            }
            // Candidates arrive through the per-session feed.
            SignalingMessage::IceCandidate { .. } => {}
        }
    }

    async fn presence_changed(&mut self, event: PresenceEvent) {
        let PresenceEvent::Offline {
            participant,
            last_changed: Some(offline_at),
        } = event
        else {
            return;
        };
        if !self.config.evict_offline_members || participant == self.participant.id {
            return;
        }
        let Some(room) = &self.room else {
            return;
        };
        let Some(joined_at) = room
            .members
            .get(&participant)
            .and_then(|m| m.joined_at.millis())
        else {
            return;
        };
        if offline_at <= joined_at {
            return;
        }

        let evicted = room.membership.evict(&participant).await;
        match evicted {
            Ok(()) => self.emit(MeshEvent::Evicted { participant }),
            Err(e) => warn!(participant = %participant, error = %e, "Failed to evict offline member"),
        }
    }

    // -- Session inputs --------------------------------------------------

    async fn handle_candidate_feed(&mut self, feed: CandidateFeedEvent) {
        let (Some(room), Some(stream)) = (self.room.as_mut(), self.local_stream.as_ref()) else {
            return;
        };
        let Some(session) = room.sessions.get_mut(&feed.remote) else {
            return;
        };
        if session.generation() != feed.generation {
            return;
        }
        let MediumEvent::Added { key, value } = feed.event else {
            return;
        };
        match SignalingMessage::parse(&room.id, &key, &value) {
            Ok(SignalingMessage::IceCandidate { entry, candidate, .. }) => {
                let ctx = self.links.context(stream);
                let before = (session.phase(), session.remote_stream().is_some());
                session.handle_candidate(&ctx, entry, candidate).await;
                report_failure(&self.events, session, before.0, before.1);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Ignoring malformed candidate"),
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let (Some(room), Some(stream)) = (self.room.as_mut(), self.local_stream.as_ref()) else {
            return;
        };
        let Some(session) = room.sessions.get_mut(&event.remote) else {
            return;
        };
        if session.generation() != event.generation {
            debug!(participant = %event.remote, "Dropping event from a replaced connection");
            return;
        }
        let ctx = self.links.context(stream);
        let before = (session.phase(), session.remote_stream().is_some());

        match event.kind {
            PeerEventKind::IceCandidate(candidate) => {
                session.handle_local_candidate(&ctx, candidate).await;
            }
            PeerEventKind::TrackAdded(remote_stream) => {
                if session.handle_track(remote_stream.clone()) {
                    info!(participant = %event.remote, stream = %remote_stream.id, "Remote stream added");
                    let _ = self.events.send(MeshEvent::StreamAdded {
                        participant: event.remote.clone(),
                        stream: remote_stream,
                    });
                }
            }
            PeerEventKind::ConnectionState(state) => {
                session.handle_connection_state(&ctx, state).await;
                if state == ConnectionState::Connected && !session.phase().is_terminal() {
                    info!(participant = %event.remote, "Peer connected");
                    let _ = self.events.send(MeshEvent::PeerConnected {
                        participant: event.remote.clone(),
                    });
                }
            }
        }
        report_failure(&self.events, session, before.0, before.1);
    }
}

/// Emit the events for a session that just moved to `Failed`.
fn report_failure(
    events: &mpsc::UnboundedSender<MeshEvent>,
    session: &PeerSession,
    phase_before: SessionPhase,
    had_stream: bool,
) {
    if session.phase() != SessionPhase::Failed || phase_before == SessionPhase::Failed {
        return;
    }
    if had_stream {
        let _ = events.send(MeshEvent::StreamRemoved {
            participant: session.remote().clone(),
        });
    }
    let _ = events.send(MeshEvent::PeerFailed {
        participant: session.remote().clone(),
        reason: session.last_error().unwrap_or("unknown").to_string(),
    });
}
