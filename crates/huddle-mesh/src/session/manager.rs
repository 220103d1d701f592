//! The per-peer session state machine.

use std::collections::HashSet;

use huddle_common::key::layout;
use huddle_common::{
    CandidateRecord, DescriptionRecord, HuddleError, Key, MediumEvent, NegotiationId,
    ParticipantId, RoomId, TransportError,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::state::{Role, SessionPhase};
use crate::media::{LocalStream, RemoteStream};
use crate::medium::{Forwarder, SignalingMedium};
use crate::transport::{
    ConnectionState, IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, RtcConfig, SdpKind, SessionDescription,
};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// An event from a session's inbound candidate list.
#[derive(Debug, Clone)]
pub struct CandidateFeedEvent {
    pub remote: ParticipantId,
    pub generation: u64,
    pub event: MediumEvent,
}

/// Collaborators a session needs while handling one event. Borrowed from
/// the coordinator for the duration of the call.
pub struct SessionContext<'a> {
    pub medium: &'a dyn SignalingMedium,
    pub factory: &'a dyn PeerConnectionFactory,
    pub rtc: &'a RtcConfig,
    pub local_stream: &'a LocalStream,
    pub peer_events: &'a mpsc::UnboundedSender<PeerEvent>,
    pub candidate_events: &'a mpsc::UnboundedSender<CandidateFeedEvent>,
}

/// Which signaling records a teardown removes from the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Everything addressed to or from this pair.
    Pair,
    /// Only the records this side published. Used when the remote has
    /// already started a new negotiation whose records must survive.
    Own,
    /// Nothing; the medium is unreachable.
    Skip,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Negotiation state for one `(local, remote)` pair.
pub struct PeerSession {
    room: RoomId,
    local: ParticipantId,
    remote: ParticipantId,
    role: Role,
    generation: u64,
    phase: SessionPhase,
    connection_state: ConnectionState,
    negotiation: Option<NegotiationId>,
    connection: Option<Box<dyn PeerConnection>>,
    remote_description_set: bool,
    local_description_published: bool,
    /// Inbound candidates waiting for the remote description, in arrival order.
    buffered: Vec<(String, CandidateRecord)>,
    /// Inbound candidate entries already handled.
    seen_entries: HashSet<String>,
    /// Outbound candidates waiting for our description to be published.
    held: Vec<IceCandidate>,
    remote_stream: Option<RemoteStream>,
    candidate_feed: Option<Forwarder>,
    last_error: Option<String>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("generation", &self.generation)
            .field("phase", &self.phase)
            .field("connection_state", &self.connection_state)
            .field("negotiation", &self.negotiation)
            .finish()
    }
}

impl PeerSession {
    pub fn new(room: RoomId, local: ParticipantId, remote: ParticipantId, generation: u64) -> Self {
        let role = Role::for_pair(&local, &remote);
        Self {
            room,
            local,
            remote,
            role,
            generation,
            phase: SessionPhase::Idle,
            connection_state: ConnectionState::New,
            negotiation: None,
            connection: None,
            remote_description_set: false,
            local_description_published: false,
            buffered: Vec::new(),
            seen_entries: HashSet::new(),
            held: Vec::new(),
            remote_stream: None,
            candidate_feed: None,
            last_error: None,
        }
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn negotiation_id(&self) -> Option<&NegotiationId> {
        self.negotiation.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Inbound candidates held until the remote description is applied.
    pub fn buffered_candidates(&self) -> usize {
        self.buffered.len()
    }

    /// True if an offer carrying `negotiation` must replace this session
    /// rather than update it: the remote restarted, or this side already
    /// failed or closed and can no longer answer.
    pub fn superseded_by(&self, negotiation: &NegotiationId) -> bool {
        self.role == Role::Answerer
            && (self.phase.is_terminal()
                || self
                    .negotiation
                    .as_ref()
                    .is_some_and(|current| current != negotiation))
    }

    // -- Lifecycle -------------------------------------------------------

    /// Subscribe to the inbound candidate list and, on the offering side,
    /// send the offer. The answering side waits for an offer.
    pub async fn start(&mut self, ctx: &SessionContext<'_>) {
        let list = layout::candidates(&self.room, &self.remote, &self.local);
        match ctx.medium.subscribe(&list).await {
            Ok(subscription) => {
                let remote = self.remote.clone();
                let generation = self.generation;
                self.candidate_feed = Some(subscription.forward(
                    ctx.candidate_events.clone(),
                    move |event| CandidateFeedEvent {
                        remote: remote.clone(),
                        generation,
                        event,
                    },
                ));
            }
            Err(e) => {
                self.fail(ctx, e.into()).await;
                return;
            }
        }

        info!(
            remote = %self.remote,
            role = ?self.role,
            generation = self.generation,
            "Peer session started"
        );

        if self.role == Role::Offerer {
            if let Err(e) = self.send_offer(ctx).await {
                self.fail(ctx, e).await;
            }
        }
    }

    /// Close the connection and drop everything this session holds.
    pub async fn teardown(&mut self, medium: &dyn SignalingMedium, cleanup: Cleanup) {
        self.shutdown().await;
        self.delete_records(medium, cleanup).await;
        if self.phase != SessionPhase::Failed {
            self.phase = SessionPhase::Closed;
        }
        info!(remote = %self.remote, generation = self.generation, ?cleanup, "Peer session torn down");
    }

    // -- Inbound signaling -----------------------------------------------

    pub async fn handle_offer(&mut self, ctx: &SessionContext<'_>, offer: DescriptionRecord) {
        let key = layout::offer(&self.room, &self.local, &self.remote);
        if self.role == Role::Offerer {
            warn!(remote = %self.remote, "Offer from a peer that should answer; discarding");
            best_effort_delete(ctx.medium, &key).await;
            return;
        }
        if self.negotiation.as_ref() == Some(&offer.negotiation_id) {
            debug!(remote = %self.remote, "Duplicate offer ignored");
            return;
        }
        if self.phase.is_terminal() {
            return;
        }
        if let Err(e) = self.answer_offer(ctx, offer, &key).await {
            self.fail(ctx, e).await;
        }
    }

    pub async fn handle_answer(&mut self, ctx: &SessionContext<'_>, answer: DescriptionRecord) {
        let key = layout::answer(&self.room, &self.local, &self.remote);
        if self.role == Role::Answerer || self.negotiation.as_ref() != Some(&answer.negotiation_id) {
            debug!(remote = %self.remote, "Stale answer discarded");
            best_effort_delete(ctx.medium, &key).await;
            return;
        }
        if self.remote_description_set || self.phase.is_terminal() {
            debug!(remote = %self.remote, "Duplicate answer ignored");
            return;
        }
        if let Err(e) = self.apply_answer(ctx, answer, &key).await {
            self.fail(ctx, e).await;
        }
    }

    pub async fn handle_candidate(
        &mut self,
        ctx: &SessionContext<'_>,
        entry: String,
        record: CandidateRecord,
    ) {
        if self.phase.is_terminal() || !self.seen_entries.insert(entry.clone()) {
            return;
        }
        if let Some(current) = &self.negotiation {
            if *current != record.negotiation_id {
                self.discard_stale_candidate(ctx.medium, &entry).await;
                return;
            }
        }
        if !self.remote_description_set {
            debug!(remote = %self.remote, entry = %entry, "Buffering candidate");
            self.buffered.push((entry, record));
            return;
        }
        if let Err(e) = self.apply_candidate(record).await {
            self.fail(ctx, e).await;
        }
    }

    // -- Connection callbacks --------------------------------------------

    pub async fn handle_local_candidate(&mut self, ctx: &SessionContext<'_>, candidate: IceCandidate) {
        if self.phase.is_terminal() {
            return;
        }
        if !self.local_description_published {
            self.held.push(candidate);
            return;
        }
        self.publish_candidate(ctx.medium, candidate).await;
    }

    /// Returns true if the inbound stream changed.
    pub fn handle_track(&mut self, stream: RemoteStream) -> bool {
        if self.phase.is_terminal() || self.remote_stream.as_ref() == Some(&stream) {
            return false;
        }
        self.remote_stream = Some(stream);
        true
    }

    pub async fn handle_connection_state(&mut self, ctx: &SessionContext<'_>, state: ConnectionState) {
        if self.phase.is_terminal() {
            return;
        }
        debug!(remote = %self.remote, ?state, "Connection state changed");
        self.connection_state = state;
        if state.is_terminal() {
            let reason = format!("connection {state:?}").to_lowercase();
            self.fail(ctx, TransportError::Connection(reason).into()).await;
        }
    }

    // -- Negotiation steps -----------------------------------------------

    async fn open_connection(&mut self, ctx: &SessionContext<'_>) -> Result<(), HuddleError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let sink = PeerEventSink::new(self.remote.clone(), self.generation, ctx.peer_events.clone());
        let connection = ctx.factory.create(&self.remote, ctx.rtc, sink).await?;
        for track in &ctx.local_stream.tracks {
            connection.add_local_track(track).await?;
        }
        self.connection = Some(connection);
        Ok(())
    }

    async fn send_offer(&mut self, ctx: &SessionContext<'_>) -> Result<(), HuddleError> {
        self.phase = SessionPhase::Offering;
        let negotiation = NegotiationId::new();
        self.negotiation = Some(negotiation.clone());
        self.open_connection(ctx).await?;

        let connection = self.connection()?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;

        // Candidates from an earlier negotiation must not reach the new one.
        ctx.medium
            .delete(&layout::candidates(&self.room, &self.local, &self.remote))
            .await?;
        let record = DescriptionRecord {
            negotiation_id: negotiation,
            sdp: offer.sdp,
        };
        ctx.medium
            .put(&layout::offer(&self.room, &self.remote, &self.local), record.to_value())
            .await?;

        self.local_description_published = true;
        self.phase = SessionPhase::OfferSent;
        info!(remote = %self.remote, negotiation = %record.negotiation_id, "Offer sent");
        self.flush_held(ctx.medium).await;
        Ok(())
    }

    async fn answer_offer(
        &mut self,
        ctx: &SessionContext<'_>,
        offer: DescriptionRecord,
        offer_key: &Key,
    ) -> Result<(), HuddleError> {
        self.phase = SessionPhase::OfferReceived;
        self.negotiation = Some(offer.negotiation_id.clone());
        self.open_connection(ctx).await?;

        self.connection()?
            .set_remote_description(SessionDescription {
                kind: SdpKind::Offer,
                sdp: offer.sdp,
            })
            .await?;
        self.remote_description_set = true;
        self.flush_buffered(ctx.medium).await?;
        best_effort_delete(ctx.medium, offer_key).await;

        let connection = self.connection()?;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;

        ctx.medium
            .delete(&layout::candidates(&self.room, &self.local, &self.remote))
            .await?;
        let record = DescriptionRecord {
            negotiation_id: offer.negotiation_id,
            sdp: answer.sdp,
        };
        ctx.medium
            .put(&layout::answer(&self.room, &self.remote, &self.local), record.to_value())
            .await?;

        self.local_description_published = true;
        self.phase = SessionPhase::AnswerSent;
        info!(remote = %self.remote, negotiation = %record.negotiation_id, "Answer sent");
        self.flush_held(ctx.medium).await;
        self.phase = SessionPhase::Connected;
        Ok(())
    }

    async fn apply_answer(
        &mut self,
        ctx: &SessionContext<'_>,
        answer: DescriptionRecord,
        answer_key: &Key,
    ) -> Result<(), HuddleError> {
        self.phase = SessionPhase::AnswerReceived;
        self.connection()?
            .set_remote_description(SessionDescription {
                kind: SdpKind::Answer,
                sdp: answer.sdp,
            })
            .await?;
        self.remote_description_set = true;
        self.flush_buffered(ctx.medium).await?;
        best_effort_delete(ctx.medium, answer_key).await;
        self.phase = SessionPhase::Connected;
        info!(remote = %self.remote, "Answer applied");
        Ok(())
    }

    async fn apply_candidate(&self, record: CandidateRecord) -> Result<(), HuddleError> {
        self.connection()?
            .add_ice_candidate(IceCandidate {
                candidate: record.candidate,
                sdp_mid: record.sdp_mid,
                sdp_m_line_index: record.sdp_m_line_index,
            })
            .await?;
        Ok(())
    }

    /// Apply buffered candidates in arrival order. Candidates from another
    /// negotiation are stale and removed instead.
    async fn flush_buffered(&mut self, medium: &dyn SignalingMedium) -> Result<(), HuddleError> {
        let buffered = std::mem::take(&mut self.buffered);
        if !buffered.is_empty() {
            debug!(remote = %self.remote, count = buffered.len(), "Flushing buffered candidates");
        }
        for (entry, record) in buffered {
            if self.negotiation.as_ref() != Some(&record.negotiation_id) {
                self.discard_stale_candidate(medium, &entry).await;
                continue;
            }
            self.apply_candidate(record).await?;
        }
        Ok(())
    }

    async fn flush_held(&mut self, medium: &dyn SignalingMedium) {
        for candidate in std::mem::take(&mut self.held) {
            self.publish_candidate(medium, candidate).await;
        }
    }

    async fn publish_candidate(&self, medium: &dyn SignalingMedium, candidate: IceCandidate) {
        let Some(negotiation) = self.negotiation.clone() else {
            return;
        };
        let record = CandidateRecord {
            negotiation_id: negotiation,
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_m_line_index: candidate.sdp_m_line_index,
        };
        let list = layout::candidates(&self.room, &self.local, &self.remote);
        if let Err(e) = medium.append(&list, record.to_value()).await {
            warn!(remote = %self.remote, error = %e, "Failed to publish candidate");
        }
    }

    async fn discard_stale_candidate(&self, medium: &dyn SignalingMedium, entry: &str) {
        debug!(remote = %self.remote, entry = %entry, "Stale candidate discarded");
        let key = layout::candidates(&self.room, &self.remote, &self.local).child(entry);
        best_effort_delete(medium, &key).await;
    }

    // -- Failure and cleanup ---------------------------------------------

    /// Scoped to this pair: close everything and stay registered as
    /// `Failed`. No retry.
    async fn fail(&mut self, ctx: &SessionContext<'_>, error: HuddleError) {
        warn!(remote = %self.remote, phase = %self.phase, error = %error, "Peer session failed");
        self.last_error = Some(error.to_string());
        self.phase = SessionPhase::Failed;
        self.shutdown().await;
        let cleanup = match error {
            HuddleError::Medium(_) => Cleanup::Skip,
            _ => Cleanup::Pair,
        };
        self.delete_records(ctx.medium, cleanup).await;
    }

    async fn shutdown(&mut self) {
        self.candidate_feed = None;
        self.buffered.clear();
        self.held.clear();
        self.remote_stream = None;
        if let Some(connection) = self.connection.take() {
            connection.close().await;
            if !self.connection_state.is_terminal() {
                self.connection_state = ConnectionState::Closed;
            }
        }
    }

    async fn delete_records(&self, medium: &dyn SignalingMedium, cleanup: Cleanup) {
        let (room, local, remote) = (&self.room, &self.local, &self.remote);
        let own = [
            layout::offer(room, remote, local),
            layout::answer(room, remote, local),
            layout::candidates(room, local, remote),
        ];
        let inbound = [
            layout::offer(room, local, remote),
            layout::answer(room, local, remote),
            layout::candidates(room, remote, local),
        ];
        let keys: Vec<&Key> = match cleanup {
            Cleanup::Pair => own.iter().chain(inbound.iter()).collect(),
            Cleanup::Own => own.iter().collect(),
            Cleanup::Skip => Vec::new(),
        };
        for key in keys {
            best_effort_delete(medium, key).await;
        }
    }

    fn connection(&self) -> Result<&dyn PeerConnection, HuddleError> {
        self.connection
            .as_deref()
            .ok_or(HuddleError::Transport(TransportError::Closed))
    }
}

/// Deletion of consumed or obsolete records is not transactional; a failure
/// only leaves a record that the next reader treats as stale.
async fn best_effort_delete(medium: &dyn SignalingMedium, key: &Key) {
    if let Err(e) = medium.delete(key).await {
        debug!(key = %key, error = %e, "Best-effort delete failed");
    }
}
