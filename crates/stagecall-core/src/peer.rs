//! Per-peer negotiation.
//!
//! A [`PeerLink`] is the state machine for one remote participant. It lives
//! on the client event loop; the actual media calls run on a dedicated
//! worker task per link so that a slow `create_offer` on one link never
//! holds up events for another. Operations for a single link are executed
//! strictly in the order they were queued.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::StageError;
use crate::media::TrackHandle;
use crate::signal::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveRemoteAnswer,
    Connected,
    Disconnected,
    Closed,
}

impl NegotiationState {
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            Self::New | Self::HaveLocalOffer | Self::HaveRemoteOffer | Self::HaveRemoteAnswer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkScope {
    Room(String),
    Call,
}

impl LinkScope {
    pub fn room_id(&self) -> Option<String> {
        match self {
            Self::Room(id) => Some(id.clone()),
            Self::Call => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Transport-level connectivity reported by the media layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaPhase {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// A negotiated media connection, implemented by the platform's WebRTC stack.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: TrackHandle) -> Result<(), StageError>;
    async fn create_offer(&self) -> Result<SessionDescription, StageError>;
    async fn create_answer(&self) -> Result<SessionDescription, StageError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), StageError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), StageError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), StageError>;
    async fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection for `peer`. Media-layer callbacks (local
    /// candidates, connectivity, remote tracks) must be reported to `events`.
    fn create(
        &self,
        peer: &str,
        ice_servers: &[IceServerConfig],
        events: MediaEventSink,
    ) -> Result<Arc<dyn PeerConnection>, StageError>;
}

#[derive(Debug)]
pub(crate) enum LinkOp {
    AttachTracks(Vec<TrackHandle>),
    CreateOffer,
    ApplyRemote(SessionDescription),
    CreateAnswer,
    AddCandidates(Vec<IceCandidate>),
    Close,
}

#[derive(Debug)]
pub(crate) enum LinkOutcome {
    OfferReady(SessionDescription),
    AnswerReady(SessionDescription),
    RemoteApplied,
    Failed(StageError),
}

#[derive(Debug)]
pub(crate) enum LinkEventKind {
    LocalCandidate(IceCandidate),
    Phase(MediaPhase),
    RemoteTrack(TrackHandle),
    Outcome(LinkOutcome),
}

#[derive(Debug)]
pub(crate) struct LinkEvent {
    pub link: LinkId,
    pub peer: String,
    pub kind: LinkEventKind,
}

/// Handed to the media layer; routes its callbacks back to the event loop.
#[derive(Clone)]
pub struct MediaEventSink {
    link: LinkId,
    peer: String,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl MediaEventSink {
    pub(crate) fn new(link: LinkId, peer: &str, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            link,
            peer: peer.to_string(),
            tx,
        }
    }

    fn send(&self, kind: LinkEventKind) {
        let event = LinkEvent {
            link: self.link,
            peer: self.peer.clone(),
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(peer = %self.peer, "media event after client shutdown");
        }
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.send(LinkEventKind::LocalCandidate(candidate));
    }

    pub fn phase(&self, phase: MediaPhase) {
        self.send(LinkEventKind::Phase(phase));
    }

    pub fn remote_track(&self, track: TrackHandle) {
        self.send(LinkEventKind::RemoteTrack(track));
    }

    fn outcome(&self, outcome: LinkOutcome) {
        self.send(LinkEventKind::Outcome(outcome));
    }
}

/// Which side of a concurrent offer race keeps its offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlareResolution {
    KeepLocalOffer,
    YieldToRemote,
}

/// The lexicographically smaller participant id is always the offerer.
pub fn designated_offerer<'a>(a: &'a str, b: &'a str) -> &'a str {
    if a <= b { a } else { b }
}

pub fn resolve_glare(local: &str, remote: &str) -> GlareResolution {
    if designated_offerer(local, remote) == local {
        GlareResolution::KeepLocalOffer
    } else {
        GlareResolution::YieldToRemote
    }
}

pub struct PeerLink {
    id: LinkId,
    peer: String,
    role: LinkRole,
    scope: LinkScope,
    state: NegotiationState,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<TrackHandle>,
    ops: mpsc::UnboundedSender<LinkOp>,
}

impl PeerLink {
    pub(crate) fn new(
        id: LinkId,
        peer: &str,
        role: LinkRole,
        scope: LinkScope,
        ops: mpsc::UnboundedSender<LinkOp>,
    ) -> Self {
        Self {
            id,
            peer: peer.to_string(),
            role,
            scope,
            state: NegotiationState::New,
            remote_applied: false,
            pending_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            ops,
        }
    }

    /// Create the media connection and start this link's worker task.
    pub(crate) fn spawn(
        id: LinkId,
        peer: &str,
        role: LinkRole,
        scope: LinkScope,
        factory: &dyn PeerConnectionFactory,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, StageError> {
        let sink = MediaEventSink::new(id, peer, events);
        let conn = factory.create(peer, ice_servers, sink.clone())?;
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(conn, ops_rx, sink));
        tracing::debug!(peer, %id, ?role, "peer link created");
        Ok(Self::new(id, peer, role, scope, ops_tx))
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn scope(&self) -> &LinkScope {
        &self.scope
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn remote_tracks(&self) -> &[TrackHandle] {
        &self.remote_tracks
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// An offer from this side is in flight or outstanding.
    pub fn is_offering(&self) -> bool {
        self.role == LinkRole::Offerer
            && matches!(
                self.state,
                NegotiationState::New | NegotiationState::HaveLocalOffer
            )
    }

    fn queue(&self, op: LinkOp) {
        if self.ops.send(op).is_err() {
            tracing::debug!(peer = %self.peer, id = %self.id, "link worker already stopped");
        }
    }

    fn out_of_sequence(&self, what: &str) -> StageError {
        StageError::negotiation(&self.peer, format!("{what} in state {:?}", self.state))
    }

    pub(crate) fn attach_tracks(&self, tracks: Vec<TrackHandle>) {
        if !tracks.is_empty() {
            self.queue(LinkOp::AttachTracks(tracks));
        }
    }

    /// Ask the worker for an offer. Only valid for a fresh offerer link.
    pub(crate) fn create_offer(&self) -> Result<(), StageError> {
        if self.role != LinkRole::Offerer || self.state != NegotiationState::New {
            return Err(self.out_of_sequence("create offer"));
        }
        self.queue(LinkOp::CreateOffer);
        Ok(())
    }

    /// Worker produced and applied the local offer.
    pub(crate) fn on_local_offer(&mut self) -> Result<(), StageError> {
        if self.state != NegotiationState::New {
            return Err(self.out_of_sequence("local offer"));
        }
        self.state = NegotiationState::HaveLocalOffer;
        Ok(())
    }

    pub(crate) fn apply_remote_offer(&mut self, offer: SessionDescription) -> Result<(), StageError> {
        if self.role != LinkRole::Answerer || self.state != NegotiationState::New {
            return Err(self.out_of_sequence("remote offer"));
        }
        self.state = NegotiationState::HaveRemoteOffer;
        self.queue(LinkOp::ApplyRemote(offer));
        self.queue(LinkOp::CreateAnswer);
        Ok(())
    }

    pub(crate) fn apply_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), StageError> {
        let expected = self.role == LinkRole::Offerer
            && matches!(
                self.state,
                NegotiationState::New | NegotiationState::HaveLocalOffer
            );
        if !expected {
            return Err(self.out_of_sequence("remote answer"));
        }
        self.state = NegotiationState::HaveRemoteAnswer;
        self.queue(LinkOp::ApplyRemote(answer));
        Ok(())
    }

    /// Buffer until the remote description is applied, then pass straight through.
    pub(crate) fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state == NegotiationState::Closed {
            return;
        }
        if self.remote_applied {
            self.queue(LinkOp::AddCandidates(vec![candidate]));
        } else {
            self.pending_candidates.push(candidate);
        }
    }

    /// Candidates that arrived before this link existed, in arrival order.
    pub(crate) fn adopt_candidates(&mut self, early: Vec<IceCandidate>) {
        for candidate in early {
            self.add_remote_candidate(candidate);
        }
    }

    /// The worker applied the remote description: flush the buffer once.
    pub(crate) fn on_remote_applied(&mut self) -> usize {
        if self.remote_applied || self.state == NegotiationState::Closed {
            return 0;
        }
        self.remote_applied = true;
        let flushed = std::mem::take(&mut self.pending_candidates);
        let count = flushed.len();
        if count > 0 {
            tracing::debug!(peer = %self.peer, count, "flushing buffered ICE candidates");
            self.queue(LinkOp::AddCandidates(flushed));
        }
        count
    }

    /// Returns true when the owner must tear the link down.
    pub(crate) fn on_media_phase(&mut self, phase: MediaPhase) -> bool {
        let before = self.state;
        match phase {
            MediaPhase::Connected if self.state.is_negotiating() => {
                self.state = NegotiationState::Connected;
            }
            MediaPhase::Disconnected if self.state == NegotiationState::Connected => {
                self.state = NegotiationState::Disconnected;
            }
            MediaPhase::Failed if self.state != NegotiationState::Closed => {
                self.state = NegotiationState::Disconnected;
            }
            _ => {}
        }
        if before != self.state {
            tracing::info!(peer = %self.peer, from = ?before, to = ?self.state, "peer link state");
        }
        before != NegotiationState::Disconnected && self.state == NegotiationState::Disconnected
    }

    pub(crate) fn add_remote_track(&mut self, track: TrackHandle) {
        if !self.remote_tracks.iter().any(|t| t.id() == track.id()) {
            self.remote_tracks.push(track);
        }
    }

    /// Idempotent.
    pub(crate) fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        self.remote_tracks.clear();
        self.queue(LinkOp::Close);
        tracing::debug!(peer = %self.peer, id = %self.id, "peer link closed");
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_link(
    conn: Arc<dyn PeerConnection>,
    mut ops: mpsc::UnboundedReceiver<LinkOp>,
    sink: MediaEventSink,
) {
    while let Some(op) = ops.recv().await {
        match op {
            LinkOp::AttachTracks(tracks) => {
                for track in tracks {
                    if let Err(e) = conn.add_track(track).await {
                        sink.outcome(LinkOutcome::Failed(e));
                    }
                }
            }
            LinkOp::CreateOffer => {
                let result = async {
                    let offer = conn.create_offer().await?;
                    conn.set_local_description(offer.clone()).await?;
                    Ok::<_, StageError>(offer)
                }
                .await;
                sink.outcome(match result {
                    Ok(offer) => LinkOutcome::OfferReady(offer),
                    Err(e) => LinkOutcome::Failed(e),
                });
            }
            LinkOp::ApplyRemote(desc) => {
                sink.outcome(match conn.set_remote_description(desc).await {
                    Ok(()) => LinkOutcome::RemoteApplied,
                    Err(e) => LinkOutcome::Failed(e),
                });
            }
            LinkOp::CreateAnswer => {
                let result = async {
                    let answer = conn.create_answer().await?;
                    conn.set_local_description(answer.clone()).await?;
                    Ok::<_, StageError>(answer)
                }
                .await;
                sink.outcome(match result {
                    Ok(answer) => LinkOutcome::AnswerReady(answer),
                    Err(e) => LinkOutcome::Failed(e),
                });
            }
            LinkOp::AddCandidates(candidates) => {
                for candidate in candidates {
                    if let Err(e) = conn.add_ice_candidate(candidate).await {
                        tracing::warn!(peer = %sink.peer, "failed to add ICE candidate: {e}");
                    }
                }
            }
            LinkOp::Close => break,
        }
    }
    conn.close().await;
}
