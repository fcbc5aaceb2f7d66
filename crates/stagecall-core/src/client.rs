//! The client façade and its event loop.
//!
//! All session, link, chat and call state lives in [`EventLoop`], a single
//! task fed by four queues: API commands, transport events, internal timers
//! and media-layer callbacks. Anything that suspends (device acquisition,
//! SDP generation) runs elsewhere and reports back as a message, so the loop
//! itself never awaits while holding state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::call::{CallSession, CallState};
use crate::chat::{ChatLog, ChatMessage, MessageKind};
use crate::config::ClientConfig;
use crate::errors::StageError;
use crate::events::{ConnectionState, EventEmitter, StageEvent, StageEventListener};
use crate::media::{
    LocalMediaController, LocalMediaState, MediaConstraints, MediaDevices, MediaOwner,
};
use crate::peer::{
    GlareResolution, LinkEvent, LinkEventKind, LinkId, LinkOutcome, LinkRole, LinkScope,
    NegotiationState, PeerConnectionFactory, PeerLink, resolve_glare,
};
use crate::session::{Membership, Participant, Role, RoomInfo, RoomSession};
use crate::signal::{ClientSignal, IceCandidate, ServerSignal, SessionDescription};
use crate::transport::{ANY_EVENT, SignalingTransport, Subscription, TransportEvent};

const MAX_EARLY_CANDIDATES: usize = 64;
const MAX_EARLY_PEERS: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, StageError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub user_id: String,
    pub display_name: String,
}

impl LocalUser {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Point-in-time view of the client state.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub room: Option<RoomInfo>,
    pub participants: Vec<Participant>,
    pub viewer_count: u32,
    pub call_state: CallState,
    pub messages: Vec<ChatMessage>,
    pub links: Vec<(String, NegotiationState)>,
}

enum Command {
    JoinRoom {
        membership: Membership,
        reply: Reply<RoomInfo>,
    },
    LeaveRoom {
        reply: Reply<()>,
    },
    SendMessage {
        text: String,
        kind: MessageKind,
        reply: Reply<()>,
    },
    StartCall {
        target: String,
        reply: Reply<()>,
    },
    AnswerCall {
        offer: SessionDescription,
        from: String,
        reply: Reply<()>,
    },
    DeclineCall {
        from: String,
        reply: Reply<()>,
    },
    EndCall {
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<ClientSnapshot>,
    },
}

enum Internal {
    JoinTimeout {
        seq: u64,
    },
    HistoryWait {
        seq: u64,
    },
    HostMedia {
        room_id: String,
        result: Result<LocalMediaState, StageError>,
    },
    CallMedia {
        generation: u64,
        result: Result<LocalMediaState, StageError>,
    },
    CallSetupTimeout {
        generation: u64,
    },
    RingTimeout {
        generation: u64,
    },
}

/// Handle to a running client. Cheap to clone; the event loop stops when
/// the last handle is dropped.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct StageClient {
    commands: mpsc::UnboundedSender<Command>,
    transport: SignalingTransport,
    media: LocalMediaController,
    emitter: EventEmitter,
}

impl StageClient {
    pub fn new(
        user: LocalUser,
        transport: SignalingTransport,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        config: ClientConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let subscription = transport.on(ANY_EVENT, move |event| {
            let _ = transport_tx.send(event.clone());
        });
        let media = LocalMediaController::new(devices);
        let emitter = EventEmitter::new();

        let event_loop = EventLoop {
            user,
            config,
            transport: transport.clone(),
            media: media.clone(),
            peers,
            emitter: emitter.clone(),
            session: RoomSession::new(),
            room: None,
            chat: ChatLog::new(),
            call: CallSession::new(),
            room_links: HashMap::new(),
            call_link: None,
            early_candidates: HashMap::new(),
            next_link: 0,
            host_media_ready: false,
            renegotiated: HashSet::new(),
            pending_join: None,
            pending_host: None,
            pending_call: None,
            pending_offer: None,
            join_seq: 0,
            history_seq: 0,
            internal_tx,
            link_tx,
            _subscription: subscription,
        };
        tokio::spawn(event_loop.run(commands_rx, transport_rx, internal_rx, link_rx));

        Self {
            commands: commands_tx,
            transport,
            media,
            emitter,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StageEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub async fn connect(&self, server_url: &str, token: Option<&str>) -> Result<(), StageError> {
        self.transport.connect(server_url, token).await
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, StageError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| StageError::ChannelClosed)?;
        rx.await.map_err(|_| StageError::ChannelClosed)?
    }

    /// Join `room_id` and wait for the server acknowledgment. Hosts also
    /// acquire local media before this resolves.
    pub async fn join_room(
        &self,
        room_id: &str,
        user_id: &str,
        display_name: &str,
        as_host: bool,
    ) -> Result<RoomInfo, StageError> {
        let membership = Membership {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            as_host,
        };
        self.request(|reply| Command::JoinRoom { membership, reply })
            .await
    }

    /// Release media, close every room link, send the leave frame and clear
    /// the roster. Every step runs; the first failure is returned.
    pub async fn leave_room(&self) -> Result<(), StageError> {
        self.request(|reply| Command::LeaveRoom { reply }).await
    }

    pub async fn send_message(&self, text: &str) -> Result<(), StageError> {
        let text = text.to_string();
        self.request(|reply| Command::SendMessage {
            text,
            kind: MessageKind::Text,
            reply,
        })
        .await
    }

    pub async fn send_reaction(&self, emoji: &str) -> Result<(), StageError> {
        let text = emoji.to_string();
        self.request(|reply| Command::SendMessage {
            text,
            kind: MessageKind::Reaction,
            reply,
        })
        .await
    }

    /// Resolves once the offer has been sent and the call is ringing.
    pub async fn start_call(&self, target: &str) -> Result<(), StageError> {
        let target = target.to_string();
        self.request(|reply| Command::StartCall { target, reply })
            .await
    }

    /// Resolves once the answer has been sent and the call is active.
    pub async fn answer_call(
        &self,
        offer: SessionDescription,
        from: &str,
    ) -> Result<(), StageError> {
        let from = from.to_string();
        self.request(|reply| Command::AnswerCall { offer, from, reply })
            .await
    }

    pub async fn decline_call(&self, from: &str) -> Result<(), StageError> {
        let from = from.to_string();
        self.request(|reply| Command::DeclineCall { from, reply })
            .await
    }

    pub async fn end_call(&self) -> Result<(), StageError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub fn set_muted(&self, muted: bool) {
        self.media.set_muted(muted);
    }

    pub fn set_camera_enabled(&self, enabled: bool) {
        self.media.set_camera_enabled(enabled);
    }

    pub fn local_media(&self) -> Option<LocalMediaState> {
        self.media.state()
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot, StageError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply: tx })
            .map_err(|_| StageError::ChannelClosed)?;
        rx.await.map_err(|_| StageError::ChannelClosed)
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.snapshot()
            .await
            .map(|s| s.participants)
            .unwrap_or_default()
    }

    pub async fn viewer_count(&self) -> u32 {
        self.snapshot().await.map(|s| s.viewer_count).unwrap_or(0)
    }

    pub async fn room(&self) -> Option<RoomInfo> {
        self.snapshot().await.ok().and_then(|s| s.room)
    }

    pub async fn call_state(&self) -> CallState {
        self.snapshot()
            .await
            .map(|s| s.call_state)
            .unwrap_or(CallState::Idle)
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.snapshot().await.map(|s| s.messages).unwrap_or_default()
    }

    pub async fn link_state(&self, peer: &str) -> Option<NegotiationState> {
        let snapshot = self.snapshot().await.ok()?;
        snapshot
            .links
            .into_iter()
            .find(|(p, _)| p == peer)
            .map(|(_, state)| state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkSlot {
    Room,
    Call,
}

struct PendingJoin {
    seq: u64,
    reply: Reply<RoomInfo>,
}

struct EventLoop {
    user: LocalUser,
    config: ClientConfig,
    transport: SignalingTransport,
    media: LocalMediaController,
    peers: Arc<dyn PeerConnectionFactory>,
    emitter: EventEmitter,
    session: RoomSession,
    room: Option<RoomInfo>,
    chat: ChatLog,
    call: CallSession,
    room_links: HashMap<String, PeerLink>,
    call_link: Option<PeerLink>,
    /// Candidates for peers with no link yet, keyed by (room, peer).
    early_candidates: HashMap<(Option<String>, String), Vec<IceCandidate>>,
    next_link: u64,
    host_media_ready: bool,
    renegotiated: HashSet<String>,
    pending_join: Option<PendingJoin>,
    pending_host: Option<(RoomInfo, Reply<RoomInfo>)>,
    pending_call: Option<Reply<()>>,
    pending_offer: Option<SessionDescription>,
    join_seq: u64,
    history_seq: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    _subscription: Subscription,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        info!(user_id = %self.user.user_id, "client event loop started");
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(event) = transport_rx.recv() => self.handle_transport(event),
                Some(msg) = internal_rx.recv() => self.handle_internal(msg),
                Some(event) = link_rx.recv() => self.handle_link_event(event),
            }
        }
        if let Err(e) = self.teardown_call(StageError::ChannelClosed, true) {
            debug!("end-call on shutdown not delivered: {e}");
        }
        if let Err(e) = self.leave() {
            debug!("leave-room on shutdown not delivered: {e}");
        }
        info!("client event loop finished");
    }

    fn send(&self, signal: ClientSignal) -> Result<(), StageError> {
        self.transport.emit(&signal).inspect_err(|e| {
            warn!(event = signal.name(), "signal not sent: {e}");
        })
    }

    fn schedule(&self, delay: Duration, msg: Internal) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
    }

    fn emit(&self, event: StageEvent) {
        self.emitter.emit(event);
    }

    fn emit_call_state(&self) {
        self.emit(StageEvent::CallStateChanged(self.call.state().clone()));
    }

    fn emit_peer_state(&self, peer: &str, state: NegotiationState) {
        self.emit(StageEvent::PeerStateChanged {
            peer_id: peer.to_string(),
            state,
        });
    }

    fn local_id(&self, scope: &LinkScope) -> String {
        match scope {
            LinkScope::Room(_) => self
                .session
                .membership()
                .map(|m| m.user_id.clone())
                .unwrap_or_else(|| self.user.user_id.clone()),
            LinkScope::Call => self.user.user_id.clone(),
        }
    }

    // ── commands ────────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::JoinRoom { membership, reply } => self.join(membership, reply),
            Command::LeaveRoom { reply } => {
                let _ = reply.send(self.leave());
            }
            Command::SendMessage { text, kind, reply } => {
                let _ = reply.send(self.send_chat(text, kind));
            }
            Command::StartCall { target, reply } => self.start_call(target, reply),
            Command::AnswerCall { offer, from, reply } => self.answer_call(offer, from, reply),
            Command::DeclineCall { from, reply } => {
                let _ = reply.send(self.decline_call(&from));
            }
            Command::EndCall { reply } => {
                let reason = StageError::Cancelled("call ended locally".to_string());
                let _ = reply.send(self.teardown_call(reason, true));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> ClientSnapshot {
        let mut links: Vec<(String, NegotiationState)> = self
            .room_links
            .iter()
            .map(|(peer, link)| (peer.clone(), link.state()))
            .collect();
        if let Some(link) = &self.call_link {
            links.push((link.peer().to_string(), link.state()));
        }
        ClientSnapshot {
            room: self.room.clone(),
            participants: self.session.roster().participants().to_vec(),
            viewer_count: self.session.viewer_count(),
            call_state: self.call.state().clone(),
            messages: self.chat.messages().to_vec(),
            links,
        }
    }

    fn join(&mut self, membership: Membership, reply: Reply<RoomInfo>) {
        if let Err(e) = self.session.begin_join(membership.clone()) {
            let _ = reply.send(Err(e));
            return;
        }
        if let Err(e) = self.send(membership.join_signal()) {
            self.session.reset();
            let _ = reply.send(Err(e));
            return;
        }
        info!(room_id = %membership.room_id, as_host = membership.as_host, "joining room");
        self.join_seq += 1;
        self.pending_join = Some(PendingJoin {
            seq: self.join_seq,
            reply,
        });
        self.schedule(
            self.config.join_timeout(),
            Internal::JoinTimeout { seq: self.join_seq },
        );
    }

    /// Scoped teardown of the room: media, links, leave frame, roster.
    fn leave(&mut self) -> Result<(), StageError> {
        let Some(membership) = self.session.membership().cloned() else {
            debug!("leave ignored: not in a room");
            return Ok(());
        };
        let room_id = membership.room_id.clone();

        self.host_media_ready = false;
        self.media.release_for(&MediaOwner::Room(room_id.clone()));

        let peers: Vec<String> = self.room_links.keys().cloned().collect();
        for peer in peers {
            self.close_room_link(&peer);
        }
        self.early_candidates.retain(|(room, _), _| room.is_none());

        let result = self.send(membership.leave_signal());

        self.destroy_room();
        if let Some(pending) = self.pending_join.take() {
            let _ = pending
                .reply
                .send(Err(StageError::Cancelled(format!("left room {room_id}"))));
        }
        if let Some((_, reply)) = self.pending_host.take() {
            let _ = reply.send(Err(StageError::Cancelled(format!("left room {room_id}"))));
        }
        info!(room_id, "left room");
        result
    }

    /// Forget the room locally without telling the server.
    fn destroy_room(&mut self) {
        if let Some(membership) = self.session.reset() {
            self.media
                .release_for(&MediaOwner::Room(membership.room_id.clone()));
        }
        let peers: Vec<String> = self.room_links.keys().cloned().collect();
        for peer in peers {
            self.close_room_link(&peer);
        }
        self.early_candidates.retain(|(room, _), _| room.is_none());
        self.host_media_ready = false;
        self.renegotiated.clear();
        self.chat.clear();
        self.room = None;
        if let Some((_, reply)) = self.pending_host.take() {
            let _ = reply.send(Err(StageError::NotInRoom));
        }
    }

    fn send_chat(&mut self, text: String, kind: MessageKind) -> Result<(), StageError> {
        let Some(membership) = self.session.joined() else {
            return Err(StageError::NotInRoom);
        };
        self.send(ClientSignal::SendMessage {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: membership.room_id.clone(),
            user_id: membership.user_id.clone(),
            user_name: membership.display_name.clone(),
            content: text,
            kind,
        })
    }

    fn start_call(&mut self, target: String, reply: Reply<()>) {
        let generation = match self.call.begin_outgoing(&target) {
            Ok(generation) => generation,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        info!(peer = %target, "starting call");
        self.pending_call = Some(reply);
        self.acquire_call_media(generation, target);
    }

    fn answer_call(&mut self, offer: SessionDescription, from: String, reply: Reply<()>) {
        if self.pending_call.is_some() {
            let _ = reply.send(Err(StageError::CallInProgress));
            return;
        }
        let generation = match self.call.begin_answer(&from) {
            Ok(generation) => generation,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        info!(peer = %from, "answering call");
        self.pending_offer = Some(offer);
        self.pending_call = Some(reply);
        self.acquire_call_media(generation, from);
    }

    fn decline_call(&mut self, from: &str) -> Result<(), StageError> {
        let ringing = matches!(self.call.state(), CallState::RingingIn { peer } if peer == from);
        if ringing {
            // Also cancels an answer still acquiring media or building its SDP.
            let reason = StageError::Cancelled(format!("call from {from} declined"));
            let _ = self.teardown_call(reason, false);
        }
        self.early_candidates.remove(&(None, from.to_string()));
        info!(peer = from, "declining call");
        self.send(ClientSignal::CallDecline {
            from: self.user.user_id.clone(),
            to: from.to_string(),
        })
    }

    fn acquire_call_media(&self, generation: u64, peer: String) {
        let media = self.media.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = media
                .acquire(MediaOwner::Call(peer), &MediaConstraints::default())
                .await;
            let _ = tx.send(Internal::CallMedia { generation, result });
        });
        self.schedule(
            self.config.call_setup_timeout(),
            Internal::CallSetupTimeout { generation },
        );
    }

    /// Close the link, release media, notify the peer and go idle.
    /// Runs every step regardless; returns the notification result.
    fn teardown_call(&mut self, reason: StageError, notify_remote: bool) -> Result<(), StageError> {
        let Some(peer) = self.call.end() else {
            return Ok(());
        };
        self.pending_offer = None;
        if let Some(reply) = self.pending_call.take() {
            let _ = reply.send(Err(reason));
        }
        self.close_call_link();
        self.early_candidates.retain(|(room, _), _| room.is_some());
        self.media.release_for(&MediaOwner::Call(peer.clone()));
        let result = if notify_remote {
            self.send(ClientSignal::EndCall {
                to: peer.clone(),
                from: self.user.user_id.clone(),
            })
        } else {
            Ok(())
        };
        info!(peer, "call ended");
        self.emit_call_state();
        result
    }

    fn fail_call(&mut self, error: StageError) {
        warn!("call failed: {error}");
        self.emitter.emit_error(&error);
        let _ = self.teardown_call(error, true);
    }

    // ── links ───────────────────────────────────────────────────────────

    fn open_link(
        &mut self,
        peer: &str,
        role: LinkRole,
        scope: LinkScope,
    ) -> Result<PeerLink, StageError> {
        self.next_link += 1;
        let mut link = PeerLink::spawn(
            LinkId(self.next_link),
            peer,
            role,
            scope.clone(),
            self.peers.as_ref(),
            &self.config.ice_servers,
            self.link_tx.clone(),
        )?;
        let owner = match &scope {
            LinkScope::Room(room_id) => MediaOwner::Room(room_id.clone()),
            LinkScope::Call => MediaOwner::Call(peer.to_string()),
        };
        if self.media.owner() == Some(owner) {
            link.attach_tracks(self.media.tracks());
        }
        if let Some(early) = self
            .early_candidates
            .remove(&(scope.room_id(), peer.to_string()))
        {
            debug!(peer, count = early.len(), "adopting early ICE candidates");
            link.adopt_candidates(early);
        }
        self.emit_peer_state(peer, link.state());
        Ok(link)
    }

    fn close_room_link(&mut self, peer: &str) {
        if let Some(mut link) = self.room_links.remove(peer) {
            link.close();
            self.emit_peer_state(peer, NegotiationState::Closed);
        }
    }

    fn close_call_link(&mut self) {
        if let Some(mut link) = self.call_link.take() {
            link.close();
            self.emit_peer_state(link.peer(), NegotiationState::Closed);
        }
    }

    fn open_host_link(&mut self, peer: &str) {
        let Some(membership) = self.session.joined() else {
            return;
        };
        if self.room_links.contains_key(peer) {
            return;
        }
        let scope = LinkScope::Room(membership.room_id.clone());
        let link = match self.open_link(peer, LinkRole::Offerer, scope) {
            Ok(link) => link,
            Err(e) => {
                warn!(peer, "could not open host link: {e}");
                self.emitter.emit_error(&e);
                return;
            }
        };
        match link.create_offer() {
            Ok(()) => {
                self.room_links.insert(peer.to_string(), link);
            }
            Err(e) => self.emitter.emit_error(&e),
        }
    }

    fn buffer_early_candidate(&mut self, room_id: Option<String>, peer: String, c: IceCandidate) {
        if room_id.is_none() && self.call.peer() != Some(peer.as_str()) {
            debug!(peer, "ICE candidate for a call that is not ringing dropped");
            return;
        }
        let key = (room_id, peer);
        if !self.early_candidates.contains_key(&key)
            && self.early_candidates.len() >= MAX_EARLY_PEERS
        {
            warn!(peer = %key.1, "too many peers with early ICE candidates, dropping candidate");
            return;
        }
        let queue = self.early_candidates.entry(key).or_default();
        if queue.len() >= MAX_EARLY_CANDIDATES {
            warn!("early ICE candidate buffer full, dropping candidate");
            return;
        }
        queue.push(c);
    }

    fn locate(&self, id: LinkId, peer: &str) -> Option<LinkSlot> {
        if self.room_links.get(peer).is_some_and(|l| l.id() == id) {
            return Some(LinkSlot::Room);
        }
        if self.call_link.as_ref().is_some_and(|l| l.id() == id) {
            return Some(LinkSlot::Call);
        }
        None
    }

    fn link_mut(&mut self, slot: LinkSlot, peer: &str) -> Option<&mut PeerLink> {
        match slot {
            LinkSlot::Room => self.room_links.get_mut(peer),
            LinkSlot::Call => self.call_link.as_mut(),
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent { link: id, peer, kind } = event;
        let Some(slot) = self.locate(id, &peer) else {
            debug!(peer, %id, "discarding result from closed link");
            return;
        };
        match kind {
            LinkEventKind::LocalCandidate(candidate) => {
                let Some(link) = self.link_mut(slot, &peer) else {
                    return;
                };
                let scope = link.scope().clone();
                let _ = self.send(ClientSignal::IceCandidate {
                    candidate,
                    to: peer.clone(),
                    from: self.local_id(&scope),
                    room_id: scope.room_id(),
                });
            }
            LinkEventKind::Phase(phase) => {
                let Some(link) = self.link_mut(slot, &peer) else {
                    return;
                };
                let before = link.state();
                let teardown = link.on_media_phase(phase);
                let after = link.state();
                if before != after {
                    self.emit_peer_state(&peer, after);
                }
                if teardown {
                    self.on_link_down(slot, &peer);
                }
            }
            LinkEventKind::RemoteTrack(track) => {
                let Some(link) = self.link_mut(slot, &peer) else {
                    return;
                };
                link.add_remote_track(track);
                let tracks = link.remote_tracks().to_vec();
                self.emit(StageEvent::RemoteStream {
                    peer_id: peer,
                    tracks,
                });
            }
            LinkEventKind::Outcome(outcome) => self.handle_outcome(slot, &peer, outcome),
        }
    }

    fn handle_outcome(&mut self, slot: LinkSlot, peer: &str, outcome: LinkOutcome) {
        match outcome {
            LinkOutcome::OfferReady(offer) => {
                let Some(link) = self.link_mut(slot, peer) else {
                    return;
                };
                if let Err(e) = link.on_local_offer() {
                    self.on_negotiation_failed(slot, peer, e);
                    return;
                }
                let scope = link.scope().clone();
                self.emit_peer_state(peer, NegotiationState::HaveLocalOffer);
                let sent = self.send(ClientSignal::CallOffer {
                    offer,
                    to: peer.to_string(),
                    from: self.local_id(&scope),
                    room_id: scope.room_id(),
                });
                if slot == LinkSlot::Call {
                    match sent {
                        Ok(()) => {
                            if let Some(reply) = self.pending_call.take() {
                                let _ = reply.send(Ok(()));
                            }
                            info!(peer, "call ringing");
                            self.emit_call_state();
                            self.schedule(
                                self.config.ring_timeout(),
                                Internal::RingTimeout {
                                    generation: self.call.generation(),
                                },
                            );
                        }
                        Err(e) => self.fail_call(e),
                    }
                }
            }
            LinkOutcome::AnswerReady(answer) => {
                let Some(link) = self.link_mut(slot, peer) else {
                    return;
                };
                let scope = link.scope().clone();
                let sent = self.send(ClientSignal::CallAnswer {
                    answer,
                    to: peer.to_string(),
                    from: self.local_id(&scope),
                    room_id: scope.room_id(),
                });
                if slot == LinkSlot::Call {
                    match sent {
                        Ok(()) => {
                            if self.call.activate(peer) {
                                self.emit_call_state();
                            }
                            if let Some(reply) = self.pending_call.take() {
                                let _ = reply.send(Ok(()));
                            }
                        }
                        Err(e) => self.fail_call(e),
                    }
                }
            }
            LinkOutcome::RemoteApplied => {
                if let Some(link) = self.link_mut(slot, peer) {
                    link.on_remote_applied();
                }
            }
            LinkOutcome::Failed(e) => self.on_negotiation_failed(slot, peer, e),
        }
    }

    fn on_negotiation_failed(&mut self, slot: LinkSlot, peer: &str, error: StageError) {
        match slot {
            LinkSlot::Call => self.fail_call(error),
            LinkSlot::Room => {
                warn!(peer, "closing room link: {error}");
                self.close_room_link(peer);
                self.emitter.emit_error(&error);
            }
        }
    }

    /// The media connection dropped. Calls end; a host retries a room link
    /// once while the viewer is still present.
    fn on_link_down(&mut self, slot: LinkSlot, peer: &str) {
        match slot {
            LinkSlot::Call => {
                self.fail_call(StageError::Transport(format!(
                    "media connection to {peer} lost"
                )));
            }
            LinkSlot::Room => {
                self.close_room_link(peer);
                let present = self.session.roster().get(peer).is_some();
                if self.session.is_host()
                    && self.host_media_ready
                    && present
                    && self.renegotiated.insert(peer.to_string())
                {
                    info!(peer, "renegotiating dropped host link");
                    self.open_host_link(peer);
                }
            }
        }
    }

    // ── internal messages ───────────────────────────────────────────────

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::JoinTimeout { seq } => {
                if !self.pending_join.as_ref().is_some_and(|p| p.seq == seq) {
                    return;
                }
                if let Some(pending) = self.pending_join.take() {
                    if let Some(membership) = self.session.reset() {
                        warn!(room_id = %membership.room_id, "room-joined not received in time");
                        let _ = self.send(membership.leave_signal());
                    }
                    let _ = pending
                        .reply
                        .send(Err(StageError::Timeout("room-joined".to_string())));
                }
            }
            Internal::HistoryWait { seq } => {
                if seq != self.history_seq {
                    return;
                }
                for msg in self.chat.finish_history_wait() {
                    self.emit(StageEvent::NewMessage(msg));
                }
            }
            Internal::HostMedia { room_id, result } => self.on_host_media(room_id, result),
            Internal::CallMedia { generation, result } => {
                if !self.call.is_current(generation) {
                    debug!("discarding media acquired for an ended call");
                    return;
                }
                match result {
                    Ok(_) => self.continue_call(),
                    Err(e) => self.fail_call(e),
                }
            }
            Internal::CallSetupTimeout { generation } => {
                if self.call.is_current(generation) && self.pending_call.is_some() {
                    self.fail_call(StageError::Timeout("call setup".to_string()));
                }
            }
            Internal::RingTimeout { generation } => {
                if self.call.is_current(generation)
                    && let CallState::RingingOut { peer } = self.call.state()
                {
                    let error = StageError::Timeout(format!("{peer} to answer"));
                    self.fail_call(error);
                }
            }
        }
    }

    fn on_host_media(&mut self, room_id: String, result: Result<LocalMediaState, StageError>) {
        // Still current while rejoining after a transport drop.
        let current = self
            .session
            .membership()
            .is_some_and(|m| m.room_id == room_id && m.as_host);
        let reply = match self.pending_host.take() {
            Some((info, reply)) if info.room_id == room_id => Some((info, reply)),
            other => {
                self.pending_host = other;
                None
            }
        };
        match result {
            Ok(_) if current => {
                info!(room_id, "host media ready");
                self.host_media_ready = true;
                if let Some((info, reply)) = reply {
                    let _ = reply.send(Ok(info));
                }
                let viewers: Vec<String> = self
                    .session
                    .roster()
                    .participants()
                    .iter()
                    .filter(|p| !p.is_local && p.role == Role::Viewer)
                    .map(|p| p.user_id.clone())
                    .collect();
                for viewer in viewers {
                    self.open_host_link(&viewer);
                }
            }
            Ok(_) => {
                debug!(room_id, "host media arrived after leaving");
                self.media.release_for(&MediaOwner::Room(room_id.clone()));
                if let Some((_, reply)) = reply {
                    let error = StageError::Cancelled(format!("left room {room_id}"));
                    let _ = reply.send(Err(error));
                }
            }
            Err(e) if current => {
                warn!(room_id, "host media unavailable, leaving room: {e}");
                self.emitter.emit_error(&e);
                if let Err(leave_err) = self.leave() {
                    debug!("leave after media failure: {leave_err}");
                }
                if let Some((_, reply)) = reply {
                    let _ = reply.send(Err(e));
                }
            }
            Err(e) => {
                debug!(room_id, "stale host media failure: {e}");
                if let Some((_, reply)) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    /// Local media is held for the current call; create the link.
    fn continue_call(&mut self) {
        match self.call.state().clone() {
            CallState::RingingOut { peer } => {
                let link = match self.open_link(&peer, LinkRole::Offerer, LinkScope::Call) {
                    Ok(link) => link,
                    Err(e) => return self.fail_call(e),
                };
                if let Err(e) = link.create_offer() {
                    return self.fail_call(e);
                }
                self.call_link = Some(link);
            }
            CallState::RingingIn { peer } => {
                let Some(offer) = self.pending_offer.take() else {
                    debug!(peer, "media ready but no offer to answer yet");
                    return;
                };
                self.answer_offer(&peer, offer);
            }
            CallState::Active { .. } | CallState::Idle => {}
        }
    }

    fn answer_offer(&mut self, peer: &str, offer: SessionDescription) {
        self.close_call_link();
        let mut link = match self.open_link(peer, LinkRole::Answerer, LinkScope::Call) {
            Ok(link) => link,
            Err(e) => return self.fail_call(e),
        };
        if let Err(e) = link.apply_remote_offer(offer) {
            return self.fail_call(e);
        }
        self.call_link = Some(link);
    }

    // ── transport ───────────────────────────────────────────────────────

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Signal(signal) => self.handle_signal(signal),
            TransportEvent::Connected => {
                self.emit(StageEvent::ConnectionStateChanged(ConnectionState::Connected));
            }
            TransportEvent::Reconnecting { attempt } => {
                self.emit(StageEvent::ConnectionStateChanged(
                    ConnectionState::Reconnecting { attempt },
                ));
            }
            TransportEvent::Disconnected { reason, will_retry } => {
                self.on_transport_lost(reason, will_retry);
            }
            TransportEvent::Reconnected { attempt } => {
                self.emit(StageEvent::ConnectionStateChanged(ConnectionState::Connected));
                if let Some(signal) = self.session.rejoin_signal() {
                    info!(attempt, "re-establishing room membership");
                    let _ = self.send(signal);
                }
            }
            TransportEvent::ConnectionFailed { attempts } => {
                self.destroy_room();
                self.emitter
                    .emit_error(&StageError::ConnectionFailed { attempts });
                self.emit(StageEvent::ConnectionStateChanged(
                    ConnectionState::Disconnected,
                ));
            }
        }
    }

    fn on_transport_lost(&mut self, reason: String, will_retry: bool) {
        if self.call.state() != &CallState::Idle {
            let error = StageError::Transport(reason.clone());
            self.emitter.emit_error(&error);
            let _ = self.teardown_call(error, false);
        }

        let peers: Vec<String> = self.room_links.keys().cloned().collect();
        for peer in peers {
            self.close_room_link(&peer);
        }
        if let Some(pending) = self.pending_join.take() {
            self.session.reset();
            let _ = pending
                .reply
                .send(Err(StageError::Transport(reason.clone())));
        }
        for participant in self.session.on_transport_lost() {
            self.emit(StageEvent::UserLeft {
                user_id: participant.user_id,
                viewer_count: self.session.viewer_count(),
            });
        }

        // A retrying transport reports `reconnecting` itself.
        if !will_retry {
            self.destroy_room();
            self.emit(StageEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ));
        }
    }

    fn handle_signal(&mut self, signal: ServerSignal) {
        debug!(event = signal.name(), "signal received");
        match signal {
            ServerSignal::RoomJoined {
                room_id,
                viewer_count,
                is_host,
            } => self.on_room_joined(room_id, viewer_count, is_host),
            ServerSignal::UserJoined {
                user_id,
                user_name,
                viewer_count,
                is_host,
            } => {
                let Some(participant) = self.session.on_user_joined(&user_id, &user_name, is_host)
                else {
                    return;
                };
                let local_count = self.session.viewer_count();
                if local_count != viewer_count {
                    debug!(server = viewer_count, local = local_count, "viewer count differs");
                }
                self.emit(StageEvent::UserJoined {
                    participant: participant.clone(),
                    viewer_count: local_count,
                });
                if self.session.is_host()
                    && self.host_media_ready
                    && participant.role == Role::Viewer
                {
                    self.renegotiated.remove(&user_id);
                    self.open_host_link(&user_id);
                }
            }
            ServerSignal::UserLeft { user_id, .. } => {
                if self.session.on_user_left(&user_id).is_none() {
                    return;
                }
                self.close_room_link(&user_id);
                self.early_candidates
                    .retain(|(room, peer), _| room.is_none() || *peer != user_id);
                self.emit(StageEvent::UserLeft {
                    user_id,
                    viewer_count: self.session.viewer_count(),
                });
            }
            ServerSignal::CallOffer {
                offer,
                from,
                from_name,
                room_id,
            } => match room_id {
                Some(room_id) => self.on_room_offer(room_id, from, offer),
                None => self.on_call_offer(from, from_name, offer),
            },
            ServerSignal::CallAnswer {
                answer,
                from,
                room_id,
            } => self.on_answer(room_id, from, answer),
            ServerSignal::IceCandidate {
                candidate,
                from,
                room_id,
            } => self.on_remote_candidate(room_id, from, candidate),
            ServerSignal::CallDecline { from } => {
                if matches!(self.call.state(), CallState::RingingOut { peer } if *peer == from) {
                    info!(peer = %from, "call declined");
                    let reason = StageError::Cancelled(format!("call declined by {from}"));
                    let _ = self.teardown_call(reason, false);
                }
            }
            ServerSignal::EndCall { from } => {
                if self.call.peer() == Some(from.as_str()) {
                    info!(peer = %from, "remote ended call");
                    let reason = StageError::Cancelled(format!("call ended by {from}"));
                    let _ = self.teardown_call(reason, false);
                }
            }
            ServerSignal::NewMessage(msg) => {
                if let Some(msg) = self.chat.push_live(msg) {
                    self.emit(StageEvent::NewMessage(msg));
                }
            }
            ServerSignal::ChatHistory { messages } => {
                let history_len = messages.len();
                let mut visible = self.chat.apply_history(messages);
                if visible.is_empty() {
                    return;
                }
                let released = visible.split_off(history_len.min(visible.len()));
                self.emit(StageEvent::ChatHistory(visible));
                for msg in released {
                    self.emit(StageEvent::NewMessage(msg));
                }
            }
            ServerSignal::Error { message } => {
                let error = StageError::Server(message);
                warn!("server error: {error}");
                self.emitter.emit_error(&error);
                if let Some(pending) = self.pending_join.take() {
                    self.session.reset();
                    let _ = pending.reply.send(Err(error));
                }
            }
            ServerSignal::Pong => {}
        }
    }

    fn on_room_joined(&mut self, room_id: String, viewer_count: u32, is_host: bool) {
        let info = match self.session.on_room_joined(&room_id, is_host, viewer_count) {
            Ok(info) => info,
            Err(e) => {
                warn!("{e}");
                return;
            }
        };
        info!(room_id, is_host, viewer_count, "room joined");
        self.room = Some(info.clone());
        self.chat.open(&room_id);
        self.history_seq += 1;
        self.schedule(
            self.config.history_wait(),
            Internal::HistoryWait {
                seq: self.history_seq,
            },
        );
        self.emit(StageEvent::RoomJoined(info.clone()));

        let pending = self.pending_join.take().map(|p| p.reply);
        if !info.is_host || self.host_media_ready {
            if let Some(reply) = pending {
                let _ = reply.send(Ok(info));
            }
            return;
        }
        if let Some(reply) = pending {
            self.pending_host = Some((info, reply));
        }
        if self.media.owner() == Some(MediaOwner::Room(room_id.clone())) {
            debug!(room_id, "host media acquisition already in progress");
            return;
        }
        let media = self.media.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = media
                .acquire(MediaOwner::Room(room_id.clone()), &MediaConstraints::default())
                .await;
            let _ = tx.send(Internal::HostMedia { room_id, result });
        });
    }

    fn on_room_offer(&mut self, room_id: String, from: String, offer: SessionDescription) {
        let Some(membership) = self.session.joined() else {
            debug!(peer = %from, "room offer ignored: not in a room");
            return;
        };
        if membership.room_id != room_id {
            debug!(peer = %from, room_id, "room offer for another room ignored");
            return;
        }
        let local = membership.user_id.clone();
        if let Some(existing) = self.room_links.get(&from) {
            if existing.is_offering() {
                if resolve_glare(&local, &from) == GlareResolution::KeepLocalOffer {
                    info!(peer = %from, "offer glare: keeping local offer");
                    return;
                }
                info!(peer = %from, "offer glare: yielding to remote offer");
            }
            self.close_room_link(&from);
        }
        let mut link = match self.open_link(&from, LinkRole::Answerer, LinkScope::Room(room_id)) {
            Ok(link) => link,
            Err(e) => {
                self.emitter.emit_error(&e);
                return;
            }
        };
        match link.apply_remote_offer(offer) {
            Ok(()) => {
                self.room_links.insert(from, link);
            }
            Err(e) => self.emitter.emit_error(&e),
        }
    }

    fn on_call_offer(&mut self, from: String, from_name: Option<String>, offer: SessionDescription) {
        let ringing_out =
            matches!(self.call.state(), CallState::RingingOut { peer } if *peer == from);
        let offering = ringing_out && self.call_link.as_ref().is_none_or(|l| l.is_offering());
        if offering {
            if resolve_glare(&self.user.user_id, &from) == GlareResolution::KeepLocalOffer {
                info!(peer = %from, "call glare: keeping local offer");
                return;
            }
            info!(peer = %from, "call glare: answering remote offer");
            self.call.yield_to_remote(&from);
            self.close_call_link();
            self.pending_offer = Some(offer);
            if self.media.owner() == Some(MediaOwner::Call(from.clone()))
                && self.media.state().is_some()
            {
                self.continue_call();
            }
            return;
        }

        if matches!(self.call.state(), CallState::Active { peer } if *peer == from) {
            info!(peer = %from, "call renegotiation offer");
            self.answer_offer(&from, offer);
            return;
        }

        if matches!(self.call.state(), CallState::RingingIn { peer } if *peer == from) {
            if self.pending_call.is_some() {
                debug!(peer = %from, "repeated call offer ignored while answering");
            } else {
                info!(peer = %from, "repeated call offer");
                self.emit(StageEvent::IncomingCall {
                    from,
                    from_name,
                    offer,
                });
            }
            return;
        }

        match self.call.ring_incoming(&from) {
            Ok(()) => {
                info!(peer = %from, "incoming call");
                self.emit_call_state();
                self.emit(StageEvent::IncomingCall {
                    from,
                    from_name,
                    offer,
                });
            }
            Err(_) => {
                info!(peer = %from, "busy, declining incoming call");
                let _ = self.send(ClientSignal::CallDecline {
                    from: self.user.user_id.clone(),
                    to: from,
                });
            }
        }
    }

    fn on_answer(&mut self, room_id: Option<String>, from: String, answer: SessionDescription) {
        let slot = if room_id.is_some() {
            LinkSlot::Room
        } else {
            LinkSlot::Call
        };
        let Some(link) = self
            .link_mut(slot, &from)
            .filter(|l| l.peer() == from)
        else {
            debug!(peer = %from, "answer without a matching link dropped");
            return;
        };
        if let Err(e) = link.apply_remote_answer(answer) {
            self.on_negotiation_failed(slot, &from, e);
            return;
        }
        self.emit_peer_state(&from, NegotiationState::HaveRemoteAnswer);
        if slot == LinkSlot::Call && self.call.activate(&from) {
            info!(peer = %from, "call answered");
            self.emit_call_state();
        }
    }

    fn on_remote_candidate(&mut self, room_id: Option<String>, from: String, candidate: IceCandidate) {
        match &room_id {
            Some(room) => {
                if self.session.membership().is_none_or(|m| m.room_id != *room) {
                    debug!(peer = %from, "candidate for another room dropped");
                    return;
                }
                if let Some(link) = self.room_links.get_mut(&from) {
                    link.add_remote_candidate(candidate);
                    return;
                }
            }
            None => {
                if let Some(link) = self.call_link.as_mut().filter(|l| l.peer() == from) {
                    link.add_remote_candidate(candidate);
                    return;
                }
            }
        }
        self.buffer_early_candidate(room_id, from, candidate);
    }
}
