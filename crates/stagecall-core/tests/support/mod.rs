//! Shared fixtures for client integration tests.
//!
//! - [`ServerEnd`] is the server side of one in-memory signaling connection.
//! - [`FakeDevices`] and [`FakePeerFactory`] stand in for the platform media stack.
//! - [`Recorder`] captures every [`StageEvent`] a client emits.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tracing::Level;
use url::Url;

use stagecall_core::media::{
    DeviceInfo, MediaConstraints, MediaDevices, MediaTrack, TrackHandle, TrackKind,
};
use stagecall_core::peer::{
    IceServerConfig, MediaEventSink, MediaPhase, PeerConnection, PeerConnectionFactory,
};
use stagecall_core::signal::{ClientSignal, IceCandidate, ServerSignal, SessionDescription};
use stagecall_core::transport::{Connector, SignalChannel};
use stagecall_core::{
    ClientConfig, LocalUser, ReconnectPolicy, SignalingTransport, StageClient, StageError,
    StageEvent, StageEventListener,
};

const WAIT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (call once per test).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 100,
        reconnect_max_attempts: 3,
        heartbeat_interval_ms: 60_000,
        join_timeout_ms: 1_000,
        call_setup_timeout_ms: 1_000,
        ring_timeout_ms: 5_000,
        history_wait_ms: 200,
        ice_servers: Vec::new(),
    }
}

// ── signaling ───────────────────────────────────────────────────────────

pub struct ServerEnd {
    pub url: Url,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl ServerEnd {
    pub fn send(&self, signal: ServerSignal) {
        self.to_client
            .send(signal.encode().unwrap())
            .expect("client connection closed");
    }

    pub fn send_raw(&self, frame: &str) {
        self.to_client.send(frame.to_string()).unwrap();
    }

    /// Next non-ping frame from the client.
    pub async fn recv(&mut self) -> ClientSignal {
        loop {
            let frame = tokio::time::timeout(WAIT, self.from_client.recv())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client connection closed");
            let signal: ClientSignal = serde_json::from_str(&frame).unwrap();
            if signal != ClientSignal::Ping {
                return signal;
            }
        }
    }

    pub async fn expect(&mut self, name: &str) -> ClientSignal {
        let signal = self.recv().await;
        assert_eq!(signal.name(), name, "unexpected frame {signal:?}");
        signal
    }

    /// Frames already queued, pings excluded.
    pub fn drain(&mut self) -> Vec<ClientSignal> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            let signal: ClientSignal = serde_json::from_str(&frame).unwrap();
            if signal != ClientSignal::Ping {
                frames.push(signal);
            }
        }
        frames
    }

    /// Make every further client write fail while the read side stays open.
    pub fn stop_reading(&mut self) {
        self.from_client.close();
    }
}

pub struct TestConnector {
    pub accept: AtomicBool,
    ends: mpsc::UnboundedSender<ServerEnd>,
}

impl TestConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                accept: AtomicBool::new(true),
                ends: tx,
            }),
            rx,
        )
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn open(&self, url: &Url) -> Result<SignalChannel, StageError> {
        if !self.accept.load(Ordering::SeqCst) {
            return Err(StageError::Transport("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.ends.send(ServerEnd {
            url: url.clone(),
            from_client: out_rx,
            to_client: in_tx,
        });
        Ok(SignalChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Forward peer-to-peer frames between two clients, as the server would.
pub fn relay(mut a: ServerEnd, mut b: ServerEnd) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(frame) = a.from_client.recv() => forward(&frame, &b),
                Some(frame) = b.from_client.recv() => forward(&frame, &a),
                else => break,
            }
        }
    });
}

fn forward(frame: &str, to: &ServerEnd) {
    let Ok(signal) = serde_json::from_str::<ClientSignal>(frame) else {
        return;
    };
    let relayed = match signal {
        ClientSignal::CallOffer {
            offer,
            from,
            room_id,
            ..
        } => ServerSignal::CallOffer {
            offer,
            from,
            from_name: None,
            room_id,
        },
        ClientSignal::CallAnswer {
            answer,
            from,
            room_id,
            ..
        } => ServerSignal::CallAnswer {
            answer,
            from,
            room_id,
        },
        ClientSignal::IceCandidate {
            candidate,
            from,
            room_id,
            ..
        } => ServerSignal::IceCandidate {
            candidate,
            from,
            room_id,
        },
        ClientSignal::CallDecline { from, .. } => ServerSignal::CallDecline { from },
        ClientSignal::EndCall { from, .. } => ServerSignal::EndCall { from },
        _ => return,
    };
    let _ = to.to_client.send(relayed.encode().unwrap());
}

// ── media ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    pub enabled: AtomicBool,
    pub stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn device_id(&self) -> Option<String> {
        (self.kind == TrackKind::Video).then(|| "front-cam".to_string())
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeDevices {
    pub acquisitions: AtomicUsize,
    pub fail_with: Mutex<Option<StageError>>,
    issued: Mutex<Vec<Arc<FakeTrack>>>,
    gated: AtomicBool,
    gate: Notify,
}

impl FakeDevices {
    pub fn issued(&self) -> Vec<Arc<FakeTrack>> {
        self.issued.lock().unwrap().clone()
    }

    /// Park every `get_user_media` call until [`FakeDevices::release_media`].
    pub fn hold(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Let one parked acquisition finish.
    pub fn release_media(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }

    pub fn all_stopped(&self) -> bool {
        let issued = self.issued();
        !issued.is_empty() && issued.iter().all(|t| t.stopped.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<Vec<TrackHandle>, StageError> {
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        let audio = FakeTrack::new(&format!("mic-{n}"), TrackKind::Audio);
        let video = FakeTrack::new(&format!("cam-{n}"), TrackKind::Video);
        self.issued
            .lock()
            .unwrap()
            .extend([audio.clone(), video.clone()]);
        Ok(vec![audio as TrackHandle, video as TrackHandle])
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, StageError> {
        Ok(Vec::new())
    }
}

pub struct FakePeer {
    pub peer: String,
    sink: MediaEventSink,
    log: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    auto_connect: bool,
    offer_gate: Option<Arc<Notify>>,
}

impl FakePeer {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    /// Simulate the media layer reporting connectivity.
    pub fn report(&self, phase: MediaPhase) {
        self.sink.phase(phase);
    }

    pub fn emit_candidate(&self, candidate: &str) {
        self.sink.local_candidate(IceCandidate::new(candidate));
    }

    pub fn emit_remote_track(&self, id: &str) {
        self.sink
            .remote_track(FakeTrack::new(id, TrackKind::Video) as TrackHandle);
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: TrackHandle) -> Result<(), StageError> {
        self.record(format!("track:{}", track.id()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, StageError> {
        self.record("create-offer".into());
        if let Some(gate) = &self.offer_gate {
            gate.notified().await;
        }
        Ok(SessionDescription::offer(format!("offer-for-{}", self.peer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, StageError> {
        self.record("create-answer".into());
        Ok(SessionDescription::answer(format!("answer-for-{}", self.peer)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), StageError> {
        self.record(format!("local:{}", desc.sdp));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), StageError> {
        self.record(format!("remote:{}", desc.sdp));
        if self.auto_connect {
            self.sink.phase(MediaPhase::Connected);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), StageError> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<Arc<FakePeer>>>,
    pub auto_connect: bool,
    offer_gate: Option<Arc<Notify>>,
}

impl FakePeerFactory {
    /// Links report `Connected` as soon as a remote description is applied.
    pub fn auto_connecting() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    /// Offers stay pending until the returned gate is notified, once per offer.
    pub fn holding_offers() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let factory = Self {
            offer_gate: Some(gate.clone()),
            ..Self::default()
        };
        (factory, gate)
    }

    pub fn created(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().unwrap().clone()
    }

    pub fn latest(&self, peer: &str) -> Option<Arc<FakePeer>> {
        self.created().into_iter().rev().find(|p| p.peer == peer)
    }
}

impl PeerConnectionFactory for FakePeerFactory {
    fn create(
        &self,
        peer: &str,
        _ice_servers: &[IceServerConfig],
        events: MediaEventSink,
    ) -> Result<Arc<dyn PeerConnection>, StageError> {
        let conn = Arc::new(FakePeer {
            peer: peer.to_string(),
            sink: events,
            log: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            auto_connect: self.auto_connect,
            offer_gate: self.offer_gate.clone(),
        });
        self.created.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

// ── events ──────────────────────────────────────────────────────────────

pub struct Recorder {
    events: Mutex<Vec<StageEvent>>,
    tx: mpsc::UnboundedSender<StageEvent>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StageEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn events(&self) -> Vec<StageEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Forget what was recorded so far.
    pub async fn clear(&self) {
        self.events.lock().unwrap().clear();
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {}
    }

    /// Wait for the next event matching `pred`, skipping others.
    pub async fn wait_for(&self, pred: impl Fn(&StageEvent) -> bool) -> StageEvent {
        let mut rx = self.rx.lock().await;
        loop {
            let event = tokio::time::timeout(WAIT, rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("recorder closed");
            if pred(&event) {
                return event;
            }
        }
    }
}

impl StageEventListener for Recorder {
    fn on_event(&self, event: StageEvent) {
        self.events.lock().unwrap().push(event.clone());
        let _ = self.tx.send(event);
    }
}

// ── harness ─────────────────────────────────────────────────────────────

pub struct Harness {
    pub user_id: String,
    pub client: StageClient,
    pub server: ServerEnd,
    pub ends: mpsc::UnboundedReceiver<ServerEnd>,
    pub connector: Arc<TestConnector>,
    pub devices: Arc<FakeDevices>,
    pub peers: Arc<FakePeerFactory>,
    pub events: Arc<Recorder>,
}

impl Harness {
    pub async fn start(user_id: &str) -> Self {
        Self::start_with(user_id, FakePeerFactory::default()).await
    }

    pub async fn start_with(user_id: &str, peers: FakePeerFactory) -> Self {
        let config = test_config();
        let (connector, mut ends) = TestConnector::new();
        let transport =
            SignalingTransport::new(connector.clone(), ReconnectPolicy::from(&config));
        let devices = Arc::new(FakeDevices::default());
        let peers = Arc::new(peers);
        let client = StageClient::new(
            LocalUser::new(user_id, user_id.to_uppercase()),
            transport,
            devices.clone(),
            peers.clone(),
            config,
        );
        let events = Recorder::new();
        client.add_listener(events.clone());

        client
            .connect("ws://signal.test/socket", Some("secret"))
            .await
            .unwrap();
        let server = ends.recv().await.unwrap();
        events
            .wait_for(|e| matches!(e, StageEvent::ConnectionStateChanged(_)))
            .await;
        events.clear().await;

        Self {
            user_id: user_id.to_string(),
            client,
            server,
            ends,
            connector,
            devices,
            peers,
            events,
        }
    }

    /// Join `room_id` and complete the server handshake.
    pub async fn join(&mut self, room_id: &str, as_host: bool, viewer_count: u32) {
        let client = self.client.clone();
        let user_id = self.user_id.clone();
        let room = room_id.to_string();
        let join = tokio::spawn(async move {
            client.join_room(&room, &user_id, "Tester", as_host).await
        });
        self.server.expect("join-room").await;
        self.server.send(ServerSignal::RoomJoined {
            room_id: room_id.to_string(),
            viewer_count,
            is_host: as_host,
        });
        join.await.unwrap().unwrap();
    }

    /// Drop the current connection server-side and wait for the client to
    /// dial again.
    pub async fn bounce(&mut self) {
        let (to_client, _) = mpsc::unbounded_channel();
        let (_, from_client) = mpsc::unbounded_channel();
        let dead = ServerEnd {
            url: self.server.url.clone(),
            from_client,
            to_client,
        };
        drop(std::mem::replace(&mut self.server, dead));
        self.server = tokio::time::timeout(WAIT, self.ends.recv())
            .await
            .expect("client did not reconnect")
            .expect("connector dropped");
    }
}

/// Poll a synchronous condition.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

pub fn user_joined(user_id: &str, is_host: bool) -> ServerSignal {
    ServerSignal::UserJoined {
        user_id: user_id.to_string(),
        user_name: user_id.to_uppercase(),
        viewer_count: 0,
        is_host,
    }
}
