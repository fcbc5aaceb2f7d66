//! Reconnecting duplex channel to the signaling server.
//!
//! [`SignalingTransport`] owns one driver task per connection. The driver is
//! the only place inbound frames are parsed and dispatched, so handlers see
//! events strictly in arrival order. Handlers are plain closures called on
//! the driver; they must hand work off (typically into a channel) rather
//! than block.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::config::ClientConfig;
use crate::errors::StageError;
use crate::events::ConnectionState;
use crate::signal::{ClientSignal, ServerSignal};

/// Subscribe to every event.
pub const ANY_EVENT: &str = "*";

/// A raw text-frame pipe. The connection is considered dropped when
/// `inbound` yields `None`.
pub struct SignalChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<SignalChannel, StageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Signal(ServerSignal),
    Connected,
    Disconnected { reason: String, will_retry: bool },
    Reconnecting { attempt: u32 },
    Reconnected { attempt: u32 },
    ConnectionFailed { attempts: u32 },
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Signal(signal) => signal.name(),
            Self::Connected => "connect",
            Self::Disconnected { .. } => "disconnect",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Reconnected { .. } => "reconnect",
            Self::ConnectionFailed { .. } => "connection-failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub heartbeat: Duration,
}

impl From<&ClientConfig> for ReconnectPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay(),
            max_delay: config.reconnect_max_delay(),
            max_attempts: config.reconnect_max_attempts,
            heartbeat: config.heartbeat_interval(),
        }
    }
}

/// `base * 2^attempt`, capped at `max`. `attempt` counts from zero.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

type Handler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

struct Entry {
    id: u64,
    event: String,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

struct Link {
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    shutdown: Option<watch::Sender<bool>>,
}

struct Shared {
    registry: Mutex<Registry>,
    link: Mutex<Link>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, event: &TransportEvent) {
        let name = event.name();
        let handlers: Vec<Handler> = self
            .registry()
            .entries
            .iter()
            .filter(|e| e.event == name || e.event == ANY_EVENT)
            .map(|e| e.handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn dispatch_frame(&self, text: &str) {
        match ServerSignal::parse(text) {
            Ok(ServerSignal::Pong) => tracing::trace!("pong"),
            Ok(signal) => self.dispatch(&TransportEvent::Signal(signal)),
            Err(e) => tracing::warn!("dropping inbound frame: {e}"),
        }
    }

    /// Apply a state change if `generation` is still the live connection.
    fn update(
        &self,
        generation: u64,
        state: ConnectionState,
        outbound: Option<mpsc::UnboundedSender<String>>,
    ) -> bool {
        let mut link = self.link();
        if link.generation != generation {
            return false;
        }
        link.state = state;
        link.outbound = outbound;
        if link.state == ConnectionState::Disconnected {
            link.shutdown = None;
        }
        true
    }
}

/// Unregisters its handler when dropped.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.registry().entries.retain(|e| e.id != self.id);
        }
    }
}

#[derive(Clone)]
pub struct SignalingTransport {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
}

impl SignalingTransport {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    outbound: None,
                    shutdown: None,
                }),
            }),
        }
    }

    /// Transport over a websocket, the production connector.
    pub fn websocket(policy: ReconnectPolicy) -> Self {
        Self::new(Arc::new(crate::ws::WsConnector::new()), policy)
    }

    /// Open the connection. A no-op if already connected or connecting.
    ///
    /// Only the initial dial error is returned; later drops are retried in
    /// the background and reported through `reconnect`/`connection-failed`.
    pub async fn connect(&self, server_url: &str, token: Option<&str>) -> Result<(), StageError> {
        let mut url = Url::parse(server_url)
            .map_err(|e| StageError::Transport(format!("invalid server url {server_url}: {e}")))?;
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", token);
        }

        let generation = {
            let mut link = self.shared.link();
            if link.state != ConnectionState::Disconnected {
                tracing::debug!(state = ?link.state, "connect ignored: already connected");
                return Ok(());
            }
            link.generation += 1;
            link.state = ConnectionState::Connecting;
            link.generation
        };

        let channel = match self.connector.open(&url).await {
            Ok(channel) => channel,
            Err(e) => {
                self.shared.update(generation, ConnectionState::Disconnected, None);
                tracing::warn!(host = ?url.host_str(), "signaling connect failed: {e}");
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut link = self.shared.link();
            if link.generation != generation {
                return Ok(());
            }
            link.state = ConnectionState::Connected;
            link.outbound = Some(channel.outbound.clone());
            link.shutdown = Some(shutdown_tx);
        }
        tracing::info!(host = ?url.host_str(), "signaling connected");

        tokio::spawn(drive(
            self.shared.clone(),
            self.connector.clone(),
            self.policy.clone(),
            url,
            generation,
            channel,
            shutdown_rx,
        ));
        Ok(())
    }

    /// Close the connection and stop any reconnect in progress.
    pub fn disconnect(&self) {
        let shutdown = {
            let mut link = self.shared.link();
            if link.state == ConnectionState::Disconnected {
                return;
            }
            link.generation += 1;
            link.state = ConnectionState::Disconnected;
            link.outbound = None;
            link.shutdown.take()
        };
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }
        tracing::info!("signaling disconnected by client");
        self.shared.dispatch(&TransportEvent::Disconnected {
            reason: "closed by client".to_string(),
            will_retry: false,
        });
    }

    pub fn emit(&self, signal: &ClientSignal) -> Result<(), StageError> {
        let frame = signal.encode()?;
        let link = self.shared.link();
        let outbound = match (&link.state, &link.outbound) {
            (ConnectionState::Connected, Some(outbound)) => outbound,
            _ => {
                return Err(StageError::Transport(format!(
                    "cannot send {}: not connected",
                    signal.name()
                )));
            }
        };
        outbound
            .send(frame)
            .map_err(|_| StageError::Transport(format!("cannot send {}: writer closed", signal.name())))
    }

    /// Register `handler` for events named `event`, or [`ANY_EVENT`].
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let mut registry = self.shared.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push(Entry {
            id,
            event: event.to_string(),
            handler: Arc::new(handler),
        });
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link().state == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.link().state.clone()
    }
}

enum Exit {
    Shutdown,
    Dropped(String),
}

async fn pump(
    shared: &Shared,
    channel: &mut SignalChannel,
    heartbeat: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit {
    let start = tokio::time::Instant::now() + heartbeat;
    let mut ticker = tokio::time::interval_at(start, heartbeat);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Exit::Shutdown,
            frame = channel.inbound.recv() => match frame {
                Some(text) => shared.dispatch_frame(&text),
                None => return Exit::Dropped("connection closed".to_string()),
            },
            _ = ticker.tick() => {
                let ping = match ClientSignal::Ping.encode() {
                    Ok(ping) => ping,
                    Err(e) => return Exit::Dropped(e.to_string()),
                };
                if channel.outbound.send(ping).is_err() {
                    return Exit::Dropped("writer closed".to_string());
                }
            }
        }
    }
}

async fn drive(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    url: Url,
    generation: u64,
    mut channel: SignalChannel,
    mut shutdown: watch::Receiver<bool>,
) {
    shared.dispatch(&TransportEvent::Connected);
    loop {
        let reason = match pump(&shared, &mut channel, policy.heartbeat, &mut shutdown).await {
            Exit::Shutdown => return,
            Exit::Dropped(reason) => reason,
        };
        let will_retry = policy.max_attempts > 0;
        let state = if will_retry {
            ConnectionState::Reconnecting { attempt: 1 }
        } else {
            ConnectionState::Disconnected
        };
        if !shared.update(generation, state, None) {
            return;
        }
        tracing::warn!(reason, will_retry, "signaling connection lost");
        shared.dispatch(&TransportEvent::Disconnected { reason, will_retry });

        match reconnect(&shared, connector.as_ref(), &policy, &url, generation, &mut shutdown).await {
            Reconnect::Opened { channel: next, attempt } => {
                if !shared.update(generation, ConnectionState::Connected, Some(next.outbound.clone())) {
                    return;
                }
                tracing::info!(attempt, "signaling reconnected");
                channel = next;
                shared.dispatch(&TransportEvent::Reconnected { attempt });
            }
            Reconnect::Shutdown => return,
            Reconnect::Exhausted { attempts } => {
                if shared.update(generation, ConnectionState::Disconnected, None) {
                    tracing::error!(attempts, "signaling reconnect attempts exhausted");
                    shared.dispatch(&TransportEvent::ConnectionFailed { attempts });
                }
                return;
            }
        }
    }
}

enum Reconnect {
    Opened { channel: SignalChannel, attempt: u32 },
    Shutdown,
    Exhausted { attempts: u32 },
}

async fn reconnect(
    shared: &Shared,
    connector: &dyn Connector,
    policy: &ReconnectPolicy,
    url: &Url,
    generation: u64,
    shutdown: &mut watch::Receiver<bool>,
) -> Reconnect {
    for attempt in 1..=policy.max_attempts {
        if !shared.update(generation, ConnectionState::Reconnecting { attempt }, None) {
            return Reconnect::Shutdown;
        }
        shared.dispatch(&TransportEvent::Reconnecting { attempt });
        let delay = backoff_delay(policy.base_delay, policy.max_delay, attempt - 1);
        tracing::debug!(attempt, ?delay, "reconnecting");
        tokio::select! {
            _ = shutdown.changed() => return Reconnect::Shutdown,
            _ = tokio::time::sleep(delay) => {}
        }
        let opened = tokio::select! {
            _ = shutdown.changed() => return Reconnect::Shutdown,
            opened = connector.open(url) => opened,
        };
        match opened {
            Ok(channel) => return Reconnect::Opened { channel, attempt },
            Err(e) => tracing::warn!(attempt, "reconnect failed: {e}"),
        }
    }
    Reconnect::Exhausted {
        attempts: policy.max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ServerEnd {
        url: Url,
        from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::UnboundedSender<String>,
    }

    struct TestConnector {
        accept: AtomicBool,
        ends: mpsc::UnboundedSender<ServerEnd>,
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn open(&self, url: &Url) -> Result<SignalChannel, StageError> {
            if !self.accept.load(Ordering::SeqCst) {
                return Err(StageError::Transport("refused".into()));
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

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts,
            heartbeat: Duration::from_secs(30),
        }
    }

    fn setup(
        max_attempts: u32,
    ) -> (
        SignalingTransport,
        Arc<TestConnector>,
        mpsc::UnboundedReceiver<ServerEnd>,
        mpsc::UnboundedReceiver<String>,
        Subscription,
    ) {
        let (ends_tx, ends_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(TestConnector {
            accept: AtomicBool::new(true),
            ends: ends_tx,
        });
        let transport = SignalingTransport::new(connector.clone(), policy(max_attempts));
        let (names_tx, names_rx) = mpsc::unbounded_channel();
        let sub = transport.on(ANY_EVENT, move |event| {
            let _ = names_tx.send(event.name().to_string());
        });
        (transport, connector, ends_rx, names_rx, sub)
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(15);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, max, 10), max);
        assert_eq!(backoff_delay(base, max, 64), max);
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_sends_token() {
        let (transport, _connector, mut ends, mut names, _sub) = setup(3);
        transport.connect("wss://signal.example/ws", Some("abc")).await.unwrap();
        transport.connect("wss://signal.example/ws", Some("abc")).await.unwrap();

        let end = ends.recv().await.unwrap();
        assert_eq!(end.url.query(), Some("token=abc"));
        assert_eq!(names.recv().await.unwrap(), "connect");
        assert!(transport.is_connected());
        assert!(ends.try_recv().is_err());
    }

    #[tokio::test]
    async fn frames_dispatch_by_name_and_bad_frames_are_dropped() {
        let (transport, _connector, mut ends, mut names, _sub) = setup(3);
        let (left_tx, mut left_rx) = mpsc::unbounded_channel();
        let left = transport.on("user-left", move |event| {
            let _ = left_tx.send(event.clone());
        });
        transport.connect("ws://localhost:9000", None).await.unwrap();
        let end = ends.recv().await.unwrap();
        assert_eq!(names.recv().await.unwrap(), "connect");

        end.to_client.send("garbage".into()).unwrap();
        end.to_client.send(r#"{"event":"pong"}"#.into()).unwrap();
        end.to_client
            .send(r#"{"event":"user-left","data":{"userId":"v1","viewerCount":0}}"#.into())
            .unwrap();

        assert_eq!(names.recv().await.unwrap(), "user-left");
        assert!(matches!(
            left_rx.recv().await,
            Some(TransportEvent::Signal(ServerSignal::UserLeft { ref user_id, .. })) if user_id == "v1"
        ));

        left.unsubscribe();
        end.to_client
            .send(r#"{"event":"user-left","data":{"userId":"v2"}}"#.into())
            .unwrap();
        assert_eq!(names.recv().await.unwrap(), "user-left");
        assert!(left_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_requires_connection() {
        let (transport, _connector, mut ends, _names, _sub) = setup(3);
        assert!(matches!(
            transport.emit(&ClientSignal::Ping),
            Err(StageError::Transport(_))
        ));
        transport.connect("ws://localhost:9000", None).await.unwrap();
        let mut end = ends.recv().await.unwrap();
        transport.emit(&ClientSignal::Ping).unwrap();
        assert_eq!(end.from_client.recv().await.unwrap(), r#"{"event":"ping"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_reconnects() {
        let (transport, _connector, mut ends, mut names, _sub) = setup(3);
        transport.connect("ws://localhost:9000", None).await.unwrap();
        let first = ends.recv().await.unwrap();
        assert_eq!(names.recv().await.unwrap(), "connect");

        drop(first);
        assert_eq!(names.recv().await.unwrap(), "disconnect");
        assert_eq!(names.recv().await.unwrap(), "reconnecting");
        let _second = ends.recv().await.unwrap();
        assert_eq!(names.recv().await.unwrap(), "reconnect");
        assert!(transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnect_surfaces_connection_failed() {
        let (transport, connector, mut ends, mut names, _sub) = setup(2);
        transport.connect("ws://localhost:9000", None).await.unwrap();
        let first = ends.recv().await.unwrap();
        assert_eq!(names.recv().await.unwrap(), "connect");

        connector.accept.store(false, Ordering::SeqCst);
        drop(first);
        let mut seen = Vec::new();
        while let Some(name) = names.recv().await {
            seen.push(name.clone());
            if name == "connection-failed" {
                break;
            }
        }
        assert_eq!(
            seen,
            ["disconnect", "reconnecting", "reconnecting", "connection-failed"]
        );
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn explicit_disconnect_does_not_retry() {
        let (transport, _connector, mut ends, mut names, _sub) = setup(3);
        transport.connect("ws://localhost:9000", None).await.unwrap();
        let _end = ends.recv().await.unwrap();
        assert_eq!(names.recv().await.unwrap(), "connect");

        transport.disconnect();
        transport.disconnect();
        assert_eq!(names.recv().await.unwrap(), "disconnect");
        assert!(!transport.is_connected());
        tokio::task::yield_now().await;
        assert!(names.try_recv().is_err());
    }
}
