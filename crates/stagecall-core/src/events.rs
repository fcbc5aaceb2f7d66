use std::sync::{Arc, PoisonError, RwLock};

use crate::call::CallState;
use crate::chat::ChatMessage;
use crate::errors::ErrorKind;
use crate::media::TrackHandle;
use crate::peer::NegotiationState;
use crate::session::{Participant, RoomInfo};
use crate::signal::SessionDescription;

/// Events emitted by the core to the presentation layer.
#[derive(Debug, Clone)]
pub enum StageEvent {
    ConnectionStateChanged(ConnectionState),
    RoomJoined(RoomInfo),
    UserJoined {
        participant: Participant,
        viewer_count: u32,
    },
    UserLeft {
        user_id: String,
        viewer_count: u32,
    },
    RemoteStream {
        peer_id: String,
        tracks: Vec<TrackHandle>,
    },
    PeerStateChanged {
        peer_id: String,
        state: NegotiationState,
    },
    NewMessage(ChatMessage),
    ChatHistory(Vec<ChatMessage>),
    IncomingCall {
        from: String,
        from_name: Option<String>,
        offer: SessionDescription,
    },
    CallStateChanged(CallState),
    Error {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Receives events from the core.
/// Called from the client event loop; implementations must not block.
pub trait StageEventListener: Send + Sync {
    fn on_event(&self, event: StageEvent);
}

#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn StageEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn StageEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: StageEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }

    pub fn emit_error(&self, error: &crate::errors::StageError) {
        self.emit(StageEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}
