//! Signaling wire protocol.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": {...}}`. Inbound frames that do not match a
//! known event name and shape are rejected at this boundary with
//! [`StageError::Protocol`] so no other module has to trust payload shape.

use serde::{Deserialize, Serialize};

use crate::chat::{ChatMessage, MessageKind};
use crate::errors::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Frames sent by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientSignal {
    JoinRoom {
        room_id: String,
        user_id: String,
        user_name: String,
        is_host: bool,
    },
    LeaveRoom {
        room_id: String,
        user_id: String,
    },
    CallOffer {
        offer: SessionDescription,
        to: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    CallAnswer {
        answer: SessionDescription,
        to: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidate,
        to: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    CallDecline {
        from: String,
        to: String,
    },
    EndCall {
        to: String,
        from: String,
    },
    SendMessage {
        id: String,
        room_id: String,
        user_id: String,
        user_name: String,
        content: String,
        #[serde(default)]
        kind: MessageKind,
    },
    Ping,
}

impl ClientSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::CallOffer { .. } => "call-offer",
            Self::CallAnswer { .. } => "call-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallDecline { .. } => "call-decline",
            Self::EndCall { .. } => "end-call",
            Self::SendMessage { .. } => "send-message",
            Self::Ping => "ping",
        }
    }

    pub fn encode(&self) -> Result<String, StageError> {
        serde_json::to_string(self)
            .map_err(|e| StageError::Protocol(format!("encode {}: {e}", self.name())))
    }
}

/// Frames relayed to this client by the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerSignal {
    RoomJoined {
        room_id: String,
        #[serde(default)]
        viewer_count: u32,
        #[serde(default)]
        is_host: bool,
    },
    UserJoined {
        user_id: String,
        #[serde(default)]
        user_name: String,
        #[serde(default)]
        viewer_count: u32,
        #[serde(default)]
        is_host: bool,
    },
    UserLeft {
        user_id: String,
        #[serde(default)]
        viewer_count: u32,
    },
    CallOffer {
        offer: SessionDescription,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    CallAnswer {
        answer: SessionDescription,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidate,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    CallDecline {
        from: String,
    },
    EndCall {
        from: String,
    },
    NewMessage(ChatMessage),
    ChatHistory {
        #[serde(default)]
        messages: Vec<ChatMessage>,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ServerSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomJoined { .. } => "room-joined",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::CallOffer { .. } => "call-offer",
            Self::CallAnswer { .. } => "call-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallDecline { .. } => "call-decline",
            Self::EndCall { .. } => "end-call",
            Self::NewMessage(_) => "new-message",
            Self::ChatHistory { .. } => "chat-history",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }

    pub fn parse(text: &str) -> Result<Self, StageError> {
        serde_json::from_str(text).map_err(|e| StageError::Protocol(format!("bad frame: {e}")))
    }

    pub fn encode(&self) -> Result<String, StageError> {
        serde_json::to_string(self)
            .map_err(|e| StageError::Protocol(format!("encode {}: {e}", self.name())))
    }
}
