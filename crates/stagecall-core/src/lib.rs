//! Stagecall client core.
//!
//! Signaling, room membership, peer negotiation, local media ownership,
//! chat relay and 1:1 calls for live rooms. Platform media (capture,
//! WebRTC stack, rendering) is injected through the traits in [`media`]
//! and [`peer`].

pub mod call;
pub mod chat;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod media;
pub mod peer;
pub mod session;
pub mod signal;
pub mod transport;
pub mod ws;

pub use call::CallState;
pub use chat::{ChatMessage, MessageKind};
pub use client::{ClientSnapshot, LocalUser, StageClient};
pub use config::ClientConfig;
pub use errors::{ErrorKind, StageError};
pub use events::{ConnectionState, StageEvent, StageEventListener};
pub use session::{Participant, Role, RoomInfo};
pub use transport::{ReconnectPolicy, SignalingTransport};
