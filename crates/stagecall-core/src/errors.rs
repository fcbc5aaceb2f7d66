use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection failed after {attempts} reconnect attempts")]
    ConnectionFailed { attempts: u32 },
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("negotiation error with {peer}: {reason}")]
    Negotiation { peer: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("already in room {0}")]
    AlreadyInRoom(String),
    #[error("not in a room")]
    NotInRoom,
    #[error("a call to {0} is already pending")]
    CallAlreadyPending(String),
    #[error("another call is in progress")]
    CallInProgress,
    #[error("local media is held by {0}")]
    MediaBusy(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("client event loop has stopped")]
    ChannelClosed,
}

/// Coarse classification for the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    PermissionDenied,
    DeviceUnavailable,
    Negotiation,
    Protocol,
    Session,
    Timeout,
    Server,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::ConnectionFailed { .. } | Self::ChannelClosed => {
                ErrorKind::Transport
            }
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::Negotiation { .. } => ErrorKind::Negotiation,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::AlreadyInRoom(_)
            | Self::NotInRoom
            | Self::CallAlreadyPending(_)
            | Self::CallInProgress
            | Self::MediaBusy(_)
            | Self::Cancelled(_) => ErrorKind::Session,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Server(_) => ErrorKind::Server,
        }
    }

    /// Whether the core itself retries this class of failure.
    ///
    /// Only transport drops are retried (by the reconnect loop). Media errors
    /// are never retried silently.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub(crate) fn negotiation(peer: &str, reason: impl Into<String>) -> Self {
        Self::Negotiation {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_errors_are_not_retryable() {
        assert!(!StageError::PermissionDenied("camera".into()).is_retryable());
        assert!(!StageError::DeviceUnavailable("no camera".into()).is_retryable());
        assert!(StageError::Transport("reset".into()).is_retryable());
    }

    #[test]
    fn kinds_group_session_errors() {
        assert_eq!(StageError::NotInRoom.kind(), ErrorKind::Session);
        assert_eq!(
            StageError::CallAlreadyPending("user-42".into()).kind(),
            ErrorKind::Session
        );
        assert_eq!(
            StageError::ConnectionFailed { attempts: 5 }.kind(),
            ErrorKind::Transport
        );
    }
}
