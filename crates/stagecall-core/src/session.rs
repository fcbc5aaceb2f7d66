//! Room membership and roster bookkeeping.

use crate::errors::StageError;
use crate::signal::ClientSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub is_local: bool,
}

/// Server-confirmed room membership, returned by `join_room`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub room_id: String,
    pub is_host: bool,
    /// Viewer count as reported by the server acknowledgment.
    pub viewer_count: u32,
}

/// What the local user asked for when joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    pub as_host: bool,
}

impl Membership {
    pub fn join_signal(&self) -> ClientSignal {
        ClientSignal::JoinRoom {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            user_name: self.display_name.clone(),
            is_host: self.as_host,
        }
    }

    pub fn leave_signal(&self) -> ClientSignal {
        ClientSignal::LeaveRoom {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// Ordered participant list. Viewer count is always derived from it.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    /// Insert or refresh a participant. Returns true if it was not present.
    pub fn upsert(&mut self, participant: Participant) -> bool {
        match self
            .participants
            .iter_mut()
            .find(|p| p.user_id == participant.user_id)
        {
            Some(existing) => {
                *existing = participant;
                false
            }
            None => {
                self.participants.push(participant);
                true
            }
        }
    }

    pub fn remove(&mut self, user_id: &str) -> Option<Participant> {
        let idx = self.participants.iter().position(|p| p.user_id == user_id)?;
        Some(self.participants.remove(idx))
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn viewer_count(&self) -> u32 {
        self.participants
            .iter()
            .filter(|p| p.role == Role::Viewer)
            .count() as u32
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Drop every remote participant, keeping the local entry.
    pub fn retain_local(&mut self) -> Vec<Participant> {
        let (local, remote) = std::mem::take(&mut self.participants)
            .into_iter()
            .partition(|p| p.is_local);
        self.participants = local;
        remote
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    /// Join sent, waiting for `room-joined`.
    Joining(Membership),
    Joined(Membership),
    /// Transport dropped while joined; membership is re-established on reconnect.
    Rejoining(Membership),
}

#[derive(Debug, Default)]
pub struct RoomSession {
    phase: Phase,
    roster: Roster,
}

impl RoomSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_join(&mut self, membership: Membership) -> Result<(), StageError> {
        if let Some(current) = self.membership() {
            return Err(StageError::AlreadyInRoom(current.room_id.clone()));
        }
        self.phase = Phase::Joining(membership);
        Ok(())
    }

    /// Apply the server acknowledgment for a pending join or rejoin.
    pub fn on_room_joined(
        &mut self,
        room_id: &str,
        is_host: bool,
        viewer_count: u32,
    ) -> Result<RoomInfo, StageError> {
        let membership = match &self.phase {
            Phase::Joining(m) | Phase::Rejoining(m) if m.room_id == room_id => m.clone(),
            _ => {
                return Err(StageError::Protocol(format!(
                    "unexpected room-joined for {room_id}"
                )));
            }
        };
        if is_host != membership.as_host {
            tracing::warn!(room_id, is_host, "server confirmed a different role than requested");
        }
        self.roster.clear();
        self.roster.upsert(Participant {
            user_id: membership.user_id.clone(),
            display_name: membership.display_name.clone(),
            role: if is_host { Role::Host } else { Role::Viewer },
            is_local: true,
        });
        self.phase = Phase::Joined(Membership {
            as_host: is_host,
            ..membership
        });
        Ok(RoomInfo {
            room_id: room_id.to_string(),
            is_host,
            viewer_count,
        })
    }

    /// Returns the participant if the roster gained a new entry.
    pub fn on_user_joined(
        &mut self,
        user_id: &str,
        display_name: &str,
        is_host: bool,
    ) -> Option<Participant> {
        let Phase::Joined(membership) = &self.phase else {
            tracing::debug!(user_id, "user-joined ignored: not in a room");
            return None;
        };
        if membership.user_id == user_id {
            return None;
        }
        let participant = Participant {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            role: if is_host { Role::Host } else { Role::Viewer },
            is_local: false,
        };
        self.roster
            .upsert(participant.clone())
            .then_some(participant)
    }

    pub fn on_user_left(&mut self, user_id: &str) -> Option<Participant> {
        if !matches!(self.phase, Phase::Joined(_)) {
            return None;
        }
        match self.roster.get(user_id) {
            Some(p) if !p.is_local => self.roster.remove(user_id),
            _ => None,
        }
    }

    /// Transport dropped: remote participants are gone, membership is kept
    /// so it can be re-established. Returns the removed participants.
    pub fn on_transport_lost(&mut self) -> Vec<Participant> {
        match std::mem::take(&mut self.phase) {
            Phase::Joined(m) | Phase::Rejoining(m) => {
                self.phase = Phase::Rejoining(m);
                self.roster.retain_local()
            }
            Phase::Joining(m) => {
                self.phase = Phase::Joining(m);
                Vec::new()
            }
            Phase::Idle => Vec::new(),
        }
    }

    /// The join frame to resend after a reconnect, if membership is active.
    pub fn rejoin_signal(&self) -> Option<ClientSignal> {
        match &self.phase {
            Phase::Rejoining(m) => Some(m.join_signal()),
            _ => None,
        }
    }

    /// Forget all membership state. Returns what was held.
    pub fn reset(&mut self) -> Option<Membership> {
        self.roster.clear();
        match std::mem::take(&mut self.phase) {
            Phase::Idle => None,
            Phase::Joining(m) | Phase::Joined(m) | Phase::Rejoining(m) => Some(m),
        }
    }

    pub fn membership(&self) -> Option<&Membership> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Joining(m) | Phase::Joined(m) | Phase::Rejoining(m) => Some(m),
        }
    }

    pub fn joined(&self) -> Option<&Membership> {
        match &self.phase {
            Phase::Joined(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_joining(&self, room_id: &str) -> bool {
        matches!(&self.phase, Phase::Joining(m) if m.room_id == room_id)
    }

    pub fn is_host(&self) -> bool {
        self.joined().is_some_and(|m| m.as_host)
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn viewer_count(&self) -> u32 {
        self.roster.viewer_count()
    }
}
