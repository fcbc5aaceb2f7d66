//! 1:1 call state.

use crate::errors::StageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    RingingOut { peer: String },
    RingingIn { peer: String },
    Active { peer: String },
}

impl CallState {
    pub fn peer(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::RingingOut { peer } | Self::RingingIn { peer } | Self::Active { peer } => {
                Some(peer)
            }
        }
    }
}

/// Transition rules for the call controller.
///
/// Every transition out of `Idle` bumps the generation, so timers and media
/// acquisitions started for an earlier call can tell they are stale.
#[derive(Debug)]
pub struct CallSession {
    state: CallState,
    generation: u64,
}

impl Default for CallSession {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            generation: 0,
        }
    }
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state != CallState::Idle
    }

    pub fn peer(&self) -> Option<&str> {
        self.state.peer()
    }

    fn busy(&self, target: &str) -> StageError {
        match &self.state {
            CallState::RingingOut { peer } if peer == target => {
                StageError::CallAlreadyPending(target.to_string())
            }
            _ => StageError::CallInProgress,
        }
    }

    /// `idle -> ringing-out`. A second call to the same target is rejected.
    pub fn begin_outgoing(&mut self, target: &str) -> Result<u64, StageError> {
        if self.state != CallState::Idle {
            return Err(self.busy(target));
        }
        self.generation += 1;
        self.state = CallState::RingingOut {
            peer: target.to_string(),
        };
        Ok(self.generation)
    }

    /// `idle -> ringing-in`. Fails when another call is in progress.
    pub fn ring_incoming(&mut self, from: &str) -> Result<(), StageError> {
        if self.state != CallState::Idle {
            return Err(StageError::CallInProgress);
        }
        self.generation += 1;
        self.state = CallState::RingingIn {
            peer: from.to_string(),
        };
        Ok(())
    }

    /// Accept the offer from `from`, ringing or not.
    pub fn begin_answer(&mut self, from: &str) -> Result<u64, StageError> {
        match &self.state {
            CallState::RingingIn { peer } if peer == from => Ok(self.generation),
            CallState::Idle => {
                self.ring_incoming(from)?;
                Ok(self.generation)
            }
            _ => Err(StageError::CallInProgress),
        }
    }

    /// Our outbound offer lost a glare race: the same call continues with
    /// this side answering.
    pub fn yield_to_remote(&mut self, peer: &str) -> bool {
        match &self.state {
            CallState::RingingOut { peer: p } if p == peer => {
                self.state = CallState::RingingIn {
                    peer: peer.to_string(),
                };
                true
            }
            _ => false,
        }
    }

    /// `ringing-* -> active`. Returns false if the call is not with `peer`.
    pub fn activate(&mut self, peer: &str) -> bool {
        match &self.state {
            CallState::RingingOut { peer: p } | CallState::RingingIn { peer: p } if p == peer => {
                self.state = CallState::Active {
                    peer: peer.to_string(),
                };
                true
            }
            _ => false,
        }
    }

    /// Back to idle. Returns the peer of the call that ended.
    pub fn end(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, CallState::Idle) {
            CallState::Idle => None,
            CallState::RingingOut { peer }
            | CallState::RingingIn { peer }
            | CallState::Active { peer } => Some(peer),
        }
    }
}
