//! Session tokens and the per-session state machine.
//!
//! ```text
//! Created --license message--> Pending --key update--> Active
//!    |                            |                       |
//!    +------------ module error --+-----------------------+--> Error
//! any non-terminal state --explicit close--> Closed
//! ```
use std::fmt;

use crate::error::{Error, Result};

/// Lifecycle state of a key session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Session created, license request generation requested.
    Created,
    /// License message sent, waiting for key material.
    Pending,
    /// Keys applied to the decryption module.
    Active,
    /// The decryption module reported an error.
    Error,
    /// Explicitly closed. Terminal.
    Closed,
}

/// Inputs that drive [`SessionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    LicenseMessage,
    KeysUpdated,
    ModuleError,
    Close,
}

impl SessionState {
    /// Apply `transition`, returning the next state.
    ///
    /// Repeated license messages (renewals) and key updates are accepted in
    /// `Pending` and `Active`. Nothing leaves `Closed`.
    pub fn next(self, transition: SessionTransition) -> Result<Self> {
        use SessionState as S;
        use SessionTransition as T;

        let next = match (self, transition) {
            (S::Closed, _) => None,
            (_, T::Close) => Some(S::Closed),
            (S::Error, _) => None,
            (_, T::ModuleError) => Some(S::Error),
            (S::Created | S::Pending, T::LicenseMessage) => Some(S::Pending),
            (S::Active, T::LicenseMessage) => Some(S::Active),
            (S::Created | S::Pending | S::Active, T::KeysUpdated) => Some(S::Active),
        };

        next.ok_or_else(|| {
            Error::SessionState(format!("Invalid transition {:?} from {:?}", transition, self))
        })
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Identifies one key session held by the protection model.
///
/// Tokens handed out to callers are snapshots; the model owns the live copy
/// and is the only place where `state` changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    /// Session id assigned by the decryption module.
    pub session_id: String,
    /// Init data the session was created with.
    pub init_data: Vec<u8>,
    /// Current lifecycle state.
    pub state: SessionState,
}

impl SessionToken {
    /// Create a token in the `Created` state.
    pub fn new(session_id: impl Into<String>, init_data: Vec<u8>) -> Self {
        Self {
            session_id: session_id.into(),
            init_data,
            state: SessionState::Created,
        }
    }

    /// Advance the state machine in place.
    pub(crate) fn apply(&mut self, transition: SessionTransition) -> Result<SessionState> {
        let previous = self.state;
        self.state = self.state.next(transition).map_err(|e| match e {
            Error::SessionState(msg) => {
                Error::SessionState(format!("Session {}: {}", self.session_id, msg))
            }
            other => other,
        })?;
        Ok(previous)
    }
}
