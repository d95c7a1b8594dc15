//! Connection State Machine
//!
//! Valid lifecycle of one client connection on the agent:
//!
//! ```text
//! ┌──────────────┐  hello sent  ┌────────────────┐  token ok  ┌──────────────┐
//! │  Connected   │ ───────────► │ Authenticating │ ─────────► │    Active    │
//! └──────┬───────┘              └───────┬────────┘            └──────┬───────┘
//!        │                              │ bad token / timeout        │ EOF / close
//!        │                              ▼                            │
//!        │                       ┌──────────────┐                    │
//!        └──────────────────────►│    Closed    │◄───────────────────┘
//!                                └──────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Socket accepted, nothing sent yet
    #[default]
    Connected,
    /// `hello` sent, waiting for `auth`
    Authenticating,
    /// Authenticated and carrying commands
    Active,
    /// Terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// State machine for one connection
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    close_reason: Option<String>,
    state_changed_at: Instant,
    transition_count: u32,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connected,
            close_reason: None,
            state_changed_at: Instant::now(),
            transition_count: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Why the connection was closed, once it is
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_changed_at.elapsed()
    }

    pub fn transition_count(&self) -> u32 {
        self.transition_count
    }

    /// `hello` was sent
    pub fn begin_auth(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            ConnectionState::Connected => {
                self.transition_to(ConnectionState::Authenticating);
                Ok(())
            }
            _ => Err(self.invalid(ConnectionState::Authenticating)),
        }
    }

    /// Token accepted
    pub fn authenticated(&mut self) -> Result<(), StateTransitionError> {
        match self.state {
            ConnectionState::Authenticating => {
                self.transition_to(ConnectionState::Active);
                Ok(())
            }
            _ => Err(self.invalid(ConnectionState::Active)),
        }
    }

    /// Close from any live state
    pub fn close(&mut self, reason: impl Into<String>) -> Result<(), StateTransitionError> {
        match self.state {
            ConnectionState::Closed => Err(self.invalid(ConnectionState::Closed)),
            _ => {
                self.transition_to(ConnectionState::Closed);
                self.close_reason = Some(reason.into());
                Ok(())
            }
        }
    }

    /// Only `Active` connections may carry commands
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    fn invalid(&self, to: ConnectionState) -> StateTransitionError {
        StateTransitionError::InvalidTransition {
            from: self.state,
            to,
        }
    }

    fn transition_to(&mut self, new_state: ConnectionState) {
        tracing::debug!(
            "Connection state transition: {} -> {} (count: {})",
            self.state,
            new_state,
            self.transition_count + 1
        );
        self.state = new_state;
        self.state_changed_at = Instant::now();
        self.transition_count += 1;
    }
}

/// Error type for invalid state transitions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}
