//! Session tracking
//!
//! - `state`: per-connection lifecycle
//! - `manager`: shared registry, auth token and rotation

pub mod manager;
pub mod state;

pub use manager::{new_session_id, SessionCommand, SessionEvent, SessionInfo, SessionManager};
pub use state::{ConnectionState, ConnectionStateMachine, StateTransitionError};
