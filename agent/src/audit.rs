//! Audit trail for connection and authentication events.
//!
//! Every event is emitted as one JSON line on the `audit` tracing target and
//! kept in a bounded in-memory log for inspection (and tests).

use std::collections::VecDeque;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Events kept in memory
const AUDIT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    AuthSuccess {
        timestamp: DateTime<Utc>,
        session_id: String,
        peer: String,
    },

    /// Wrong token or malformed handshake
    AuthFailed {
        timestamp: DateTime<Utc>,
        session_id: String,
        peer: String,
        reason: String,
    },

    HandshakeTimeout {
        timestamp: DateTime<Utc>,
        session_id: String,
        peer: String,
    },

    SessionClosed {
        timestamp: DateTime<Utc>,
        session_id: String,
        peer: String,
        reason: String,
    },

    TokenRotated {
        timestamp: DateTime<Utc>,
        closed_sessions: usize,
    },
}

impl AuditEvent {
    pub fn auth_success(session_id: &str, peer: SocketAddr) -> Self {
        Self::AuthSuccess {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            peer: peer.to_string(),
        }
    }

    pub fn auth_failed(session_id: &str, peer: SocketAddr, reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    pub fn handshake_timeout(session_id: &str, peer: SocketAddr) -> Self {
        Self::HandshakeTimeout {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            peer: peer.to_string(),
        }
    }

    pub fn session_closed(session_id: &str, peer: SocketAddr, reason: impl Into<String>) -> Self {
        Self::SessionClosed {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    pub fn token_rotated(closed_sessions: usize) -> Self {
        Self::TokenRotated {
            timestamp: Utc::now(),
            closed_sessions,
        }
    }

    /// Event name as serialized
    pub fn name(&self) -> &'static str {
        match self {
            Self::AuthSuccess { .. } => "AUTH_SUCCESS",
            Self::AuthFailed { .. } => "AUTH_FAILED",
            Self::HandshakeTimeout { .. } => "HANDSHAKE_TIMEOUT",
            Self::SessionClosed { .. } => "SESSION_CLOSED",
            Self::TokenRotated { .. } => "TOKEN_ROTATED",
        }
    }
}

/// Bounded in-memory audit log.
#[derive(Debug, Default)]
pub struct AuditLog {
    events: Mutex<VecDeque<AuditEvent>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "audit", "{}", json),
            Err(e) => tracing::warn!(target: "audit", "unserializable {} event: {}", event.name(), e),
        }

        let mut events = self.events.lock();
        if events.len() == AUDIT_CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Oldest first
    pub fn recent(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Number of retained events named `name`
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}
