//! Transport client errors

use thiserror::Error;

use crate::protocol::ProtocolError;

const REACHABILITY_HINT: &str = "Is the tether agent running on the device? Is the device on the same network (or VPN overlay)? If the agent was re-installed, re-pair with: tether pair";

/// Errors surfaced by [`AgentClient`](super::AgentClient).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot reach {address}: {source}\n\n{}", REACHABILITY_HINT)]
    Unreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {secs}s connecting to {address}\n\n{}", REACHABILITY_HINT)]
    DialTimeout { address: String, secs: u64 },

    #[error("handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },

    #[error("authentication failed: {0}\n\nYour token may be outdated, re-run: tether pair")]
    AuthFailed(String),

    #[error("no reply from agent after {0}s")]
    Timeout(u64),

    #[error("agent connection error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    /// The agent answered `ok=false`.
    #[error("{0}")]
    Application(String),
}

impl TransportError {
    /// Whether the connection can no longer carry commands.
    ///
    /// After a timeout a late reply could still arrive and be read as the
    /// answer to the next command, so the client drops the socket.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::Application(_) => false,
            TransportError::Protocol(ProtocolError::Malformed(_)) => false,
            TransportError::Protocol(ProtocolError::Unexpected { .. }) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_names_target_and_hint() {
        let err = TransportError::Unreachable {
            address: "10.0.0.5:8765".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.5:8765"));
        assert!(msg.contains("tether pair"));
    }

    #[test]
    fn test_fatality() {
        assert!(TransportError::Timeout(60).is_fatal());
        assert!(TransportError::Protocol(ProtocolError::Closed).is_fatal());
        assert!(!TransportError::Application("denied".into()).is_fatal());
        let malformed = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!TransportError::Protocol(ProtocolError::Malformed(malformed)).is_fatal());
    }
}
