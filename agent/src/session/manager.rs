//! Session Manager - tracks authenticated client sessions
//!
//! The auth secret and the session registry are the only shared state.
//! Registration happens under the token read lock and rotation under the
//! write lock, so no session authenticated with an old token survives a
//! rotation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tether_lib::protocol::{Hello, PROTOCOL_VERSION};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, AuditLog};
use crate::config::{generate_token, save_token, AgentConfigError};

/// Buffered lifecycle events per subscriber
const EVENT_CAPACITY: usize = 64;

/// Public view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub peer: SocketAddr,
    pub created_at: DateTime<Utc>,
}

/// Control messages for a session task
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Close(String),
}

/// Broadcast to subscribers (e.g. a UI)
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ClientConnected(SessionInfo),
    ClientDisconnected { id: String, reason: String },
    TokenRotated { closed: usize },
}

struct SessionHandle {
    info: SessionInfo,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

pub struct SessionManager {
    token: RwLock<Zeroizing<String>>,
    token_file: Option<PathBuf>,
    fingerprint: String,
    device_name: String,
    sessions: DashMap<String, SessionHandle>,
    events: broadcast::Sender<SessionEvent>,
    audit: AuditLog,
    started_at: Instant,
}

impl SessionManager {
    pub fn new(
        token: impl Into<String>,
        fingerprint: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            token: RwLock::new(Zeroizing::new(token.into())),
            token_file: None,
            fingerprint: fingerprint.into(),
            device_name: device_name.into(),
            sessions: DashMap::new(),
            events,
            audit: AuditLog::new(),
            started_at: Instant::now(),
        }
    }

    /// Persist rotated tokens to `path`
    pub fn with_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_file = Some(path.into());
        self
    }

    /// The greeting sent on every accepted connection
    pub fn hello(&self) -> Hello {
        Hello {
            version: PROTOCOL_VERSION.to_string(),
            device_name: self.device_name.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Constant-time comparison against the current token
    pub fn verify_token(&self, candidate: &str) -> bool {
        let token = self.token.read();
        token.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    /// Verify `candidate` and register a session for `peer` in one step.
    ///
    /// Returns the session and the receiver its task must watch for close
    /// requests, or `None` if the token does not match.
    pub fn authenticate(
        &self,
        candidate: &str,
        session_id: &str,
        peer: SocketAddr,
    ) -> Option<(SessionInfo, mpsc::Receiver<SessionCommand>)> {
        let token = self.token.read();
        if !bool::from(token.as_bytes().ct_eq(candidate.as_bytes())) {
            return None;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let info = SessionInfo {
            id: session_id.to_string(),
            peer,
            created_at: Utc::now(),
        };
        self.sessions.insert(
            info.id.clone(),
            SessionHandle {
                info: info.clone(),
                cmd_tx,
            },
        );
        drop(token);

        info!("[session] Registered {} from {}", info.id, peer);
        let _ = self.events.send(SessionEvent::ClientConnected(info.clone()));
        Some((info, cmd_rx))
    }

    /// Remove a session whose connection ended. Returns false if it was
    /// already removed (closed by the agent).
    pub fn unregister(&self, session_id: &str, reason: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some(_) => {
                info!("[session] Unregistered {}: {}", session_id, reason);
                let _ = self.events.send(SessionEvent::ClientDisconnected {
                    id: session_id.to_string(),
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|e| e.value().info.clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Remove one session and ask its task to close the socket.
    pub fn close_session(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, handle)) => {
                self.signal_close(handle, "closed by agent");
                true
            }
            None => false,
        }
    }

    /// Remove every session and ask each task to close. Returns how many.
    pub fn close_all(&self) -> usize {
        self.drain("closed by agent")
    }

    /// Replace the token with a fresh random one and disconnect everyone.
    pub fn rotate_token(&self) -> Result<Zeroizing<String>, AgentConfigError> {
        let token = generate_token();
        self.replace_token(token.as_str())?;
        Ok(token)
    }

    /// Install `new_token` and disconnect everyone.
    ///
    /// The token file (if any) is written first; on failure nothing changes.
    pub fn replace_token(&self, new_token: &str) -> Result<usize, AgentConfigError> {
        if let Some(path) = &self.token_file {
            save_token(path, new_token)?;
        }

        let closed = {
            let mut token = self.token.write();
            *token = Zeroizing::new(new_token.to_string());
            self.drain("token rotated")
        };

        warn!("[session] Token rotated, closed {} session(s)", closed);
        self.audit.record(AuditEvent::token_rotated(closed));
        let _ = self.events.send(SessionEvent::TokenRotated { closed });
        Ok(closed)
    }

    fn drain(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, handle)) = self.sessions.remove(&id) {
                self.signal_close(handle, reason);
                closed += 1;
            }
        }
        closed
    }

    fn signal_close(&self, handle: SessionHandle, reason: &str) {
        let id = handle.info.id.clone();
        info!("[session] Closing {}: {}", id, reason);
        // Capacity 1: a full channel already holds a close request
        let _ = handle.cmd_tx.try_send(SessionCommand::Close(reason.to_string()));
        let _ = self.events.send(SessionEvent::ClientDisconnected {
            id,
            reason: reason.to_string(),
        });
    }
}

/// Short random session identifier (8 hex chars)
pub fn new_session_id() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_verify_token() {
        let manager = SessionManager::new("secret", "fp", "Pixel");
        assert!(manager.verify_token("secret"));
        assert!(!manager.verify_token("secre"));
        assert!(!manager.verify_token(""));
    }

    #[test]
    fn test_wrong_token_registers_nothing() {
        let manager = SessionManager::new("secret", "fp", "Pixel");
        assert!(manager.authenticate("nope", "s1", peer(1)).is_none());
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_events_on_connect_and_disconnect() {
        let manager = SessionManager::new("secret", "fp", "Pixel");
        let mut events = manager.subscribe();

        let (info, _rx) = manager.authenticate("secret", "s1", peer(1)).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ClientConnected(info)
        );

        assert!(manager.unregister("s1", "eof"));
        assert!(!manager.unregister("s1", "eof"));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ClientDisconnected {
                id: "s1".into(),
                reason: "eof".into()
            }
        );
    }

    #[tokio::test]
    async fn test_rotation_signals_every_session() {
        let temp_dir = TempDir::new().unwrap();
        let token_file = temp_dir.path().join("token");
        let manager = SessionManager::new("old", "fp", "Pixel").with_token_file(&token_file);

        let mut receivers = Vec::new();
        for i in 0..3 {
            let (_, rx) = manager
                .authenticate("old", &format!("s{}", i), peer(i))
                .unwrap();
            receivers.push(rx);
        }
        assert_eq!(manager.session_count(), 3);

        let new_token = manager.rotate_token().unwrap();
        assert_eq!(manager.session_count(), 0);
        assert!(manager.list_sessions().is_empty());
        assert!(!manager.verify_token("old"));
        assert!(manager.verify_token(&new_token));
        assert_eq!(std::fs::read_to_string(&token_file).unwrap(), *new_token);

        for rx in receivers.iter_mut() {
            assert_eq!(
                rx.recv().await,
                Some(SessionCommand::Close("token rotated".into()))
            );
        }
        assert_eq!(manager.audit().count("TOKEN_ROTATED"), 1);
    }

    #[test]
    fn test_close_session() {
        let manager = SessionManager::new("t", "fp", "Pixel");
        let (_, mut rx) = manager.authenticate("t", "s1", peer(1)).unwrap();
        assert!(manager.close_session("s1"));
        assert!(!manager.close_session("s1"));
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionCommand::Close("closed by agent".into())
        );
    }

    #[test]
    fn test_hello_and_session_ids() {
        let manager = SessionManager::new("t", "abcd", "Pixel");
        let hello = manager.hello();
        assert_eq!(hello.version, PROTOCOL_VERSION);
        assert_eq!(hello.device_name, "Pixel");
        assert_eq!(hello.fingerprint, "abcd");

        let id = new_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
