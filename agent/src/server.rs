//! TCP server: accept loop and per-connection session task
//!
//! ```text
//! accept ──▸ hello ──▸ auth ──▸ auth_ok ──▸ cmd/result ... ──▸ close
//!                        │                        ▲
//!                        └─ auth_fail, close      └─ SessionCommand::Close (rotation)
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_lib::protocol::{
    self, AuthFail, AuthOk, Connection, Message, ProtocolError,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::audit::AuditEvent;
use crate::dispatch::Dispatcher;
use crate::session::{
    new_session_id, ConnectionStateMachine, SessionCommand, SessionManager,
};

/// Pause after a failed `accept` (e.g. out of file descriptors)
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const INVALID_TOKEN: &str = "invalid token";

pub struct AgentServer {
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    handshake_timeout: Duration,
}

impl AgentServer {
    pub fn new(sessions: Arc<SessionManager>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            sessions,
            dispatcher,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, limit: Duration) -> Self {
        self.handshake_timeout = limit;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Accept connections until `shutdown` resolves, then close every session.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("[agent-server] Listening on {}", addr);
        }
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    let closed = self.sessions.close_all();
                    info!("[agent-server] Shutting down, closed {} session(s)", closed);
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!("[agent-server] Accept error: {}, retrying in {:?}", e, ACCEPT_RETRY_DELAY);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let session_id = new_session_id();
        let mut state = ConnectionStateMachine::new();
        let _ = stream.set_nodelay(true);
        let mut conn = protocol::framed(stream);
        debug!("[agent-server] {} connected from {}", session_id, peer);

        let token = match timeout(self.handshake_timeout, self.read_auth(&mut conn, &mut state)).await
        {
            Ok(Ok(token)) => token,
            Ok(Err(reason)) => {
                self.sessions
                    .audit()
                    .record(AuditEvent::auth_failed(&session_id, peer, &reason));
                close_state(&mut state, &session_id, reason);
                return;
            }
            Err(_) => {
                self.sessions
                    .audit()
                    .record(AuditEvent::handshake_timeout(&session_id, peer));
                warn!("[agent-server] {} from {}: handshake timed out", session_id, peer);
                close_state(&mut state, &session_id, "handshake timeout");
                return;
            }
        };

        let Some((_info, mut close_rx)) = self.sessions.authenticate(&token, &session_id, peer)
        else {
            self.sessions
                .audit()
                .record(AuditEvent::auth_failed(&session_id, peer, INVALID_TOKEN));
            warn!("[agent-server] {} from {}: invalid token", session_id, peer);
            send_auth_fail(&mut conn, INVALID_TOKEN).await;
            close_state(&mut state, &session_id, INVALID_TOKEN);
            return;
        };
        drop(token);

        let ok = Message::AuthOk(AuthOk {
            session_id: session_id.clone(),
        });
        if let Err(e) = protocol::send(&mut conn, &ok).await {
            self.sessions.unregister(&session_id, "auth_ok not delivered");
            warn!("[agent-server] {}: sending auth_ok failed: {}", session_id, e);
            close_state(&mut state, &session_id, "auth_ok not delivered");
            return;
        }
        if let Err(e) = state.authenticated() {
            warn!("[agent-server] {}: {}", session_id, e);
        }
        self.sessions
            .audit()
            .record(AuditEvent::auth_success(&session_id, peer));

        let reason = self
            .command_loop(&mut conn, &mut close_rx, &state, &session_id)
            .await;

        self.sessions.unregister(&session_id, &reason);
        self.sessions
            .audit()
            .record(AuditEvent::session_closed(&session_id, peer, &reason));
        let active_for = state.time_in_state();
        close_state(&mut state, &session_id, reason);
        debug!(
            "[agent-server] {} closed after {:?} active: {}",
            session_id,
            active_for,
            state.close_reason().unwrap_or_default()
        );
    }

    /// Send `hello` and read the client's token.
    ///
    /// Anything but a well-formed `auth` is answered with `auth_fail`.
    async fn read_auth(
        &self,
        conn: &mut Connection<TcpStream>,
        state: &mut ConnectionStateMachine,
    ) -> Result<Zeroizing<String>, String> {
        protocol::send(conn, &Message::Hello(self.sessions.hello()))
            .await
            .map_err(|e| format!("sending hello: {}", e))?;
        state.begin_auth().map_err(|e| e.to_string())?;

        let reason = match protocol::recv(conn).await {
            Ok(Message::Auth(auth)) => return Ok(Zeroizing::new(auth.token)),
            Ok(other) => format!("expected auth, got {}", other.kind()),
            Err(ProtocolError::Malformed(e)) => format!("malformed auth: {}", e),
            Err(e) => return Err(format!("reading auth: {}", e)),
        };
        send_auth_fail(conn, &reason).await;
        Err(reason)
    }

    /// Serve commands until the client leaves or the agent closes the session.
    ///
    /// A close request also cancels a command that is still running.
    async fn command_loop(
        &self,
        conn: &mut Connection<TcpStream>,
        close_rx: &mut mpsc::Receiver<SessionCommand>,
        state: &ConnectionStateMachine,
        session_id: &str,
    ) -> String {
        if !state.is_active() {
            warn!("[agent-server] {}: not authenticated ({})", session_id, state.state());
            return "not authenticated".to_string();
        }

        loop {
            tokio::select! {
                // Close requests win over pending input
                biased;

                command = close_rx.recv() => return close_reason(command),
                line = protocol::recv_line(conn) => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => return "client disconnected".to_string(),
                        Err(ProtocolError::LineTooLong) => {
                            warn!("[agent-server] {}: line too long", session_id);
                            return "line too long".to_string();
                        }
                        Err(e) => return format!("read error: {}", e),
                    };

                    let cmd = match Message::decode_line(&line) {
                        Ok(Message::Cmd(cmd)) => cmd,
                        Ok(other) => {
                            warn!("[agent-server] {}: ignoring unexpected {} message", session_id, other.kind());
                            continue;
                        }
                        Err(e) => {
                            warn!("[agent-server] {}: skipping malformed line: {}", session_id, e);
                            continue;
                        }
                    };

                    debug!("[agent-server] {}: {} {:?} (id {})", session_id, cmd.cmd, cmd.args, cmd.id);
                    let result = tokio::select! {
                        biased;

                        command = close_rx.recv() => {
                            warn!("[agent-server] {}: closed while running {} (id {})", session_id, cmd.cmd, cmd.id);
                            return close_reason(command);
                        }
                        result = self.dispatcher.dispatch(&cmd) => result,
                    };
                    if let Err(e) = protocol::send(conn, &Message::Result(result)).await {
                        return format!("write error: {}", e);
                    }
                }
            }
        }
    }
}

fn close_reason(command: Option<SessionCommand>) -> String {
    match command {
        Some(SessionCommand::Close(reason)) => reason,
        None => "closed by agent".to_string(),
    }
}

async fn send_auth_fail(conn: &mut Connection<TcpStream>, error: &str) {
    let fail = Message::AuthFail(AuthFail {
        error: error.to_string(),
    });
    if let Err(e) = protocol::send(conn, &fail).await {
        debug!("[agent-server] auth_fail not delivered: {}", e);
    }
}

fn close_state(state: &mut ConnectionStateMachine, session_id: &str, reason: impl Into<String>) {
    if let Err(e) = state.close(reason) {
        warn!("[agent-server] {}: {}", session_id, e);
    }
}
