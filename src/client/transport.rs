//! Agent Transport - one authenticated TCP connection to an agent
//!
//! ```text
//! ┌──────────────┐   hello / auth / auth_ok   ┌─────────────┐
//! │ AgentClient  │ ◂────────────────────────▸ │   Agent     │
//! │              │ ───cmd──▸   ◂──result───   │             │
//! └──────────────┘                            └─────────────┘
//! ```
//!
//! - Exactly one command is in flight: `run` takes `&mut self`
//! - Dial and handshake share the dial timeout; each command has its own
//! - A fatal error drops the socket; later calls return `NotConnected`

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::TransportError;
use crate::config::Device;
use crate::protocol::{
    self, Auth, Command, CommandResult, Connection, Hello, Message, ResultData,
};

/// Default dial + handshake timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for one command round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeouts for an [`AgentClient`].
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub dial_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Something that executes one command and returns its result.
///
/// Implemented by [`AgentClient`]; the orchestrator only depends on this.
#[async_trait]
pub trait CommandChannel: Send {
    async fn run(&mut self, cmd: Command) -> Result<CommandResult, TransportError>;
}

/// An authenticated session with an agent.
pub struct AgentClient {
    conn: Option<Connection<TcpStream>>,
    address: String,
    hello: Hello,
    session_id: String,
    options: ClientOptions,
}

impl AgentClient {
    /// Dial the device and authenticate with default timeouts.
    pub async fn connect(device: &Device) -> Result<Self, TransportError> {
        Self::connect_with(device, ClientOptions::default()).await
    }

    /// Dial the device and authenticate.
    pub async fn connect_with(
        device: &Device,
        options: ClientOptions,
    ) -> Result<Self, TransportError> {
        let address = device.address();
        let secs = options.dial_timeout.as_secs();

        let stream = match timeout(options.dial_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Unreachable { address, source }),
            Err(_) => return Err(TransportError::DialTimeout { address, secs }),
        };
        let _ = stream.set_nodelay(true);

        let mut conn = protocol::framed(stream);

        let (hello, session_id) =
            match timeout(options.dial_timeout, handshake(&mut conn, &device.token)).await {
                Ok(Ok(done)) => done,
                Ok(Err(TransportError::Handshake { reason, .. })) => {
                    return Err(TransportError::Handshake { address, reason })
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(TransportError::Handshake {
                        address,
                        reason: format!("no handshake within {}s", secs),
                    })
                }
            };

        info!(
            "[transport] Connected to {} ({}), session {}",
            hello.device_name, address, session_id
        );

        Ok(Self {
            conn: Some(conn),
            address,
            hello,
            session_id,
            options,
        })
    }

    /// Send a command and wait for its result under the default command timeout.
    pub async fn run(&mut self, cmd: Command) -> Result<CommandResult, TransportError> {
        let limit = self.options.command_timeout;
        self.run_with_timeout(cmd, limit).await
    }

    /// Send a command and wait for its result.
    pub async fn run_with_timeout(
        &mut self,
        cmd: Command,
        limit: Duration,
    ) -> Result<CommandResult, TransportError> {
        let conn = self.conn.as_mut().ok_or(TransportError::NotConnected)?;
        let sent_id = cmd.id.clone();
        debug!("[transport] -> {} {:?} (id {})", cmd.cmd, cmd.args, sent_id);

        let outcome = match timeout(limit, exchange(conn, cmd)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout(limit.as_secs())),
        };

        match outcome {
            Ok(result) => {
                if result.id != sent_id {
                    // No recovery is defined for this; the reply is still returned
                    warn!(
                        "[transport] Result id {} does not match command id {}",
                        result.id, sent_id
                    );
                }
                Ok(result)
            }
            Err(e) => {
                if e.is_fatal() {
                    warn!("[transport] Dropping connection to {}: {}", self.address, e);
                    self.conn = None;
                }
                Err(e)
            }
        }
    }

    /// Run a command and turn `ok=false` into [`TransportError::Application`].
    pub async fn run_ok(&mut self, cmd: Command) -> Result<ResultData, TransportError> {
        let result = self.run(cmd).await?;
        if result.ok {
            Ok(result.data)
        } else {
            Err(TransportError::Application(result.error_message().to_string()))
        }
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut stream = conn.into_inner();
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
            debug!("[transport] Closed connection to {}", self.address);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The agent's `hello`.
    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl CommandChannel for AgentClient {
    async fn run(&mut self, cmd: Command) -> Result<CommandResult, TransportError> {
        AgentClient::run(self, cmd).await
    }
}

/// Client side of the handshake: read `hello`, send `auth`, expect `auth_ok`.
async fn handshake(
    conn: &mut Connection<TcpStream>,
    token: &str,
) -> Result<(Hello, String), TransportError> {
    let hello = match protocol::recv(conn).await {
        Ok(Message::Hello(hello)) => hello,
        Ok(other) => {
            return Err(handshake_error(format!("expected hello, got {}", other.kind())))
        }
        Err(e) => return Err(handshake_error(format!("reading hello: {}", e))),
    };

    protocol::send(
        conn,
        &Message::Auth(Auth {
            token: token.to_string(),
        }),
    )
    .await
    .map_err(|e| handshake_error(format!("sending auth: {}", e)))?;

    match protocol::recv(conn).await {
        Ok(Message::AuthOk(ok)) => Ok((hello, ok.session_id)),
        Ok(Message::AuthFail(fail)) => Err(TransportError::AuthFailed(fail.error)),
        Ok(other) => Err(handshake_error(format!(
            "unexpected auth response type: {}",
            other.kind()
        ))),
        Err(e) => Err(handshake_error(format!("reading auth response: {}", e))),
    }
}

fn handshake_error(reason: String) -> TransportError {
    // Address is filled in by the caller
    TransportError::Handshake {
        address: String::new(),
        reason,
    }
}

/// Write one command and read exactly one result line.
async fn exchange(
    conn: &mut Connection<TcpStream>,
    cmd: Command,
) -> Result<CommandResult, TransportError> {
    protocol::send(conn, &Message::Cmd(cmd)).await?;

    match protocol::recv(conn).await? {
        Message::Result(result) => Ok(result),
        other => Err(protocol::ProtocolError::Unexpected {
            expected: "result",
            got: other.kind().to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AuthFail, AuthOk, Flags};
    use tokio::net::TcpListener;

    fn hello() -> Message {
        Message::Hello(Hello {
            version: protocol::PROTOCOL_VERSION.into(),
            device_name: "Fake".into(),
            fingerprint: String::new(),
        })
    }

    /// Accept one connection, complete the handshake, then hand the connection to `script`.
    async fn fake_agent<F, Fut>(token: &'static str, script: F) -> Device
    where
        F: FnOnce(Connection<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = protocol::framed(stream);
            protocol::send(&mut conn, &hello()).await.unwrap();
            let Message::Auth(auth) = protocol::recv(&mut conn).await.unwrap() else {
                panic!("Expected auth");
            };
            if auth.token == token {
                protocol::send(
                    &mut conn,
                    &Message::AuthOk(AuthOk {
                        session_id: "s1".into(),
                    }),
                )
                .await
                .unwrap();
                script(conn).await;
            } else {
                protocol::send(
                    &mut conn,
                    &Message::AuthFail(AuthFail {
                        error: "invalid token".into(),
                    }),
                )
                .await
                .unwrap();
            }
        });
        Device::new("Fake", "127.0.0.1", port, "secret")
    }

    #[tokio::test]
    async fn test_connect_and_run() {
        let device = fake_agent("secret", |mut conn| async move {
            let Message::Cmd(cmd) = protocol::recv(&mut conn).await.unwrap() else {
                panic!("Expected cmd");
            };
            let mut data = ResultData::new();
            data.insert("echo".into(), cmd.cmd.clone().into());
            protocol::send(&mut conn, &Message::Result(CommandResult::ok(cmd.id, data)))
                .await
                .unwrap();
        })
        .await;

        let mut client = AgentClient::connect(&device).await.unwrap();
        assert_eq!(client.session_id(), "s1");
        assert_eq!(client.hello().device_name, "Fake");

        let result = client
            .run(Command::new("status", vec![], Flags::new()))
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.data["echo"], "status");

        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
        assert!(matches!(
            client.run(Command::new("status", vec![], Flags::new())).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_wrong_token_is_auth_failure() {
        let mut device = fake_agent("secret", |_| async {}).await;
        device.token = "wrong".into();

        match AgentClient::connect(&device).await {
            Err(TransportError::AuthFailed(msg)) => assert_eq!(msg, "invalid token"),
            Err(e) => panic!("Expected AuthFailed, got {:?}", e),
            Ok(_) => panic!("Expected AuthFailed, got a session"),
        }
    }

    #[tokio::test]
    async fn test_run_ok_maps_application_error() {
        let device = fake_agent("secret", |mut conn| async move {
            let Message::Cmd(cmd) = protocol::recv(&mut conn).await.unwrap() else {
                panic!("Expected cmd");
            };
            protocol::send(
                &mut conn,
                &Message::Result(CommandResult::error(cmd.id, "permission denied")),
            )
            .await
            .unwrap();
            // Keep the socket open until the client is done
            let _ = protocol::recv(&mut conn).await;
        })
        .await;

        let mut client = AgentClient::connect(&device).await.unwrap();
        match client
            .run_ok(Command::new("sms", vec!["list".into()], Flags::new()))
            .await
        {
            Err(TransportError::Application(msg)) => assert_eq!(msg, "permission denied"),
            other => panic!("Expected application error, got {:?}", other.map(|_| ())),
        }
        // Application errors keep the session open
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_command_timeout_drops_connection() {
        let device = fake_agent("secret", |mut conn| async move {
            // Read the command but never answer
            let _ = protocol::recv(&mut conn).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let options = ClientOptions {
            command_timeout: Duration::from_millis(200),
            ..ClientOptions::default()
        };
        let mut client = AgentClient::connect_with(&device, options).await.unwrap();
        let err = client
            .run(Command::new("status", vec![], Flags::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let device = Device::new("Gone", "127.0.0.1", port, "t");
        match AgentClient::connect(&device).await {
            Err(TransportError::Unreachable { address, .. }) => {
                assert_eq!(address, format!("127.0.0.1:{}", port))
            }
            Err(e) => panic!("Expected Unreachable, got {:?}", e),
            Ok(_) => panic!("Expected Unreachable"),
        }
    }

    #[tokio::test]
    async fn test_non_hello_greeting_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = protocol::framed(stream);
            protocol::send(
                &mut conn,
                &Message::AuthOk(AuthOk {
                    session_id: "x".into(),
                }),
            )
            .await
            .unwrap();
        });

        let device = Device::new("Odd", "127.0.0.1", port, "t");
        match AgentClient::connect(&device).await {
            Err(TransportError::Handshake { address, reason }) => {
                assert_eq!(address, format!("127.0.0.1:{}", port));
                assert!(reason.contains("expected hello"));
            }
            Err(e) => panic!("Expected Handshake, got {:?}", e),
            Ok(_) => panic!("Expected Handshake error"),
        }
    }
}
