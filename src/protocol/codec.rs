//! Line framing for the wire protocol
//!
//! Frame format: one JSON object followed by `\n`. No length prefix.
//! A trailing `\r` and surrounding whitespace are tolerated on read.
//!
//! Both sides wrap their socket in a [`Connection`] and exchange whole lines;
//! parsing a line into a [`Message`] is a separate step so that a reader can
//! decide per phase whether a bad line is fatal or skippable.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use super::message::Message;

/// Maximum length of one line (32 MB). Screenshots travel base64-encoded
/// inside a single `result`, so the limit is large.
pub const MAX_LINE_LENGTH: usize = 32 * 1024 * 1024;

/// A socket framed into protocol lines.
pub type Connection<T> = Framed<T, LinesCodec>;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Line exceeds {} bytes", MAX_LINE_LENGTH)]
    LineTooLong,

    #[error("Expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: String },

    #[error("Connection closed by peer")]
    Closed,
}

impl From<LinesCodecError> for ProtocolError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::LineTooLong,
            LinesCodecError::Io(e) => ProtocolError::Io(e),
        }
    }
}

impl Message {
    /// Serialize to a single newline-terminated line.
    pub fn encode_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line. Surrounding whitespace is ignored.
    pub fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Wrap a socket into a line-framed connection.
pub fn framed<T>(io: T) -> Connection<T>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

/// Write one message as one line.
pub async fn send<T>(conn: &mut Connection<T>, message: &Message) -> Result<(), ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let json = serde_json::to_string(message)?;
    conn.send(json).await?;
    Ok(())
}

/// Read the next non-blank line. `Ok(None)` means the peer closed the socket.
pub async fn recv_line<T>(conn: &mut Connection<T>) -> Result<Option<String>, ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(line) = conn.next().await {
        let line = line?;
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

/// Read and parse the next message. EOF is reported as [`ProtocolError::Closed`].
pub async fn recv<T>(conn: &mut Connection<T>) -> Result<Message, ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match recv_line(conn).await? {
        Some(line) => Message::decode_line(&line),
        None => Err(ProtocolError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AuthFail, Hello};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_encode_line_is_single_terminated_line() {
        let msg = Message::AuthFail(AuthFail {
            error: "invalid token\nline".into(),
        });
        let line = msg.encode_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(Message::decode_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_decode_tolerates_whitespace() {
        let line = "  {\"type\":\"auth\",\"token\":\"abc\"}\r\n";
        assert!(matches!(Message::decode_line(line).unwrap(), Message::Auth(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(Message::decode_line(r#"{"type":"bogus"}"#).is_err());
        assert!(Message::decode_line("not json").is_err());
    }

    #[tokio::test]
    async fn test_framed_exchange() {
        let (client, mut server) = duplex(4096);
        let mut conn = framed(client);

        server
            .write_all(b"\n{\"type\":\"hello\",\"version\":\"1\",\"deviceName\":\"Pixel\",\"fingerprint\":\"\"}\r\n")
            .await
            .unwrap();

        match recv(&mut conn).await.unwrap() {
            Message::Hello(Hello { device_name, .. }) => assert_eq!(device_name, "Pixel"),
            other => panic!("Expected hello, got {:?}", other),
        }

        send(
            &mut conn,
            &Message::AuthFail(AuthFail {
                error: "nope".into(),
            }),
        )
        .await
        .unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"type\":\"auth_fail\",\"error\":\"nope\"}\n");
    }

    #[tokio::test]
    async fn test_recv_reports_eof_as_closed() {
        let (client, server) = duplex(64);
        drop(server);
        let mut conn = framed(client);
        assert!(matches!(recv(&mut conn).await, Err(ProtocolError::Closed)));
    }
}
