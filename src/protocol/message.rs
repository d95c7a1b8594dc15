//! Message types for the tether wire protocol.
//!
//! Every message is a JSON object carrying a `type` discriminator:
//!
//! ```text
//! agent  ──hello{version,deviceName,fingerprint}──▸  client
//! agent  ◂──auth{token}─────────────────────────────  client
//! agent  ──auth_ok{sessionId} | auth_fail{error}──▸  client
//! agent  ◂──cmd{id,cmd,args,flags,payload?}─────────  client
//! agent  ──result{id,ok,data,error?}──────────────▸  client
//! ```

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

/// Protocol version announced in `hello`.
pub const PROTOCOL_VERSION: &str = "1";

/// Default TCP port of the agent.
pub const DEFAULT_PORT: u16 = 8765;

/// Structured success payload of a command.
pub type ResultData = serde_json::Map<String, serde_json::Value>;

/// Flag map of a command (`--key value`).
pub type Flags = BTreeMap<String, String>;

// ═══════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello(Hello),
    Auth(Auth),
    AuthOk(AuthOk),
    AuthFail(AuthFail),
    Cmd(Command),
    Result(CommandResult),
}

impl Message {
    /// Wire name of the variant, as found in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Auth(_) => "auth",
            Message::AuthOk(_) => "auth_ok",
            Message::AuthFail(_) => "auth_fail",
            Message::Cmd(_) => "cmd",
            Message::Result(_) => "result",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Handshake
// ═══════════════════════════════════════════════════════════════════════════

/// Sent by the agent immediately after accepting a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub version: String,
    pub device_name: String,
    /// Hex SHA-256 of the agent's identity key.
    #[serde(default)]
    pub fingerprint: String,
}

/// Client credentials.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub token: String,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth").field("token", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOk {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthFail {
    pub error: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// Command mode
// ═══════════════════════════════════════════════════════════════════════════

/// A command sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub cmd: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub flags: Flags,
    /// Base64-encoded binary payload (uploads).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Command {
    /// Build a command with a fresh unique id.
    pub fn new(cmd: impl Into<String>, args: Vec<String>, flags: Flags) -> Self {
        Self {
            id: next_command_id(),
            cmd: cmd.into(),
            args,
            flags,
            payload: None,
        }
    }

    /// Attach a binary payload, base64-encoding it.
    pub fn with_payload(mut self, bytes: &[u8]) -> Self {
        self.payload = Some(BASE64.encode(bytes));
        self
    }

    /// Decode the payload, if any.
    pub fn payload_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.payload
            .as_deref()
            .map(|p| BASE64.decode(p.trim()))
            .transpose()
    }
}

/// The agent's reply to exactly one [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub id: String,
    pub ok: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: ResultData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(id: impl Into<String>, data: ResultData) -> Self {
        Self {
            id: id.into(),
            ok: true,
            data,
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            data: ResultData::new(),
            error: Some(message.into()),
        }
    }

    /// Error message, or a generic one if the agent sent `ok=false` without text.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("command failed")
    }
}

/// Unique command id: wall-clock nanoseconds plus a random suffix.
fn next_command_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", nanos, &suffix[..8])
}

/// Peers that marshal absent collections as `null` still decode.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
