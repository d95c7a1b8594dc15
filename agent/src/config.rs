//! Agent configuration and secrets
//!
//! Data directory layout (`<data_dir>` defaults to `<data_local_dir>/tether-agent`):
//!
//! ```text
//! <data_dir>/agent.json   optional settings (bind, port, device_name, handshake_timeout_secs)
//! <data_dir>/token        shared secret clients present in `auth` (0600)
//! <data_dir>/identity     per-install identity key; hello.fingerprint = sha256 hex (0600)
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tether_lib::config::{write_private, StorageError};
use tether_lib::protocol::DEFAULT_PORT;
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

const CONFIG_FILE: &str = "agent.json";
const TOKEN_FILE: &str = "token";
const IDENTITY_FILE: &str = "identity";

const TOKEN_LEN: usize = 32;
const IDENTITY_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum AgentConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0} is empty")]
    EmptySecret(PathBuf),
}

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Listen address
    pub bind: String,

    pub port: u16,

    /// Name announced in `hello` (defaults to the host name)
    pub device_name: String,

    /// Seconds a client has to complete the handshake
    pub handshake_timeout_secs: u64,

    #[serde(skip)]
    pub data_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            device_name: default_device_name(),
            handshake_timeout_secs: 10,
            data_dir: default_data_dir(),
        }
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "tether-agent".to_string())
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("tether-agent"))
        .unwrap_or_else(|| PathBuf::from(".tether-agent"))
}

impl AgentConfig {
    /// Load `<data_dir>/agent.json`, falling back to defaults when absent.
    pub fn load(data_dir: &Path) -> Result<Self, AgentConfigError> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice::<AgentConfig>(&data)
                .map_err(|source| AgentConfigError::Json { path, source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentConfig::default(),
            Err(source) => return Err(AgentConfigError::Io { path, source }),
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        if self.bind.contains(':') && !self.bind.starts_with('[') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join(IDENTITY_FILE)
    }

    /// The persisted token, generating one on first start.
    pub fn load_or_create_token(&self) -> Result<Zeroizing<String>, AgentConfigError> {
        load_or_create_secret(&self.token_path(), TOKEN_LEN)
    }

    /// Hex SHA-256 of the identity key, generating the key on first start.
    pub fn fingerprint(&self) -> Result<String, AgentConfigError> {
        let identity = load_or_create_secret(&self.identity_path(), IDENTITY_LEN)?;
        Ok(fingerprint_of(identity.as_bytes()))
    }
}

/// Random alphanumeric token
pub fn generate_token() -> Zeroizing<String> {
    random_secret(TOKEN_LEN)
}

fn random_secret(len: usize) -> Zeroizing<String> {
    Zeroizing::new(
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect(),
    )
}

/// Write a token file with owner-only permissions.
pub fn save_token(path: &Path, token: &str) -> Result<(), AgentConfigError> {
    write_private(path, token.as_bytes())?;
    Ok(())
}

fn load_or_create_secret(path: &Path, len: usize) -> Result<Zeroizing<String>, AgentConfigError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let raw = Zeroizing::new(raw);
            let secret = raw.trim();
            if secret.is_empty() {
                return Err(AgentConfigError::EmptySecret(path.to_path_buf()));
            }
            Ok(Zeroizing::new(secret.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let secret = random_secret(len);
            write_private(path, secret.as_bytes())?;
            info!("[agent-config] Created {:?}", path);
            Ok(secret)
        }
        Err(source) => Err(AgentConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn fingerprint_of(identity: &[u8]) -> String {
    Sha256::digest(identity)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
