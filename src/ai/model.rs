//! Language model backends
//!
//! - [`AnthropicModel`]: Messages API over HTTPS (vision capable)
//! - [`CliModel`]: one-shot `claude -p <prompt>` when no API key is configured

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use super::models::{MessagesRequest, MessagesResponse};
use super::prompt::fallback_prompt;
use crate::config::DeviceRegistry;
use crate::context::{ConversationTurn, Role};

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Environment override for the model name
pub const MODEL_ENV: &str = "TETHER_MODEL";

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-6";
pub const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
pub const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid API key header")]
    InvalidKey,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parsing response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Empty response from model")]
    Empty,

    #[error("No ANTHROPIC_API_KEY set and '{0}' CLI not found\n\nSet your API key: export ANTHROPIC_API_KEY=\"sk-ant-...\"")]
    CliNotFound(String),

    #[error("Running {program}: {message}")]
    Cli { program: String, message: String },
}

/// Settings for the planning model.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub model: String,
    pub max_tokens: u32,
    pub endpoint: String,
    pub timeout: Duration,
    /// Fallback program invoked as `<program> -p <prompt>`
    pub cli_program: String,
    pub max_rounds: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 1024,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(60),
            cli_program: "claude".to_string(),
            max_rounds: 3,
        }
    }
}

impl AiConfig {
    /// Defaults with the model taken from `TETHER_MODEL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(model) = std::env::var(MODEL_ENV) {
            if !model.trim().is_empty() {
                config.model = model.trim().to_string();
            }
        }
        config
    }
}

/// `ANTHROPIC_API_KEY`, else the registry's `anthropic_key`.
pub fn resolve_api_key(registry: &DeviceRegistry) -> Option<String> {
    pick_api_key(std::env::var(API_KEY_ENV).ok(), registry)
}

fn pick_api_key(env: Option<String>, registry: &DeviceRegistry) -> Option<String> {
    env.filter(|k| !k.trim().is_empty())
        .or_else(|| registry.anthropic_key.clone().filter(|k| !k.trim().is_empty()))
}

/// Something that turns a transcript into a reply.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether image blocks in `turns` are understood.
    fn supports_vision(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        system: &str,
        turns: &[ConversationTurn],
    ) -> Result<String, ModelError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// HTTP
// ═══════════════════════════════════════════════════════════════════════════

pub struct AnthropicModel {
    client: Client,
    api_key: String,
    config: AiConfig,
}

impl AnthropicModel {
    pub fn new(api_key: impl Into<String>, config: AiConfig) -> Result<Self, ModelError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            config,
        })
    }

    fn headers(&self) -> Result<HeaderMap, ModelError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).map_err(|_| ModelError::InvalidKey)?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        Ok(headers)
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        system: &str,
        turns: &[ConversationTurn],
    ) -> Result<String, ModelError> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            system,
            messages: turns,
        };

        debug!(
            "[ai] POST {} ({} turns, model {})",
            self.config.endpoint,
            turns.len(),
            self.config.model
        );
        let response = self
            .client
            .post(&self.config.endpoint)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        parse_response(status, &bytes)
    }
}

/// Text of the first text block, or the API error.
fn parse_response(status: u16, body: &[u8]) -> Result<String, ModelError> {
    let parsed: MessagesResponse = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(_) if !(200..300).contains(&status) => {
            return Err(ModelError::Api {
                status,
                message: String::from_utf8_lossy(body).trim().to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(error) = parsed.error {
        return Err(ModelError::Api {
            status,
            message: error.message,
        });
    }

    parsed
        .content
        .into_iter()
        .find(|block| block.kind == "text")
        .map(|block| block.text)
        .ok_or(ModelError::Empty)
}

// ═══════════════════════════════════════════════════════════════════════════
// CLI fallback
// ═══════════════════════════════════════════════════════════════════════════

/// Runs an external CLI once per request. Text only.
pub struct CliModel {
    program: String,
}

impl CliModel {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for CliModel {
    fn name(&self) -> &str {
        &self.program
    }

    fn supports_vision(&self) -> bool {
        false
    }

    async fn complete(
        &self,
        system: &str,
        turns: &[ConversationTurn],
    ) -> Result<String, ModelError> {
        let query = turns
            .iter()
            .rev()
            .filter(|t| t.role == Role::User)
            .find_map(|t| t.text())
            .unwrap_or_default();
        let prompt = fallback_prompt(system, query);

        debug!("[ai] Running {} -p <prompt>", self.program);
        let output = tokio::process::Command::new(&self.program)
            .arg("-p")
            .arg(&prompt)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ModelError::CliNotFound(self.program.clone())
                } else {
                    ModelError::Cli {
                        program: self.program.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ModelError::Cli {
                program: self.program.clone(),
                message: if stderr.is_empty() {
                    output.status.to_string()
                } else {
                    stderr
                },
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContentBlock;

    #[test]
    fn test_parse_response_text() {
        let body = br#"{"content":[{"type":"text","text":"tether key home"}],"stop_reason":"end_turn"}"#;
        assert_eq!(parse_response(200, body).unwrap(), "tether key home");
    }

    #[test]
    fn test_parse_response_api_error() {
        let body = br#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        match parse_response(401, body) {
            Err(ModelError::Api { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "invalid x-api-key");
            }
            other => panic!("Expected API error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_response_empty_and_garbage() {
        assert!(matches!(
            parse_response(200, br#"{"content":[]}"#),
            Err(ModelError::Empty)
        ));
        assert!(matches!(
            parse_response(502, b"Bad Gateway"),
            Err(ModelError::Api { status: 502, .. })
        ));
        assert!(matches!(
            parse_response(200, b"not json"),
            Err(ModelError::Decode(_))
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let turns = vec![
            ConversationTurn::user("go home"),
            ConversationTurn::user_blocks(vec![
                ContentBlock::image("image/png", "AAAA"),
                ContentBlock::text("look"),
            ]),
        ];
        let body = MessagesRequest {
            model: DEFAULT_MODEL,
            max_tokens: 1024,
            system: "sys",
            messages: &turns,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["model"], DEFAULT_MODEL);
        assert_eq!(value["max_tokens"], 1024);
        assert_eq!(value["messages"][0]["content"], "go home");
        assert_eq!(value["messages"][1]["content"][0]["source"]["type"], "base64");
    }

    #[test]
    fn test_api_key_precedence() {
        let mut registry = DeviceRegistry::default();
        assert_eq!(pick_api_key(None, &registry), None);

        registry.anthropic_key = Some("from-config".into());
        assert_eq!(
            pick_api_key(Some("".into()), &registry).as_deref(),
            Some("from-config")
        );
        assert_eq!(
            pick_api_key(Some("from-env".into()), &registry).as_deref(),
            Some("from-env")
        );
    }

    #[tokio::test]
    async fn test_missing_cli_is_reported() {
        let model = CliModel::new("tether-test-no-such-program");
        let err = model
            .complete("sys", &[ConversationTurn::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::CliNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_receives_system_prompt_and_latest_query() {
        // `echo -p <prompt>` prints the prompt it was given
        let model = CliModel::new("echo");
        let turns = [
            ConversationTurn::user("old question"),
            ConversationTurn::assistant("tether home"),
            ConversationTurn::user("open settings"),
        ];
        let reply = model.complete("sys rules", &turns).await.unwrap();
        assert!(reply.contains("sys rules\n\nUser: open settings"));
        assert!(!reply.contains("old question"));
    }
}
