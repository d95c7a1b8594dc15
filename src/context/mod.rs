//! Conversation context
//!
//! Bounded conversation history persisted between `tether ai` invocations,
//! one JSON file per device: `<config_dir>/tether/context/<device>.json`.
//!
//! On disk every turn is plain text. Image-bearing turns only exist in memory
//! during a vision round and are reduced to a placeholder if they are ever
//! handed to [`ContextStore::save`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::storage::write_private;
use crate::config::{context_dir, StorageError};

/// Maximum number of persisted turns (oldest dropped first)
pub const MAX_TURNS: usize = 40;

/// Stored in place of any non-text content
pub const SCREENSHOT_PLACEHOLDER: &str = "[screenshot]";

// ═══════════════════════════════════════════════════════════════════════════
// Turns
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Image data carried inline, base64 encoded.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSource")
            .field("media_type", &self.media_type)
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, base64_data: impl Into<String>) -> Self {
        ContentBlock::Image {
            source: ImageSource {
                kind: "base64".into(),
                media_type: media_type.into(),
                data: base64_data.into(),
            },
        }
    }
}

/// Plain text or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: TurnContent,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Blocks(blocks),
        }
    }

    /// Text content, if this is a plain-text turn.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text(text) => Some(text),
            TurnContent::Blocks(_) => None,
        }
    }

    pub fn has_image(&self) -> bool {
        match &self.content {
            TurnContent::Text(_) => false,
            TurnContent::Blocks(blocks) => blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::Image { .. })),
        }
    }
}

/// On-disk form of a turn.
#[derive(Debug, Serialize, Deserialize)]
struct StoredTurn {
    role: Role,
    content: String,
}

impl From<&ConversationTurn> for StoredTurn {
    fn from(turn: &ConversationTurn) -> Self {
        let content = match &turn.content {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Blocks(_) => SCREENSHOT_PLACEHOLDER.to_string(),
        };
        Self {
            role: turn.role,
            content,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Failed to read context {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt context file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to save context: {0}")]
    Write(#[from] StorageError),

    #[error("Failed to remove context {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One device's conversation history file.
#[derive(Debug, Clone)]
pub struct ContextStore {
    path: PathBuf,
}

impl ContextStore {
    /// Store for `device_name` under the client configuration directory `base`.
    pub fn for_device(base: &Path, device_name: &str) -> Self {
        let file = format!("{}.json", sanitize_file_stem(device_name));
        Self {
            path: context_dir(base).join(file),
        }
    }

    /// Store backed by an explicit file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the history. A missing file is an empty history.
    pub fn load(&self) -> Result<Vec<ConversationTurn>, ContextError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ContextError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let stored: Vec<StoredTurn> =
            serde_json::from_slice(&data).map_err(|source| ContextError::Malformed {
                path: self.path.clone(),
                source,
            })?;

        Ok(stored
            .into_iter()
            .map(|t| ConversationTurn {
                role: t.role,
                content: TurnContent::Text(t.content),
            })
            .collect())
    }

    /// Persist the last [`MAX_TURNS`] turns as plain text.
    pub fn save(&self, turns: &[ConversationTurn]) -> Result<(), ContextError> {
        let start = turns.len().saturating_sub(MAX_TURNS);
        let stored: Vec<StoredTurn> = turns[start..].iter().map(StoredTurn::from).collect();

        let data = serde_json::to_vec_pretty(&stored).map_err(|source| ContextError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        write_private(&self.path, &data)?;
        debug!("[context] Saved {} turns to {:?}", stored.len(), self.path);
        Ok(())
    }

    /// Delete the history. A missing file is not an error.
    pub fn clear(&self) -> Result<(), ContextError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ContextError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Device names are free text; keep file names portable.
fn sanitize_file_stem(name: &str) -> String {
    let stem: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "default".to_string()
    } else {
        stem
    }
}
