//! Natural-language control
//!
//! A language model plans actions, the executor runs them over the command
//! channel, and the orchestrator loops once more when a screenshot is taken.

pub mod executor;
pub mod model;
mod models;
pub mod orchestrator;
pub mod prompt;
pub mod tokenizer;

pub use executor::{EventSink, Execution, RunEvent, Screenshot};
pub use model::{resolve_api_key, AiConfig, AnthropicModel, CliModel, LanguageModel, ModelError};
pub use orchestrator::{AiError, Orchestrator, RunReport, MAX_ROUNDS};
pub use tokenizer::{parse_action, parse_lines, parse_reply, tokenize, Action, ReplyLine};
