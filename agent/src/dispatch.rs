//! Command dispatch
//!
//! Maps a command name to its handler. Whatever the handler does (returns an
//! error, panics), the caller gets exactly one [`CommandResult`] back with
//! the request id echoed.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tether_lib::protocol::{Command, CommandResult, Flags, ResultData};
use tracing::{debug, error, warn};

use crate::handlers;
use crate::session::SessionManager;

/// Success payload or a human-readable error
pub type HandlerOutcome = Result<ResultData, String>;

/// Decoded command handed to a handler
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub name: String,
    pub args: Vec<String>,
    pub flags: Flags,
    pub payload: Option<Vec<u8>>,
}

impl CommandRequest {
    /// Sub-verb (`args[0]`), if any
    pub fn verb(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    pub fn flag(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(String::as_str)
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, request: CommandRequest) -> HandlerOutcome;
}

/// Synchronous closures are handlers too.
#[async_trait]
impl<F> CommandHandler for F
where
    F: Fn(CommandRequest) -> HandlerOutcome + Send + Sync,
{
    async fn handle(&self, request: CommandRequest) -> HandlerOutcome {
        self(request)
    }
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with the agent's own commands (`ping`, `status`).
    pub fn with_builtins(sessions: Arc<SessionManager>) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register("ping", handlers::PingHandler);
        dispatcher.register("status", handlers::StatusHandler::new(sessions));
        dispatcher
    }

    /// Register (or replace) the handler for `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!("[dispatch] Replaced handler for {:?}", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn dispatch(&self, cmd: &Command) -> CommandResult {
        let Some(handler) = self.handlers.get(&cmd.cmd).cloned() else {
            debug!("[dispatch] Unknown command {:?} (id {})", cmd.cmd, cmd.id);
            return CommandResult::error(&cmd.id, format!("unknown command: {}", cmd.cmd));
        };

        let payload = match cmd.payload_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                return CommandResult::error(&cmd.id, format!("invalid payload: {}", e));
            }
        };

        let request = CommandRequest {
            name: cmd.cmd.clone(),
            args: cmd.args.clone(),
            flags: cmd.flags.clone(),
            payload,
        };

        match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
            Ok(Ok(data)) => CommandResult::ok(&cmd.id, data),
            Ok(Err(message)) => CommandResult::error(&cmd.id, message),
            Err(panic_payload) => {
                let panic_msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(
                    "[dispatch] {} handler panicked (id {}): {}",
                    cmd.cmd, cmd.id, panic_msg
                );
                CommandResult::error(
                    &cmd.id,
                    format!("{} handler failed: {}", cmd.cmd, panic_msg),
                )
            }
        }
    }
}
