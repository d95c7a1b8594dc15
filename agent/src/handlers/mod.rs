//! Built-in commands
//!
//! Device handlers (files, messaging, apps, input) plug in through
//! [`Dispatcher::register`](crate::dispatch::Dispatcher::register).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tether_lib::protocol::{ResultData, PROTOCOL_VERSION};

use crate::dispatch::{CommandHandler, CommandRequest, HandlerOutcome};
use crate::session::SessionManager;

/// `ping [args...]`: echoes its arguments
pub struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, request: CommandRequest) -> HandlerOutcome {
        let mut data = ResultData::new();
        data.insert("pong".into(), json!(true));
        data.insert("args".into(), json!(request.args));
        Ok(data)
    }
}

/// `status`: agent identity and health
pub struct StatusHandler {
    sessions: Arc<SessionManager>,
}

impl StatusHandler {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn handle(&self, _request: CommandRequest) -> HandlerOutcome {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut data = ResultData::new();
        data.insert("agent_version".into(), json!(env!("CARGO_PKG_VERSION")));
        data.insert("protocol_version".into(), json!(PROTOCOL_VERSION));
        data.insert("device_name".into(), json!(self.sessions.device_name()));
        data.insert("hostname".into(), json!(hostname));
        data.insert("uptime_secs".into(), json!(self.sessions.uptime().as_secs()));
        data.insert("sessions".into(), json!(self.sessions.session_count()));
        Ok(data)
    }
}
