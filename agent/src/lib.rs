//! tether agent: the device side of the tether protocol.

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod server;
pub mod session;

pub use config::AgentConfig;
pub use dispatch::{CommandHandler, CommandRequest, Dispatcher, HandlerOutcome};
pub use server::AgentServer;
pub use session::SessionManager;
