//! Transport client
//!
//! Dials an agent, authenticates, and runs one command at a time.

mod error;
mod transport;

pub use error::TransportError;
pub use transport::{
    AgentClient, ClientOptions, CommandChannel, DEFAULT_COMMAND_TIMEOUT, DEFAULT_DIAL_TIMEOUT,
};
