//! tether: control a paired device over a line-delimited JSON protocol.
//!
//! - [`protocol`]: wire messages and framing shared with the agent
//! - [`client`]: authenticated transport to one agent
//! - [`config`]: paired devices and pairing descriptors
//! - [`context`]: persisted conversation history
//! - [`ai`]: natural-language planning loop

pub mod ai;
pub mod client;
pub mod config;
pub mod context;
pub mod protocol;
