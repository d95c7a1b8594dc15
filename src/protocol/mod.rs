//! Wire protocol shared by the tether client and agent
//!
//! Newline-delimited JSON over TCP. The agent speaks first (`hello`), the
//! client authenticates (`auth`), then the connection carries exactly one
//! `cmd`/`result` pair at a time until either side closes.

mod codec;
mod message;

pub use codec::{framed, recv, recv_line, send, Connection, ProtocolError, MAX_LINE_LENGTH};
pub use message::{
    Auth, AuthFail, AuthOk, Command, CommandResult, Flags, Hello, Message, ResultData,
    DEFAULT_PORT, PROTOCOL_VERSION,
};
