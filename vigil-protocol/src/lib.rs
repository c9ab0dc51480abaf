//! Line-delimited JSON protocol spoken between vigil clients and the agent.
//!
//! Every message is one UTF-8 JSON object terminated by `\n`. Clients send
//! [`protocol::ClientMessage`]s; the agent answers each with a
//! [`protocol::Response`] envelope.

pub mod client;
pub mod errors;
pub mod protocol;
