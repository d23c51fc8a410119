//! Subprocess tool servers.
//!
//! A tool server is a child process speaking line-delimited JSON-RPC 2.0
//! on its standard streams. The [`manager::ToolServerManager`] owns every
//! connection, discovers tools, and routes invocations.

pub mod manager;
pub mod protocol;
pub mod transport;

pub use manager::{ConnectError, ToolServerManager};
