//! Terminal subsystem: per-command approval rendezvous, ask levels and
//! session mode, line-streamed execution, pseudoterminal sessions with
//! input injection, the OS blocklist, and the terminal event stream.

pub mod approvals;
pub mod blocklist;
pub mod events;
pub mod exec;
pub mod inline;
pub mod intercept;
pub mod pty;
pub mod service;
pub mod session;

pub use events::{TerminalEvent, TerminalEventSink};
pub use intercept::{execute_terminal_tool, is_terminal_tool, TERMINAL_SERVER};
pub use service::TerminalService;
