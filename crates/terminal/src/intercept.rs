//! The intercepted tool surface.
//!
//! The terminal tool server advertises these tools, but the core
//! handles them before they ever reach the subprocess: approval,
//! execution, and PTY interaction all live here.

use serde_json::Value;

use crate::inline;
use crate::service::{RunCommandRequest, TerminalService, DEFAULT_YIELD_MS};

/// Name of the tool server whose tools are intercepted.
pub const TERMINAL_SERVER: &str = "terminal";

/// Tools that never reach the subprocess.
pub const TERMINAL_TOOLS: &[&str] = &[
    "run_command",
    "request_session_mode",
    "end_session_mode",
    "send_input",
    "read_output",
    "kill_process",
    "get_environment",
    "find_files",
];

/// Should this tool call be handled inline instead of routed to its
/// server process?
pub fn is_terminal_tool(name: &str, server: &str) -> bool {
    server == TERMINAL_SERVER && TERMINAL_TOOLS.contains(&name)
}

/// Execute one intercepted terminal tool. The single entry point for
/// every provider's tool loop.
pub async fn execute_terminal_tool(
    service: &TerminalService,
    name: &str,
    args: &Value,
) -> String {
    match name {
        "run_command" => {
            let req = RunCommandRequest {
                command: str_arg(args, "command"),
                cwd: str_arg(args, "cwd"),
                timeout_secs: u64_arg(args, "timeout", 120),
                pty: bool_arg(args, "pty", false),
                background: bool_arg(args, "background", false),
                yield_ms: u64_arg(args, "yield_ms", DEFAULT_YIELD_MS),
                env: env_arg(args),
            };
            if req.command.trim().is_empty() {
                return "Error: command is required".into();
            }
            service.run_command(req).await
        }
        "request_session_mode" => {
            let reason = match args.get("reason").and_then(Value::as_str) {
                Some(r) if !r.is_empty() => r.to_string(),
                _ => "Autonomous operation requested".to_string(),
            };
            if service.request_session(&reason).await {
                "session started".into()
            } else {
                "session request denied".into()
            }
        }
        // Session mode auto-expires after each turn; explicit calls are
        // still honored.
        "end_session_mode" => {
            service.end_session();
            "session ended".into()
        }
        "send_input" => {
            let session_id = str_arg(args, "session_id");
            if session_id.is_empty() {
                return "Error: session_id is required".into();
            }
            let text = str_arg(args, "input_text");
            let press_enter = bool_arg(args, "press_enter", true);
            if text.is_empty() && !press_enter {
                return "Error: input_text is required when press_enter is False".into();
            }
            service
                .send_input(&session_id, &text, press_enter, u64_arg(args, "wait_ms", 3000))
                .await
        }
        "read_output" => {
            let session_id = str_arg(args, "session_id");
            if session_id.is_empty() {
                return "Error: session_id is required".into();
            }
            service.read_output(&session_id, u64_arg(args, "lines", 50) as usize)
        }
        "kill_process" => {
            let session_id = str_arg(args, "session_id");
            if session_id.is_empty() {
                return "Error: session_id is required".into();
            }
            service.kill_process(&session_id)
        }
        "get_environment" => inline::get_environment().await,
        "find_files" => {
            inline::find_files(&str_arg(args, "pattern"), &str_arg(args, "directory"))
        }
        other => format!("Unknown terminal tool: {other}"),
    }
}

fn str_arg(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn u64_arg(args: &Value, key: &str, default: u64) -> u64 {
    args.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn bool_arg(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn env_arg(args: &Value) -> std::collections::HashMap<String, String> {
    args.get("env")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
