//! Reference tool server: line-delimited JSON-RPC over stdio.
//!
//! Profiles:
//! - `demo`: an `add` tool plus a `show_path` probe, used by the
//!   integration tests.
//! - `terminal`: advertises the terminal tool surface. The core
//!   intercepts every one of these tools, so the handlers here only
//!   ever run if something is miswired.

use std::io::{BufRead, Write};

use serde_json::{json, Value};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let profile = args
        .iter()
        .position(|a| a == "--profile")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
        .unwrap_or("demo")
        .to_string();

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(frame) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        // Notifications carry no id and get no reply.
        let Some(id) = frame.get("id").and_then(Value::as_u64) else {
            continue;
        };
        let method = frame.get("method").and_then(Value::as_str).unwrap_or("");

        let response = match method {
            "initialize" => ok(id, json!({ "serverName": format!("stub-{profile}") })),
            "list_tools" => ok(id, json!({ "tools": tools_for(&profile) })),
            "call_tool" => {
                let params = frame.get("params").cloned().unwrap_or(Value::Null);
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                match handle_call(&profile, name, &arguments) {
                    Some(text) => ok(
                        id,
                        json!({ "content": [{ "type": "text", "text": text }] }),
                    ),
                    None => err(id, -32601, &format!("unknown tool: {name}")),
                }
            }
            other => err(id, -32601, &format!("unknown method: {other}")),
        };

        if writeln!(out, "{response}").is_err() {
            break;
        }
        let _ = out.flush();
    }
}

fn ok(id: u64, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn err(id: u64, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn tools_for(profile: &str) -> Value {
    match profile {
        "terminal" => json!([
            {
                "name": "run_command",
                "description": "Run a shell command. Supports streaming output, PTY mode for interactive CLIs, and background sessions.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "command": { "type": "string" },
                        "cwd": { "type": "string" },
                        "timeout": { "type": "integer" },
                        "pty": { "type": "boolean" },
                        "background": { "type": "boolean" },
                        "yield_ms": { "type": "integer" }
                    },
                    "required": ["command"]
                }
            },
            {
                "name": "request_session_mode",
                "description": "Ask the user to approve autonomous terminal operation for the rest of the turn.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "reason": { "type": "string" } }
                }
            },
            {
                "name": "end_session_mode",
                "description": "End autonomous terminal operation.",
                "inputSchema": { "type": "object", "properties": {} }
            },
            {
                "name": "send_input",
                "description": "Send input text to a running terminal session.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "string" },
                        "input_text": { "type": "string" },
                        "press_enter": { "type": "boolean" },
                        "wait_ms": { "type": "integer" }
                    },
                    "required": ["session_id"]
                }
            },
            {
                "name": "read_output",
                "description": "Read recent output from a terminal session.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "string" },
                        "lines": { "type": "integer" }
                    },
                    "required": ["session_id"]
                }
            },
            {
                "name": "kill_process",
                "description": "Terminate a terminal session.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "session_id": { "type": "string" } },
                    "required": ["session_id"]
                }
            },
            {
                "name": "get_environment",
                "description": "Report the OS, shell, working directory, and available developer tools.",
                "inputSchema": { "type": "object", "properties": {} }
            },
            {
                "name": "find_files",
                "description": "Find files matching a glob pattern under a directory.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "pattern": { "type": "string" },
                        "directory": { "type": "string" }
                    },
                    "required": ["pattern"]
                }
            }
        ]),
        _ => json!([
            {
                "name": "add",
                "description": "Add two numbers and return the sum.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "a": { "type": "number" },
                        "b": { "type": "number" }
                    },
                    "required": ["a", "b"],
                    "additionalProperties": false
                }
            },
            {
                "name": "show_path",
                "description": "Return the PATH visible to this server process.",
                "inputSchema": { "type": "object", "properties": {} }
            }
        ]),
    }
}

fn handle_call(profile: &str, name: &str, arguments: &Value) -> Option<String> {
    match (profile, name) {
        ("demo", "add") => {
            let a = arguments.get("a").and_then(Value::as_f64)?;
            let b = arguments.get("b").and_then(Value::as_f64)?;
            let sum = a + b;
            if sum.fract() == 0.0 {
                Some(format!("{}", sum as i64))
            } else {
                Some(format!("{sum}"))
            }
        }
        ("demo", "show_path") => Some(std::env::var("PATH").unwrap_or_default()),
        ("terminal", _) => Some("intercepted by the core; this stub should never run".into()),
        _ => None,
    }
}
