//! Tool-server manager — owns every subprocess tool server, the global
//! tool registry, and invocation routing.
//!
//! There is exactly one manager per process. Tool names are globally
//! unique: a later-registered duplicate is rejected and the first
//! registration wins. Tools hold only the owning server's name; the
//! manager holds the connections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use valet_domain::config::ToolServerConfig;
use valet_domain::sysenv::StartupEnv;
use valet_domain::tool::ToolSpec;

use crate::protocol::{CallToolResult, InitializeParams, ListToolsResult, ServerToolDef};
use crate::transport::{StdioTransport, TransportError};

/// Hard ceiling for a single `call_tool` round trip.
const CALL_TOOL_TIMEOUT: Duration = Duration::from_secs(180);

/// Timeout for the initialize/list_tools handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to spawn tool server: {0}")]
    Spawn(#[from] TransportError),

    #[error("handshake with tool server failed: {0}")]
    Handshake(String),
}

/// Called with the full tool snapshot after any registration change so
/// the retriever can re-embed.
pub type ReindexHook = Box<dyn Fn(Vec<ToolSpec>) + Send + Sync>;

struct RegisteredTool {
    spec: ToolSpec,
    server: String,
}

#[derive(Default)]
struct Registry {
    servers: HashMap<String, Arc<StdioTransport>>,
    tools: Vec<RegisteredTool>,
}

pub struct ToolServerManager {
    registry: RwLock<Registry>,
    env: StartupEnv,
    project_root: PathBuf,
    reindex_hook: RwLock<Option<ReindexHook>>,
}

impl ToolServerManager {
    pub fn new(env: StartupEnv, project_root: PathBuf) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            env,
            project_root,
            reindex_hook: RwLock::new(None),
        }
    }

    /// Wire the retriever re-embed hook (set once at startup).
    pub fn set_reindex_hook(&self, hook: ReindexHook) {
        *self.reindex_hook.write() = Some(hook);
    }

    // ── Connection lifecycle ──────────────────────────────────────

    /// Spawn a server, run the handshake, discover and register tools.
    ///
    /// A no-op when `server_name` is already connected. Servers that
    /// fail here are skipped by the caller; the rest of the system runs
    /// without them.
    pub async fn connect(
        &self,
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(), ConnectError> {
        if self.registry.read().servers.contains_key(server_name) {
            tracing::debug!(server = %server_name, "already connected, skipping");
            return Ok(());
        }

        let transport = Arc::new(StdioTransport::spawn(
            server_name,
            command,
            args,
            env,
            &self.env,
            &self.project_root,
        )?);

        let init_params = serde_json::to_value(InitializeParams::current())
            .map_err(|e| ConnectError::Handshake(format!("serializing initialize params: {e}")))?;
        let resp = transport
            .request("initialize", Some(init_params), HANDSHAKE_TIMEOUT)
            .await
            .map_err(|e| ConnectError::Handshake(format!("initialize: {e}")))?;
        resp.into_result()
            .map_err(|e| ConnectError::Handshake(format!("initialize: {e}")))?;

        transport
            .notify("notifications/initialized")
            .await
            .map_err(|e| ConnectError::Handshake(format!("initialized notification: {e}")))?;

        let tools_resp = transport
            .request("list_tools", None, HANDSHAKE_TIMEOUT)
            .await
            .map_err(|e| ConnectError::Handshake(format!("list_tools: {e}")))?;
        let tools_value = tools_resp
            .into_result()
            .map_err(|e| ConnectError::Handshake(format!("list_tools: {e}")))?;
        let listed: ListToolsResult = serde_json::from_value(tools_value)
            .map_err(|e| ConnectError::Handshake(format!("parsing list_tools result: {e}")))?;

        self.registry
            .write()
            .servers
            .insert(server_name.to_string(), transport);
        let registered = self.register_discovered(server_name, listed.tools);
        tracing::info!(server = %server_name, tools = registered, "tool server connected");

        self.fire_reindex();
        Ok(())
    }

    /// Connect every configured server, logging and skipping failures.
    pub async fn connect_configured(&self, servers: &[ToolServerConfig]) {
        for server in servers {
            if let Err(e) = self
                .connect(&server.name, &server.command, &server.args, &server.env)
                .await
            {
                tracing::warn!(server = %server.name, error = %e, "tool server failed, skipping");
            }
        }
    }

    /// Spawn the Gmail and Calendar servers, but only when the persisted
    /// OAuth token file exists. The token path is injected into each
    /// server's environment.
    pub async fn connect_google_servers(
        &self,
        token_file: &Path,
        servers: &[ToolServerConfig],
    ) {
        if !token_file.exists() {
            tracing::info!(
                token_file = %token_file.display(),
                "no Google token file, skipping Google tool servers"
            );
            return;
        }
        for server in servers {
            let mut env = server.env.clone();
            env.insert(
                "GOOGLE_TOKEN_FILE".into(),
                token_file.display().to_string(),
            );
            if let Err(e) = self
                .connect(&server.name, &server.command, &server.args, &env)
                .await
            {
                tracing::warn!(server = %server.name, error = %e, "Google server failed, skipping");
            }
        }
    }

    /// Terminate the channel, then drop the server and every tool it owns.
    pub async fn disconnect(&self, server_name: &str) {
        let transport = self.registry.write().servers.remove(server_name);
        match transport {
            Some(transport) => {
                transport.shutdown().await;
                tracing::info!(server = %server_name, "tool server disconnected");
            }
            None => {
                tracing::debug!(server = %server_name, "disconnect: not connected");
            }
        }
        self.unregister_server(server_name);
        self.fire_reindex();
    }

    /// Disconnect every server.
    pub async fn cleanup(&self) {
        let names: Vec<String> = self.registry.read().servers.keys().cloned().collect();
        for name in names {
            self.disconnect(&name).await;
        }
    }

    // ── Invocation ────────────────────────────────────────────────

    /// Route a tool call to the owning server. Never fails: timeouts,
    /// channel errors, and unknown names all come back as readable
    /// strings the model can act on.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> String {
        let transport = {
            let registry = self.registry.read();
            let Some(tool) = registry.tools.iter().find(|t| t.spec.name == name) else {
                return format!("Error: Unknown tool '{name}'");
            };
            match registry.servers.get(&tool.server) {
                Some(transport) => transport.clone(),
                None => return format!("Error: Unknown tool '{name}'"),
            }
        };

        let params = serde_json::json!({ "name": name, "arguments": arguments });
        match transport
            .request("call_tool", Some(params), CALL_TOOL_TIMEOUT)
            .await
        {
            Ok(resp) => match resp.into_result() {
                Ok(value) => match serde_json::from_value::<CallToolResult>(value) {
                    Ok(result) => result.joined_text(),
                    Err(e) => format!("Error: malformed tool result: {e}"),
                },
                Err(e) => format!("Error: {e}"),
            },
            Err(TransportError::Timeout) => {
                format!("Error: tool '{name}' timed out after {}s", CALL_TOOL_TIMEOUT.as_secs())
            }
            Err(e) => format!("Error: {e}"),
        }
    }

    // ── Tool views ────────────────────────────────────────────────

    /// Snapshot of the canonical tool list.
    pub fn tools(&self) -> Vec<ToolSpec> {
        self.registry
            .read()
            .tools
            .iter()
            .map(|t| t.spec.clone())
            .collect()
    }

    /// Name of the server that owns `tool`.
    pub fn owner_of(&self, tool: &str) -> Option<String> {
        self.registry
            .read()
            .tools
            .iter()
            .find(|t| t.spec.name == tool)
            .map(|t| t.server.clone())
    }

    pub fn has_tools(&self) -> bool {
        !self.registry.read().tools.is_empty()
    }

    pub fn server_count(&self) -> usize {
        self.registry.read().servers.len()
    }

    /// Ollama projection: `{type: function, function: {…}}`.
    pub fn ollama_tools(&self) -> Vec<Value> {
        self.tools()
            .into_iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.json_schema,
                    }
                })
            })
            .collect()
    }

    /// Anthropic projection: `{name, description, input_schema}`.
    pub fn anthropic_tools(&self) -> Vec<Value> {
        self.tools()
            .into_iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.json_schema,
                })
            })
            .collect()
    }

    /// OpenAI projection: like Ollama, with schema keys OpenAI rejects
    /// stripped.
    pub fn openai_tools(&self) -> Vec<Value> {
        self.tools()
            .into_iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": strip_unsupported_keys(t.json_schema),
                    }
                })
            })
            .collect()
    }

    /// Gemini projection: bare function declarations, schema stripped.
    pub fn gemini_tools(&self) -> Vec<Value> {
        self.tools()
            .into_iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": strip_unsupported_keys(t.json_schema),
                })
            })
            .collect()
    }

    // ── Registry internals ────────────────────────────────────────

    /// Register discovered tools under the unique-name invariant.
    /// Returns how many were accepted.
    fn register_discovered(&self, server: &str, defs: Vec<ServerToolDef>) -> usize {
        let mut registry = self.registry.write();
        let mut accepted = 0usize;
        for def in defs {
            let spec = def.into_spec();
            if registry.tools.iter().any(|t| t.spec.name == spec.name) {
                tracing::warn!(
                    server = %server,
                    tool = %spec.name,
                    "duplicate tool name rejected, first registration wins"
                );
                continue;
            }
            tracing::debug!(server = %server, tool = %spec.name, "registered tool");
            registry.tools.push(RegisteredTool {
                spec,
                server: server.to_string(),
            });
            accepted += 1;
        }
        accepted
    }

    fn unregister_server(&self, server: &str) {
        self.registry.write().tools.retain(|t| t.server != server);
    }

    fn fire_reindex(&self) {
        let snapshot = self.tools();
        if let Some(hook) = self.reindex_hook.read().as_ref() {
            hook(snapshot);
        }
    }
}

/// Remove JSON Schema keys some providers reject.
fn strip_unsupported_keys(schema: Value) -> Value {
    match schema {
        Value::Object(mut map) => {
            map.remove("additionalProperties");
            Value::Object(map)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::empty_object_schema;

    fn manager() -> ToolServerManager {
        ToolServerManager::new(
            StartupEnv::from_parts("/usr/bin", Vec::<(String, String)>::new()),
            PathBuf::from("."),
        )
    }

    fn def(name: &str, description: &str) -> ServerToolDef {
        ServerToolDef {
            name: name.into(),
            description: description.into(),
            input_schema: empty_object_schema(),
        }
    }

    #[test]
    fn duplicate_tool_names_are_rejected() {
        let m = manager();
        assert_eq!(m.register_discovered("alpha", vec![def("add", "adds")]), 1);
        assert_eq!(m.register_discovered("beta", vec![def("add", "also adds")]), 0);
        assert_eq!(m.owner_of("add").as_deref(), Some("alpha"));
        assert_eq!(m.tools().len(), 1);
    }

    #[test]
    fn unregister_removes_only_that_servers_tools() {
        let m = manager();
        m.register_discovered("alpha", vec![def("add", ""), def("sub", "")]);
        m.register_discovered("beta", vec![def("mul", "")]);

        m.unregister_server("alpha");
        let names: Vec<String> = m.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["mul"]);
        assert!(m.owner_of("add").is_none());
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_string() {
        let m = manager();
        let result = m.call_tool("nope", serde_json::json!({})).await;
        assert_eq!(result, "Error: Unknown tool 'nope'");
    }

    #[test]
    fn reindex_hook_fires_with_snapshot() {
        let m = manager();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<usize>::new()));
        let seen_clone = seen.clone();
        m.set_reindex_hook(Box::new(move |tools| {
            seen_clone.lock().push(tools.len());
        }));
        m.register_discovered("alpha", vec![def("add", "")]);
        m.fire_reindex();
        m.unregister_server("alpha");
        m.fire_reindex();
        assert_eq!(*seen.lock(), vec![1, 0]);
    }

    #[test]
    fn openai_projection_strips_additional_properties() {
        let m = manager();
        m.register_discovered(
            "alpha",
            vec![ServerToolDef {
                name: "read_file".into(),
                description: "Read a file".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "additionalProperties": false
                }),
            }],
        );

        let openai = m.openai_tools();
        assert!(openai[0]["function"]["parameters"]
            .get("additionalProperties")
            .is_none());

        // The Anthropic projection keeps the schema verbatim.
        let anthropic = m.anthropic_tools();
        assert!(anthropic[0]["input_schema"]
            .get("additionalProperties")
            .is_some());
    }

    #[test]
    fn ollama_projection_shape() {
        let m = manager();
        m.register_discovered("alpha", vec![def("add", "adds numbers")]);
        let tools = m.ollama_tools();
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "add");
        assert_eq!(tools[0]["function"]["description"], "adds numbers");
    }
}
