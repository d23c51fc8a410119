//! Valet configuration, loaded from a TOML file with serde defaults so a
//! missing file or empty table still yields a runnable config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::CaptureMode;

/// How the terminal subsystem prompts for command approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AskLevel {
    /// Every command prompts.
    #[serde(rename = "always")]
    Always,
    /// Prompt only for commands whose signature is not remembered.
    #[serde(rename = "on-miss")]
    OnMiss,
    /// Never prompt.
    #[serde(rename = "off")]
    Off,
}

impl AskLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "always" => Some(Self::Always),
            "on-miss" => Some(Self::OnMiss),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnMiss => "on-miss",
            Self::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins for the REST surface.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8765,
            cors_origins: vec!["http://localhost:5173".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Initial ask level; mutable at runtime via the REST surface.
    pub ask_level: AskLevel,
    /// Directory holding `exec-approvals.json` and other user data.
    pub user_data_dir: PathBuf,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            ask_level: AskLevel::OnMiss,
            user_data_dir: PathBuf::from("user_data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    /// Number of semantic matches to include alongside always-on tools.
    pub top_k: usize,
    /// Tool names the retriever always includes.
    pub always_on: Vec<String>,
    /// Base URL of the local embedding service.
    pub embed_base_url: String,
    /// Embedding models accepted from the local service, by substring.
    pub model_allowlist: Vec<String>,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            always_on: Vec::new(),
            embed_base_url: "http://127.0.0.1:11434".into(),
            model_allowlist: vec![
                "nomic-embed-text".into(),
                "all-minilm".into(),
                "mxbai-embed-large".into(),
            ],
        }
    }
}

/// One subprocess tool server to launch at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Google tool servers, spawned only when the OAuth token file exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    /// Overrides the `GOOGLE_TOKEN_FILE` environment variable.
    pub token_file: Option<PathBuf>,
    pub gmail: Option<ToolServerConfig>,
    pub calendar: Option<ToolServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub terminal: TerminalConfig,
    pub retriever: RetrieverConfig,
    pub google: GoogleConfig,
    /// Tool servers connected at startup.
    #[serde(rename = "tool_server")]
    pub tool_servers: Vec<ToolServerConfig>,
    /// Initial screenshot capture mode.
    pub capture_mode: CaptureMode,
    /// Model used when the client does not pick one.
    pub default_model: String,
    /// Project root injected into each tool server's module search path.
    pub project_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            terminal: TerminalConfig::default(),
            retriever: RetrieverConfig::default(),
            google: GoogleConfig::default(),
            tool_servers: Vec::new(),
            capture_mode: CaptureMode::Fullscreen,
            default_model: "qwen3:8b".into(),
            project_root: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Resolved Google token file: config override, else `GOOGLE_TOKEN_FILE`.
    pub fn google_token_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.google.token_file {
            return Some(path.clone());
        }
        std::env::var_os("GOOGLE_TOKEN_FILE").map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let config = Config::default();
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.retriever.top_k, 5);
        assert_eq!(config.terminal.ask_level, AskLevel::OnMiss);
        assert!(config.tool_servers.is_empty());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn parses_partial_toml() {
        let raw = r#"
            default_model = "anthropic/claude-sonnet-4"

            [server]
            port = 9000

            [retriever]
            top_k = 2
            always_on = ["list_directory"]

            [[tool_server]]
            name = "demo"
            command = "python3"
            args = ["servers/demo.py"]
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1"); // default preserved
        assert_eq!(config.retriever.top_k, 2);
        assert_eq!(config.retriever.always_on, vec!["list_directory"]);
        assert_eq!(config.tool_servers.len(), 1);
        assert_eq!(config.tool_servers[0].name, "demo");
        assert_eq!(config.default_model, "anthropic/claude-sonnet-4");
    }

    #[test]
    fn ask_level_round_trip() {
        for level in ["always", "on-miss", "off"] {
            let parsed = AskLevel::parse(level).unwrap();
            assert_eq!(parsed.as_str(), level);
        }
        assert!(AskLevel::parse("sometimes").is_none());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valet.toml");
        std::fs::write(&path, "[server]\nport = 4321\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 4321);
    }
}
