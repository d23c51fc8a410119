//! Skills: behavioral guidance blocks injected into the system prompt.
//!
//! A skill is forced with a slash command (`/terminal …`) or
//! auto-injected when most retrieved tools come from its server.

use std::collections::HashMap;

use valet_domain::tool::ToolSpec;

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub display_name: String,
    pub slash_command: String,
    pub content: String,
    pub enabled: bool,
}

impl Skill {
    fn new(name: &str, display_name: &str, content: &str) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            slash_command: name.into(),
            content: content.into(),
            enabled: true,
        }
    }
}

/// Built-in skills, keyed by tool-server name.
pub fn default_skills() -> Vec<Skill> {
    vec![
        Skill::new(
            "terminal",
            "Terminal",
            "## Terminal Skill\n\n\
             - Call get_environment first on a new task to learn the OS, shell, and available tools.\n\
             - For multi-step tasks (3+ commands), call request_session_mode before starting.\n\
             - Prefer find_files over run_command for file discovery; it never prompts.\n\
             - After a command fails, read the full output and exit code before retrying.\n\
             - Use pty=true with background=true for interactive TUI tools, then send_input / read_output.\n\
             - Call kill_process when done with a PTY session; do not leave sessions open.\n\
             - Do not attempt to override PATH or touch OS system directories; such commands are rejected.",
        ),
        Skill::new(
            "filesystem",
            "File System",
            "## File System Skill\n\n\
             - List directory contents before reading or writing to understand the structure.\n\
             - Read a file fully before making targeted edits.\n\
             - Preserve the original encoding and line endings when writing.\n\
             - Never overwrite user-generated files without clear intent.",
        ),
        Skill::new(
            "websearch",
            "Web Search",
            "## Web Search Skill\n\n\
             - Start broad, then narrow with follow-up queries when results are thin.\n\
             - Prefer primary sources and quote exact figures with their origin.\n\
             - Summarize across results instead of trusting one page.",
        ),
    ]
}

pub struct SkillSet {
    skills: Vec<Skill>,
}

impl SkillSet {
    pub fn new(skills: Vec<Skill>) -> Self {
        Self { skills }
    }

    pub fn builtin() -> Self {
        Self::new(default_skills())
    }

    pub fn by_name(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.name == name && s.enabled)
    }

    fn by_slash(&self, command: &str) -> Option<&Skill> {
        self.skills
            .iter()
            .find(|s| s.slash_command == command && s.enabled)
    }
}

/// Parse leading slash commands out of a query. Returns the forced
/// skills and the cleaned query for the model.
pub fn parse_slash_commands(text: &str, skills: &SkillSet) -> (Vec<Skill>, String) {
    let mut forced = Vec::new();
    let mut rest = text.trim_start();

    while let Some(token) = rest.split_whitespace().next() {
        let Some(command) = token.strip_prefix('/') else {
            break;
        };
        let Some(skill) = skills.by_slash(command) else {
            break;
        };
        if !forced.iter().any(|s: &Skill| s.name == skill.name) {
            forced.push(skill.clone());
        }
        rest = rest[token.len()..].trim_start();
    }

    (forced, rest.to_string())
}

/// forced skills + at most one auto-detected skill for the dominant
/// server among the retrieved tools.
pub fn skills_to_inject(
    retrieved: &[ToolSpec],
    owner_of: impl Fn(&str) -> Option<String>,
    forced: &[Skill],
    skills: &SkillSet,
) -> Vec<Skill> {
    let mut result: Vec<Skill> = forced.to_vec();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for tool in retrieved {
        if let Some(server) = owner_of(&tool.name) {
            *counts.entry(server).or_default() += 1;
        }
    }
    let dominant = counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(server, _)| server);

    if let Some(server) = dominant {
        if !result.iter().any(|s| s.name == server) {
            if let Some(skill) = skills.by_name(&server) {
                result.push(skill.clone());
            }
        }
    }
    result
}

/// Format skills into a system prompt block. Empty for no skills.
pub fn build_skills_block(skills: &[Skill]) -> String {
    if skills.is_empty() {
        return String::new();
    }
    let blocks: Vec<&str> = skills.iter().map(|s| s.content.trim()).collect();
    format!("\n\n## Active Skills\n\n{}\n", blocks.join("\n\n---\n\n"))
}

/// Assemble the system prompt for a turn.
pub fn build_system_prompt(skills_block: &str) -> String {
    format!(
        "You are Valet, a desktop assistant with access to local tools. \
         Answer directly and concisely. When a tool is available for the \
         task, call it instead of guessing; read tool results before \
         answering. Never invent file contents or command output.{skills_block}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: String::new(),
            json_schema: serde_json::json!({}),
        }
    }

    #[test]
    fn slash_parsing_extracts_known_skills() {
        let skills = SkillSet::builtin();
        let (forced, cleaned) = parse_slash_commands("/terminal check disk usage", &skills);
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].name, "terminal");
        assert_eq!(cleaned, "check disk usage");
    }

    #[test]
    fn multiple_slash_commands_deduplicate() {
        let skills = SkillSet::builtin();
        let (forced, cleaned) =
            parse_slash_commands("/terminal /filesystem /terminal tidy up", &skills);
        let names: Vec<&str> = forced.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["terminal", "filesystem"]);
        assert_eq!(cleaned, "tidy up");
    }

    #[test]
    fn unknown_slash_token_stays_in_query() {
        let skills = SkillSet::builtin();
        let (forced, cleaned) = parse_slash_commands("/frobnicate the widget", &skills);
        assert!(forced.is_empty());
        assert_eq!(cleaned, "/frobnicate the widget");
    }

    #[test]
    fn dominant_server_skill_auto_injects() {
        let skills = SkillSet::builtin();
        let retrieved = vec![tool("run_command"), tool("send_input"), tool("read_file")];
        let owner = |name: &str| match name {
            "run_command" | "send_input" => Some("terminal".to_string()),
            "read_file" => Some("filesystem".to_string()),
            _ => None,
        };
        let injected = skills_to_inject(&retrieved, owner, &[], &skills);
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].name, "terminal");
    }

    #[test]
    fn forced_skill_not_duplicated_by_auto_detection() {
        let skills = SkillSet::builtin();
        let forced = vec![skills.by_name("terminal").unwrap().clone()];
        let retrieved = vec![tool("run_command")];
        let owner = |_: &str| Some("terminal".to_string());
        let injected = skills_to_inject(&retrieved, owner, &forced, &skills);
        assert_eq!(injected.len(), 1);
    }

    #[test]
    fn skills_block_formatting() {
        assert_eq!(build_skills_block(&[]), "");
        let skills = SkillSet::builtin();
        let block = build_skills_block(&[skills.by_name("terminal").unwrap().clone()]);
        assert!(block.contains("## Active Skills"));
        assert!(block.contains("Terminal Skill"));
        assert!(build_system_prompt(&block).contains("Terminal Skill"));
    }
}
