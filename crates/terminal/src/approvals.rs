//! Remembered command approvals.
//!
//! When the user picks "Allow & Remember", the command's normalized
//! signature is saved so identical commands auto-approve under the
//! `on-miss` ask level. The store is a single JSON file:
//! `{"approvals": [{hash, command_signature, approved_at}]}`.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const APPROVALS_FILE: &str = "exec-approvals.json";

/// Commands where the subcommand matters: the signature keeps two tokens.
const PACKAGE_MANAGERS: &[&str] = &["npm", "npx", "pip", "git", "docker", "cargo", "uv"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApprovalEntry {
    hash: String,
    command_signature: String,
    approved_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ApprovalsFile {
    #[serde(default)]
    approvals: Vec<ApprovalEntry>,
}

/// Normalize a command to its approval signature: the first token, or
/// the first two for package-manager style commands where the
/// subcommand is what the user actually approved.
pub fn normalize_command(command: &str) -> String {
    let mut parts = command.split_whitespace();
    let Some(first) = parts.next() else {
        return command.to_string();
    };
    if PACKAGE_MANAGERS.contains(&first) {
        if let Some(second) = parts.next() {
            return format!("{first} {second}");
        }
    }
    first.to_string()
}

/// First 16 hex chars of the SHA-256 of a signature.
fn signature_hash(signature: &str) -> String {
    let digest = Sha256::digest(signature.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// File-backed approval store. Writers serialize on the internal lock.
pub struct ApprovalHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ApprovalHistory {
    /// Store living at `<user_data_dir>/exec-approvals.json`.
    pub fn new(user_data_dir: &Path) -> Self {
        Self {
            path: user_data_dir.join(APPROVALS_FILE),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> ApprovalsFile {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => ApprovalsFile::default(),
        }
    }

    fn save(&self, data: &ApprovalsFile) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(error = %e, "failed to create approvals directory");
                return;
            }
        }
        match serde_json::to_string_pretty(data) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::warn!(error = %e, "failed to write approvals file");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize approvals"),
        }
    }

    /// Has a command with the same normalized signature been remembered?
    pub fn is_command_approved(&self, command: &str) -> bool {
        let _guard = self.lock.lock();
        let hash = signature_hash(&normalize_command(command));
        self.load().approvals.iter().any(|a| a.hash == hash)
    }

    /// Remember a command's approval. Idempotent per signature.
    pub fn remember_approval(&self, command: &str) {
        let _guard = self.lock.lock();
        let signature = normalize_command(command);
        let hash = signature_hash(&signature);
        let mut data = self.load();
        if data.approvals.iter().any(|a| a.hash == hash) {
            return;
        }
        let approved_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        data.approvals.push(ApprovalEntry {
            hash,
            command_signature: signature,
            approved_at,
        });
        self.save(&data);
    }

    pub fn approval_count(&self) -> usize {
        let _guard = self.lock.lock();
        self.load().approvals.len()
    }

    pub fn clear(&self) {
        let _guard = self.lock.lock();
        self.save(&ApprovalsFile::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ApprovalHistory) {
        let dir = tempfile::tempdir().unwrap();
        let history = ApprovalHistory::new(dir.path());
        (dir, history)
    }

    #[test]
    fn normalization_keeps_package_manager_subcommand() {
        assert_eq!(normalize_command("npm install left-pad"), "npm install");
        assert_eq!(normalize_command("git status"), "git status");
        assert_eq!(normalize_command("python script.py --flag"), "python");
        assert_eq!(normalize_command("ls -la"), "ls");
        assert_eq!(normalize_command("   "), "   ");
    }

    #[test]
    fn remember_then_check_same_signature() {
        let (_dir, history) = store();
        assert!(!history.is_command_approved("npm install"));

        history.remember_approval("npm install");
        assert!(history.is_command_approved("npm install"));
        // Same signature, different arguments.
        assert!(history.is_command_approved("npm install typescript"));
        // Different signature.
        assert!(!history.is_command_approved("npm run build"));
        assert!(!history.is_command_approved("rm -rf /tmp/x"));
    }

    #[test]
    fn remember_is_idempotent() {
        let (_dir, history) = store();
        history.remember_approval("git status");
        history.remember_approval("git status --short");
        assert_eq!(history.approval_count(), 1);
    }

    #[test]
    fn clear_empties_the_store() {
        let (_dir, history) = store();
        history.remember_approval("ls");
        history.remember_approval("cargo build");
        assert_eq!(history.approval_count(), 2);
        history.clear();
        assert_eq!(history.approval_count(), 0);
        assert!(!history.is_command_approved("ls"));
    }

    #[test]
    fn file_shape_matches_contract() {
        let (dir, history) = store();
        history.remember_approval("npm install");
        let raw = std::fs::read_to_string(dir.path().join(APPROVALS_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &value["approvals"][0];
        assert_eq!(entry["command_signature"], "npm install");
        assert_eq!(entry["hash"].as_str().unwrap().len(), 16);
        assert!(entry["approved_at"].as_u64().unwrap() > 0);
    }

    #[test]
    fn corrupt_file_resets_gracefully() {
        let (dir, history) = store();
        std::fs::write(dir.path().join(APPROVALS_FILE), "{not json").unwrap();
        assert!(!history.is_command_approved("ls"));
        history.remember_approval("ls");
        assert!(history.is_command_approved("ls"));
    }
}
