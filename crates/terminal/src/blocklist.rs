//! OS path blocklist and dangerous-pattern checks.
//!
//! Commands touching protected OS paths or matching a destructive
//! pattern are rejected in the core, before anything is spawned. The
//! list is hardcoded and always on.

use std::sync::OnceLock;

use regex::Regex;

fn protected_paths() -> &'static Vec<String> {
    static PATHS: OnceLock<Vec<String>> = OnceLock::new();
    PATHS.get_or_init(|| {
        let mut paths: Vec<String>;
        if cfg!(windows) {
            paths = vec![
                r"c:\windows\system32".into(),
                r"c:\windows\syswow64".into(),
                r"c:\windows\boot".into(),
                r"c:\pagefile.sys".into(),
                r"c:\hiberfil.sys".into(),
            ];
            if let Ok(profile) = std::env::var("USERPROFILE") {
                paths.push(format!(r"{}\ntuser.dat", profile.to_lowercase()));
            }
        } else {
            paths = vec![
                "/etc/passwd".into(),
                "/etc/shadow".into(),
                "/etc/sudoers".into(),
                "/boot".into(),
                "/proc/sys".into(),
                "/dev/sd".into(),
            ];
            if let Ok(home) = std::env::var("HOME") {
                paths.push(format!("{home}/.ssh"));
                paths.push(format!("{home}/.aws/credentials"));
                paths.push(format!("{home}/.gnupg"));
            }
            if cfg!(target_os = "macos") {
                paths.push("/System".into());
                paths.push("/private/etc".into());
            }
        }
        paths
    })
}

fn dangerous_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Format/destroy disks
            r"(?i)\bformat\s+[a-zA-Z]:",
            r"(?i)\bmkfs\b",
            r"(?i)\bdd\s+.*of=/dev/",
            // Registry destruction
            r"(?i)\breg\s+delete\s+.*HKLM",
            r"(?i)\breg\s+delete\s+.*HKCU",
            // Remove system trees
            r"(?i)\brm\s+-rf\s+/\s*$",
            r"(?i)\brd\s+/s\s+/q\s+[Cc]:\\Windows",
            r"(?i)\bdel\s+/[fFsS]\s+[Cc]:\\Windows",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("blocklist pattern must compile"))
        .collect()
    })
}

/// Check a command against the path blocklist and dangerous patterns.
/// Returns `Some(reason)` when the command must not run.
pub fn check_blocklist(command: &str) -> Option<String> {
    let haystack = if cfg!(windows) {
        command.to_lowercase()
    } else {
        command.to_string()
    };

    for path in protected_paths() {
        if haystack.contains(path.as_str()) {
            return Some(format!("Command touches protected OS path: {path}"));
        }
    }
    for pattern in dangerous_patterns() {
        if pattern.is_match(command) {
            return Some(format!(
                "Command matches dangerous pattern: {}",
                pattern.as_str()
            ));
        }
    }
    None
}

/// Reject any tool-supplied environment that tries to override `PATH`
/// in any case variant.
pub fn check_path_injection<'a>(
    env: impl IntoIterator<Item = &'a String>,
) -> Option<String> {
    for key in env {
        if key.eq_ignore_ascii_case("path") {
            return Some("PATH override rejected — cannot modify system PATH".into());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dangerous_patterns_block() {
        assert!(check_blocklist("mkfs.ext4 /dev/sda1").is_some());
        assert!(check_blocklist("dd if=/dev/zero of=/dev/sda").is_some());
        assert!(check_blocklist("rm -rf /").is_some());
        assert!(check_blocklist("format c:").is_some());
        assert!(check_blocklist("reg delete /f HKLM\\Software").is_some());
    }

    #[test]
    fn benign_commands_pass() {
        assert!(check_blocklist("ls -la").is_none());
        assert!(check_blocklist("rm -rf /tmp/scratch").is_none());
        assert!(check_blocklist("cargo build --release").is_none());
        assert!(check_blocklist("echo formatting done").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn protected_paths_block() {
        assert!(check_blocklist("cat /etc/shadow").is_some());
        if let Ok(home) = std::env::var("HOME") {
            assert!(check_blocklist(&format!("cat {home}/.ssh/id_rsa")).is_some());
        }
    }

    #[test]
    fn path_injection_rejected_case_insensitively() {
        for key in ["PATH", "Path", "path", "pAtH"] {
            let env = vec![key.to_string()];
            assert!(check_path_injection(env.iter()).is_some(), "{key}");
        }
        let benign = vec!["FOO".to_string(), "CLASSPATH_EXTRA".to_string()];
        assert!(check_path_injection(benign.iter()).is_none());
    }
}
