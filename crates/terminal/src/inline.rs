//! Inline tools — answered in-process, no subprocess round trip.

use std::time::Duration;

use futures_util::future::join_all;

/// `find_files` stops reporting after this many matches.
const MAX_FIND_RESULTS: usize = 200;

/// Per-probe budget for version lookups.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const PROBED_TOOLS: &[&str] = &[
    "python3", "node", "npm", "git", "pip", "uv", "cargo", "docker",
];

/// OS, shell, cwd, and common tool versions.
pub async fn get_environment() -> String {
    let probes = PROBED_TOOLS.iter().map(|name| async move {
        let version = probe_version(name).await?;
        Some((*name, version))
    });
    let mut found: Vec<(&str, String)> = join_all(probes).await.into_iter().flatten().collect();
    found.sort_by_key(|(name, _)| *name);

    let tools = if found.is_empty() {
        "  (no common tools detected)".to_string()
    } else {
        found
            .iter()
            .map(|(name, version)| format!("  {name}: {version}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let shell = if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".into())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into())
    };
    let cwd = std::env::current_dir()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|_| "(unknown)".into());

    format!(
        "OS: {} {}\nShell: {}\nCWD: {}\nAvailable tools:\n{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        shell,
        cwd,
        tools
    )
}

async fn probe_version(name: &str) -> Option<String> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        tokio::process::Command::new(name)
            .arg("--version")
            .stdin(std::process::Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

/// Glob under a directory, capped at [`MAX_FIND_RESULTS`] results.
pub fn find_files(pattern: &str, directory: &str) -> String {
    let dir = if directory.trim().is_empty() {
        match std::env::current_dir() {
            Ok(d) => d,
            Err(e) => return format!("Error searching for files: {e}"),
        }
    } else {
        let p = std::path::PathBuf::from(directory);
        if p.is_absolute() {
            p
        } else {
            match std::env::current_dir() {
                Ok(d) => d.join(p),
                Err(e) => return format!("Error searching for files: {e}"),
            }
        }
    };
    if !dir.is_dir() {
        return format!("Error: Directory does not exist: {}", dir.display());
    }

    let search = dir.join(pattern).display().to_string();
    let matches = match glob::glob(&search) {
        Ok(paths) => paths
            .filter_map(|entry| entry.ok())
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>(),
        Err(e) => return format!("Error searching for files: {e}"),
    };

    if matches.is_empty() {
        return format!("No files found matching '{pattern}' in {}", dir.display());
    }
    if matches.len() > MAX_FIND_RESULTS {
        return format!(
            "Found {} files. Showing first {MAX_FIND_RESULTS}:\n{}",
            matches.len(),
            matches[..MAX_FIND_RESULTS].join("\n")
        );
    }
    format!("Found {} file(s):\n{}", matches.len(), matches.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_files_reports_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::write(dir.path().join("b.txt"), "y").unwrap();
        std::fs::write(dir.path().join("c.log"), "z").unwrap();

        let result = find_files("*.txt", dir.path().to_str().unwrap());
        assert!(result.starts_with("Found 2 file(s):"));
        assert!(result.contains("a.txt"));
        assert!(!result.contains("c.log"));
    }

    #[test]
    fn find_files_missing_directory() {
        let result = find_files("*.rs", "/definitely/not/here");
        assert!(result.starts_with("Error: Directory does not exist"));
    }

    #[test]
    fn find_files_no_matches() {
        let dir = tempfile::tempdir().unwrap();
        let result = find_files("*.zig", dir.path().to_str().unwrap());
        assert!(result.starts_with("No files found matching '*.zig'"));
    }

    #[test]
    fn find_files_caps_results() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(MAX_FIND_RESULTS + 10) {
            std::fs::write(dir.path().join(format!("f{i:03}.txt")), "").unwrap();
        }
        let result = find_files("*.txt", dir.path().to_str().unwrap());
        assert!(result.contains("Showing first 200"));
        assert_eq!(result.lines().count(), MAX_FIND_RESULTS + 1);
    }

    #[tokio::test]
    async fn environment_report_has_the_basics() {
        let report = get_environment().await;
        assert!(report.starts_with("OS: "));
        assert!(report.contains("Shell: "));
        assert!(report.contains("CWD: "));
        assert!(report.contains("Available tools:"));
    }
}
