//! Standard (non-PTY) command execution.
//!
//! The command runs via the shell with the frozen startup `PATH`;
//! stderr is merged into stdout, and every line is streamed to the UI
//! as a `terminal_output` event as it arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use valet_bus::EventBus;
use valet_domain::event::UiEvent;
use valet_domain::sysenv::StartupEnv;

/// Hard ceiling for standard execution; caller timeouts are clamped.
pub const MAX_EXEC_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ExecOutcome {
    fn failed(message: String) -> Self {
        Self {
            output: message,
            exit_code: 1,
            duration_ms: 0,
            timed_out: false,
        }
    }
}

/// Resolve a working directory argument: empty → current dir; relative →
/// absolute. `Err` carries a user-facing message when it doesn't exist.
pub fn resolve_workdir(cwd: &str) -> Result<std::path::PathBuf, String> {
    let dir = if cwd.trim().is_empty() {
        std::env::current_dir().map_err(|e| format!("Error: cannot resolve cwd: {e}"))?
    } else {
        let p = std::path::PathBuf::from(cwd);
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir()
                .map_err(|e| format!("Error: cannot resolve cwd: {e}"))?
                .join(p)
        }
    };
    if !dir.is_dir() {
        return Err(format!(
            "Error: Working directory does not exist: {}",
            dir.display()
        ));
    }
    Ok(dir)
}

/// Run a command, streaming each output line over the bus. Blocks until
/// exit, timeout (clamped to [`MAX_EXEC_TIMEOUT_SECS`]), or a kill
/// signal on `kill_rx`.
///
/// `extra_env` must already be screened for PATH injection; `PATH`
/// itself is always pinned to the startup value.
pub async fn run_streamed(
    bus: &Arc<EventBus>,
    env: &StartupEnv,
    request_id: &str,
    command: &str,
    cwd: &str,
    timeout_secs: u64,
    extra_env: &HashMap<String, String>,
    mut kill_rx: mpsc::Receiver<()>,
) -> ExecOutcome {
    let effective_timeout = timeout_secs.clamp(1, MAX_EXEC_TIMEOUT_SECS);

    let workdir = match resolve_workdir(cwd) {
        Ok(dir) => dir,
        Err(message) => return ExecOutcome::failed(message),
    };

    let (shell, flag) = shell_invocation();
    let mut cmd = tokio::process::Command::new(shell);
    cmd.arg(flag)
        .arg(command)
        .current_dir(&workdir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    cmd.env_clear();
    let extras = extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str()));
    for (key, value) in env.child_env(extras) {
        cmd.env(key, value);
    }
    // Own process group, so a timeout can take the whole tree down.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let start = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ExecOutcome::failed(format!("Error executing command: {e}")),
    };

    // Merge stdout and stderr into one line stream.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    drop(line_tx);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(effective_timeout);
    let mut output_lines: Vec<String> = Vec::new();
    let mut timed_out = false;
    let mut killed = false;

    loop {
        tokio::select! {
            maybe_line = line_rx.recv() => match maybe_line {
                Some(line) => {
                    bus.broadcast(UiEvent::TerminalOutput {
                        request_id: request_id.to_string(),
                        text: line.clone(),
                        stream: true,
                        raw: false,
                    });
                    output_lines.push(line);
                }
                // Both pipes closed: the process stopped writing.
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                kill_tree(&mut child).await;
                break;
            }
            _ = kill_rx.recv() => {
                killed = true;
                kill_tree(&mut child).await;
                break;
            }
        }
    }

    let exit_code = match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        Ok(Err(_)) | Err(_) => {
            let _ = child.kill().await;
            -1
        }
    };
    let exit_code = if timed_out || killed { -1 } else { exit_code };

    let duration_ms = start.elapsed().as_millis() as u64;
    let mut output = if output_lines.is_empty() {
        "(no output)".to_string()
    } else {
        output_lines.join("\n")
    };

    if timed_out {
        let notice = format!("Command timed out after {effective_timeout} seconds");
        bus.broadcast(UiEvent::TerminalOutput {
            request_id: request_id.to_string(),
            text: format!("\x1b[31m{notice}\x1b[0m"),
            stream: true,
            raw: false,
        });
        output.push('\n');
        output.push_str(&notice);
    } else if killed {
        bus.broadcast(UiEvent::TerminalOutput {
            request_id: request_id.to_string(),
            text: "\x1b[31m[Process killed by user]\x1b[0m".into(),
            stream: true,
            raw: false,
        });
        output.push_str("\n[Process killed by user]");
    } else if exit_code != 0 {
        output.push_str(&format!("\n[exit code: {exit_code}]"));
    }

    ExecOutcome {
        output,
        exit_code,
        duration_ms,
        timed_out,
    }
}

/// Kill the command and everything it spawned.
async fn kill_tree(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own process group (setsid above).
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
}

fn shell_invocation() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/C")
    } else {
        // Absolute path: the child is spawned with a pinned PATH that
        // may not contain a shell.
        ("/bin/sh", "-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Arc<EventBus>, StartupEnv) {
        (Arc::new(EventBus::new()), StartupEnv::capture())
    }

    fn kill_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
        mpsc::channel(1)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let (bus, env) = fixture();
        let (_tx, rx) = kill_channel();
        let outcome =
            run_streamed(&bus, &env, "r1", "echo one && echo two", "", 30, &HashMap::new(), rx).await;
        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.output, "one\ntwo");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn merges_stderr_and_reports_exit_code() {
        let (bus, env) = fixture();
        let (_tx, rx) = kill_channel();
        let outcome =
            run_streamed(&bus, &env, "r1", "echo oops 1>&2; exit 3", "", 30, &HashMap::new(), rx).await;
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.output.contains("oops"));
        assert!(outcome.output.contains("[exit code: 3]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lines_stream_to_the_bus() {
        let (bus, env) = fixture();
        let (_id, mut rx_events) = bus.connect();
        let (_tx, rx) = kill_channel();
        run_streamed(&bus, &env, "req-9", "echo streamed", "", 30, &HashMap::new(), rx).await;

        let event = rx_events.recv().await.unwrap();
        match event {
            UiEvent::TerminalOutput { request_id, text, stream, raw } => {
                assert_eq!(request_id, "req-9");
                assert_eq!(text, "streamed");
                assert!(stream);
                assert!(!raw);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_and_flags() {
        let (bus, env) = fixture();
        let (_tx, rx) = kill_channel();
        let outcome = run_streamed(&bus, &env, "r1", "sleep 30", "", 1, &HashMap::new(), rx).await;
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.output.contains("timed out after 1 seconds"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_signal_stops_the_command() {
        let (bus, env) = fixture();
        let (tx, rx) = kill_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(()).await;
        });
        let outcome = run_streamed(&bus, &env, "r1", "sleep 30", "", 60, &HashMap::new(), rx).await;
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.output.contains("[Process killed by user]"));
    }

    #[tokio::test]
    async fn missing_workdir_fails_without_spawning() {
        let (bus, env) = fixture();
        let (_tx, rx) = kill_channel();
        let outcome =
            run_streamed(&bus, &env, "r1", "echo hi", "/definitely/not/a/dir", 30, &HashMap::new(), rx).await;
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.output.contains("Working directory does not exist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_sees_frozen_path() {
        let (bus, _ignored) = fixture();
        let env = StartupEnv::from_parts("/frozen/bin", [("PATH".into(), "/other".into())]);
        let (_tx, rx) = kill_channel();
        let outcome = run_streamed(&bus, &env, "r1", "echo $PATH", "", 30, &HashMap::new(), rx).await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output, "/frozen/bin");
    }
}
