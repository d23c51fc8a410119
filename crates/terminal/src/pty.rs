//! PTY execution backend.
//!
//! Spawns a command inside a pseudoterminal so interactive CLIs get a
//! real terminal to render into. The blocking PTY read loop runs on the
//! worker pool; chunks are forwarded to the UI raw and buffered
//! ANSI-stripped for the model.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};

use valet_bus::EventBus;
use valet_domain::event::UiEvent;
use valet_domain::sysenv::StartupEnv;

use crate::session::PtySession;

/// Foreground PTY ceiling, seconds.
pub const MAX_PTY_TIMEOUT_SECS: u64 = 120;

/// Background PTY ceiling, seconds.
pub const MAX_BACKGROUND_TIMEOUT_SECS: u64 = 1800;

/// Spawn a PTY session and start its reader. The session is returned
/// alive; completion is observed via [`PtySession::wait_done`].
pub(crate) fn spawn_session(
    bus: Arc<EventBus>,
    env: &StartupEnv,
    session_id: &str,
    request_id: &str,
    command: &str,
    workdir: &Path,
    extra_env: &HashMap<String, String>,
    background: bool,
    size: (u16, u16),
) -> Result<Arc<PtySession>, String> {
    let pty_system = native_pty_system();
    let (cols, rows) = size;
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| format!("Error launching PTY: {e}"))?;

    let mut builder = if cfg!(windows) {
        let mut b = CommandBuilder::new("cmd");
        b.arg("/C");
        b.arg(command);
        b
    } else {
        let mut b = CommandBuilder::new("/bin/sh");
        b.arg("-c");
        b.arg(command);
        b
    };
    builder.cwd(workdir);
    builder.env_clear();
    let extras = extra_env
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .chain([("TERM", "xterm-256color")]);
    for (key, value) in env.child_env(extras) {
        builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| format!("Error launching PTY: {e}"))?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| format!("Error launching PTY: {e}"))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| format!("Error launching PTY: {e}"))?;
    let killer = child.clone_killer();

    let session = PtySession::new(
        session_id.to_string(),
        request_id.to_string(),
        command.to_string(),
        workdir.display().to_string(),
        background,
        pair.master,
        writer,
        killer,
    );

    // Blocking read loop on the worker pool: forward raw chunks, buffer
    // stripped text, then reap the child.
    let reader_session = session.clone();
    let reader_request_id = request_id.to_string();
    let handle = tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    reader_session.append_chunk(&chunk);
                    bus.broadcast(UiEvent::TerminalOutput {
                        request_id: reader_request_id.clone(),
                        text: chunk,
                        stream: true,
                        raw: true,
                    });
                }
            }
        }
        let exit_code = child
            .wait()
            .map(|status| status.exit_code() as i32)
            .unwrap_or(-1);
        if reader_session.is_alive() {
            reader_session.mark_done(exit_code);
        }
        tracing::debug!(
            session_id = %reader_session.session_id,
            exit_code,
            "pty reader finished"
        );
    });
    session.reader.lock().replace(handle);

    Ok(session)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixture() -> (Arc<EventBus>, StartupEnv) {
        (Arc::new(EventBus::new()), StartupEnv::capture())
    }

    #[tokio::test]
    async fn pty_captures_output_and_exit() {
        let (bus, env) = fixture();
        let session = spawn_session(
            bus,
            &env,
            "s1",
            "r1",
            "echo from-a-pty",
            Path::new("/tmp"),
            &HashMap::new(),
            false,
            (80, 24),
        )
        .unwrap();

        assert!(session.wait_done(Duration::from_secs(10)).await);
        assert_eq!(session.exit_code(), Some(0));
        assert!(session.recent_text(50).contains("from-a-pty"));
    }

    #[tokio::test]
    async fn raw_chunks_reach_the_bus() {
        let (bus, env) = fixture();
        let (_id, mut rx) = bus.connect();
        let session = spawn_session(
            bus,
            &env,
            "s1",
            "req-7",
            "echo chunked",
            Path::new("/tmp"),
            &HashMap::new(),
            false,
            (80, 24),
        )
        .unwrap();
        session.wait_done(Duration::from_secs(10)).await;

        let mut saw_raw = false;
        while let Ok(event) = rx.try_recv() {
            if let UiEvent::TerminalOutput { request_id, raw, stream, .. } = event {
                assert_eq!(request_id, "req-7");
                assert!(stream);
                saw_raw |= raw;
            }
        }
        assert!(saw_raw);
    }

    #[tokio::test]
    async fn kill_terminates_a_long_runner() {
        let (bus, env) = fixture();
        let session = spawn_session(
            bus,
            &env,
            "s1",
            "r1",
            "sleep 600",
            Path::new("/tmp"),
            &HashMap::new(),
            true,
            (80, 24),
        )
        .unwrap();

        assert!(!session.wait_done(Duration::from_millis(300)).await);
        assert!(session.is_alive());

        session.kill();
        assert!(session.wait_done(Duration::from_secs(5)).await);
        assert!(!session.is_alive());
        assert_eq!(session.exit_code(), Some(-1));
    }
}
