//! A long-lived pseudoterminal session.
//!
//! Raw output (ANSI intact) streams to the UI; an ANSI-stripped copy is
//! buffered for the model. The session outlives its originating
//! `run_command` when launched in background mode and is addressed by
//! `session_id` for `send_input` / `read_output` / `kill_process`.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use portable_pty::{ChildKiller, MasterPty, PtySize};
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Raw UI ring buffer cap, in bytes. Oldest output is trimmed.
const RAW_BUFFER_CAP: usize = 512 * 1024;

/// Text buffer cap for model consumption, in bytes.
const TEXT_BUFFER_CAP: usize = 256 * 1024;

fn ansi_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07]*\x07|\x1b[()][AB012]|\x1b[=>]|\r",
        )
        .expect("ANSI pattern must compile")
    })
}

/// Strip ANSI escape codes (and carriage returns) from PTY output.
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

pub struct PtySession {
    pub session_id: String,
    pub request_id: String,
    pub command: String,
    pub cwd: String,
    pub background: bool,

    /// Raw chunks, ANSI intact, trimmed to a ring for the UI.
    raw_buffer: Mutex<String>,
    /// ANSI-stripped text for the model.
    text_buffer: Mutex<String>,

    pub(crate) master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    pub(crate) writer: Mutex<Option<Box<dyn Write + Send>>>,
    pub(crate) killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pub(crate) reader: Mutex<Option<JoinHandle<()>>>,

    started: Instant,
    alive: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    done_tx: watch::Sender<bool>,
}

impl PtySession {
    pub(crate) fn new(
        session_id: String,
        request_id: String,
        command: String,
        cwd: String,
        background: bool,
        master: Box<dyn MasterPty + Send>,
        writer: Box<dyn Write + Send>,
        killer: Box<dyn ChildKiller + Send + Sync>,
    ) -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            session_id,
            request_id,
            command,
            cwd,
            background,
            raw_buffer: Mutex::new(String::new()),
            text_buffer: Mutex::new(String::new()),
            master: Mutex::new(Some(master)),
            writer: Mutex::new(Some(writer)),
            killer: Mutex::new(killer),
            reader: Mutex::new(None),
            started: Instant::now(),
            alive: AtomicBool::new(true),
            exit_code: Mutex::new(None),
            done_tx,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn duration_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Append one raw chunk to both buffers.
    pub(crate) fn append_chunk(&self, raw: &str) {
        {
            let mut buffer = self.raw_buffer.lock();
            buffer.push_str(raw);
            trim_front(&mut buffer, RAW_BUFFER_CAP);
        }
        {
            let mut buffer = self.text_buffer.lock();
            buffer.push_str(&strip_ansi(raw));
            trim_front(&mut buffer, TEXT_BUFFER_CAP);
        }
    }

    /// Last `lines` lines of the ANSI-stripped buffer.
    pub fn recent_text(&self, lines: usize) -> String {
        let buffer = self.text_buffer.lock();
        let all: Vec<&str> = buffer.split('\n').collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    /// Mark the process finished and wake all waiters.
    pub(crate) fn mark_done(&self, exit_code: i32) {
        *self.exit_code.lock() = Some(exit_code);
        self.alive.store(false, Ordering::Release);
        let _ = self.done_tx.send(true);
    }

    /// Wait for the process to finish, up to `timeout`.
    /// Returns true when it finished.
    pub async fn wait_done(&self, timeout: Duration) -> bool {
        let mut rx = self.done_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        let result = tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .is_ok();
        result
    }

    /// Write bytes to the PTY on the worker pool.
    pub(crate) async fn write_input(self: &Arc<Self>, bytes: Vec<u8>) -> std::io::Result<()> {
        let session = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = session.writer.lock();
            match writer.as_mut() {
                Some(w) => {
                    w.write_all(&bytes)?;
                    w.flush()
                }
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "session writer closed",
                )),
            }
        })
        .await
        .unwrap_or_else(|e| {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("writer task failed: {e}"),
            ))
        })
    }

    /// Resize the PTY to the frontend's viewport.
    pub fn resize(&self, cols: u16, rows: u16) {
        if let Some(master) = self.master.lock().as_ref() {
            let _ = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
        }
    }

    /// Terminate the child and abort the reader forwarder. Safe to call
    /// more than once.
    pub(crate) fn kill(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if self.is_alive() {
            if let Err(e) = self.killer.lock().kill() {
                tracing::debug!(session_id = %self.session_id, error = %e, "pty kill failed");
            }
            self.mark_done(-1);
        }
        // Dropping the master closes the PTY and unblocks the reader.
        *self.master.lock() = None;
        *self.writer.lock() = None;
    }
}

fn trim_front(buffer: &mut String, cap: usize) {
    if buffer.len() > cap {
        let mut cut = buffer.len() - cap;
        while cut < buffer.len() && !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
    }
}
