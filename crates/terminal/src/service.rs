//! Terminal service: approval rendezvous, ask levels, session mode,
//! command execution (standard and PTY), PTY session registry, and the
//! global cancel sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use valet_bus::EventBus;
use valet_domain::config::AskLevel;
use valet_domain::event::UiEvent;
use valet_domain::sysenv::StartupEnv;

use crate::approvals::ApprovalHistory;
use crate::blocklist;
use crate::events::{DeferredEvents, TerminalEvent, TerminalEventSink};
use crate::exec::{self, ExecOutcome};
use crate::pty;
use crate::session::PtySession;

/// How long an approval or session request waits for the user.
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);

/// A command running longer than this triggers one running notice.
const RUNNING_NOTICE_AFTER: Duration = Duration::from_secs(10);

pub const DEFAULT_YIELD_MS: u64 = 10_000;

struct ApprovalReply {
    approved: bool,
    remember: bool,
}

struct PendingApproval {
    respond: oneshot::Sender<ApprovalReply>,
}

struct PendingSession {
    request_id: String,
    respond: oneshot::Sender<bool>,
}

struct RunningCommand {
    command: String,
    started: Instant,
    notice: JoinHandle<()>,
}

/// Arguments of one `run_command` invocation.
#[derive(Debug, Clone)]
pub struct RunCommandRequest {
    pub command: String,
    pub cwd: String,
    pub timeout_secs: u64,
    pub pty: bool,
    pub background: bool,
    pub yield_ms: u64,
    /// Extra environment for the command. `PATH` overrides (any case
    /// variant) are rejected before execution.
    pub env: HashMap<String, String>,
}

pub struct TerminalService {
    bus: Arc<EventBus>,
    env: StartupEnv,
    approvals: ApprovalHistory,
    sink: Arc<dyn TerminalEventSink>,

    ask_level: RwLock<AskLevel>,
    session_mode: AtomicBool,

    pending_approvals: Mutex<HashMap<String, PendingApproval>>,
    pending_session: Mutex<Option<PendingSession>>,

    running: Mutex<HashMap<String, RunningCommand>>,
    /// Kill channels for in-flight standard executions, by request id.
    active_kills: Mutex<HashMap<String, mpsc::Sender<()>>>,
    sessions: Mutex<HashMap<String, Arc<PtySession>>>,

    /// Latest (cols, rows) published by the frontend.
    last_pty_size: Mutex<(u16, u16)>,

    deferred: DeferredEvents,
}

impl TerminalService {
    pub fn new(
        bus: Arc<EventBus>,
        env: StartupEnv,
        approvals: ApprovalHistory,
        sink: Arc<dyn TerminalEventSink>,
        ask_level: AskLevel,
    ) -> Self {
        Self {
            bus,
            env,
            approvals,
            sink,
            ask_level: RwLock::new(ask_level),
            session_mode: AtomicBool::new(false),
            pending_approvals: Mutex::new(HashMap::new()),
            pending_session: Mutex::new(None),
            running: Mutex::new(HashMap::new()),
            active_kills: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            last_pty_size: Mutex::new((120, 24)),
            deferred: DeferredEvents::default(),
        }
    }

    // ── Settings ──────────────────────────────────────────────────

    pub fn ask_level(&self) -> AskLevel {
        *self.ask_level.read()
    }

    pub fn set_ask_level(&self, level: AskLevel) {
        *self.ask_level.write() = level;
    }

    pub fn session_mode(&self) -> bool {
        self.session_mode.load(Ordering::Acquire)
    }

    pub fn approvals(&self) -> &ApprovalHistory {
        &self.approvals
    }

    // ── Approval rendezvous ───────────────────────────────────────

    /// Check whether a command may run, blocking on the user when the
    /// ask level demands it. Returns `(approved, request_id)`; the id
    /// also tracks the execution that follows.
    pub async fn check_approval(&self, command: &str, cwd: &str) -> (bool, String) {
        let request_id = Uuid::new_v4().to_string();

        if self.session_mode() || self.ask_level() == AskLevel::Off {
            return (true, request_id);
        }
        if self.ask_level() == AskLevel::OnMiss && self.approvals.is_command_approved(command) {
            return (true, request_id);
        }

        let (tx, rx) = oneshot::channel();
        self.pending_approvals
            .lock()
            .insert(request_id.clone(), PendingApproval { respond: tx });
        self.bus.broadcast(UiEvent::TerminalApprovalRequest {
            request_id: request_id.clone(),
            command: command.to_string(),
            cwd: cwd.to_string(),
        });

        let reply = match tokio::time::timeout(APPROVAL_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            // Timeout or a dropped sender both resolve to denied.
            _ => {
                self.pending_approvals.lock().remove(&request_id);
                ApprovalReply {
                    approved: false,
                    remember: false,
                }
            }
        };

        if reply.approved && reply.remember {
            self.approvals.remember_approval(command);
        }
        (reply.approved, request_id)
    }

    /// User's answer to a pending approval request.
    pub fn resolve_approval(&self, request_id: &str, approved: bool, remember: bool) {
        if let Some(pending) = self.pending_approvals.lock().remove(request_id) {
            let _ = pending.respond.send(ApprovalReply { approved, remember });
        }
    }

    // ── Session mode ──────────────────────────────────────────────

    /// Ask the user for session mode. Blocks until answered, the
    /// 120-second deadline, or the cancel sweep.
    pub async fn request_session(&self, reason: &str) -> bool {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        *self.pending_session.lock() = Some(PendingSession {
            request_id: request_id.clone(),
            respond: tx,
        });
        self.bus.broadcast(UiEvent::TerminalSessionRequest {
            request_id,
            reason: reason.to_string(),
        });

        let approved = match tokio::time::timeout(APPROVAL_TIMEOUT, rx).await {
            Ok(Ok(approved)) => approved,
            _ => {
                *self.pending_session.lock() = None;
                false
            }
        };

        if approved {
            self.session_mode.store(true, Ordering::Release);
            self.bus.broadcast(UiEvent::TerminalSessionStarted);
        }
        approved
    }

    pub fn resolve_session(&self, request_id: &str, approved: bool) {
        let mut pending = self.pending_session.lock();
        match pending.take() {
            Some(p) if p.request_id == request_id => {
                let _ = p.respond.send(approved);
            }
            other => {
                // Stale or mismatched id: keep whatever was pending.
                *pending = other;
            }
        }
    }

    pub fn end_session(&self) {
        self.session_mode.store(false, Ordering::Release);
        self.bus.broadcast(UiEvent::TerminalSessionEnded);
    }

    /// Session mode auto-expires at the end of the turn.
    pub fn auto_expire_session(&self) {
        if self.session_mode() {
            self.end_session();
            tracing::debug!("session mode auto-expired after turn");
        }
    }

    // ── run_command ───────────────────────────────────────────────

    /// Approval gate, blocklist, then streamed or PTY execution.
    pub async fn run_command(&self, req: RunCommandRequest) -> String {
        let (approved, request_id) = self.check_approval(&req.command, &req.cwd).await;
        if !approved {
            self.record_event(TerminalEvent::denied(&req.command, &req.cwd));
            return "Command denied by user".into();
        }

        let refused = blocklist::check_blocklist(&req.command)
            .map(|reason| format!("BLOCKED: {reason}"))
            .or_else(|| blocklist::check_path_injection(req.env.keys()).map(|r| format!("BLOCKED: {r}")));
        if let Some(output) = refused {
            self.record_event(TerminalEvent {
                command: req.command.clone(),
                exit_code: 1,
                output: output.clone(),
                cwd: req.cwd.clone(),
                duration_ms: 0,
                timed_out: false,
                denied: false,
                pty: req.pty,
                background: req.background,
            });
            return output;
        }

        self.track_running(&request_id, &req.command);
        let result = if req.pty {
            self.execute_pty(&request_id, &req).await
        } else {
            self.execute_standard(&request_id, &req).await
        };
        self.stop_tracking(&request_id);
        result
    }

    async fn execute_standard(&self, request_id: &str, req: &RunCommandRequest) -> String {
        let (kill_tx, kill_rx) = mpsc::channel(1);
        self.active_kills
            .lock()
            .insert(request_id.to_string(), kill_tx);

        let outcome: ExecOutcome = exec::run_streamed(
            &self.bus,
            &self.env,
            request_id,
            &req.command,
            &req.cwd,
            req.timeout_secs,
            &req.env,
            kill_rx,
        )
        .await;

        self.active_kills.lock().remove(request_id);
        self.broadcast_complete(request_id, outcome.exit_code, outcome.duration_ms);
        self.record_event(TerminalEvent {
            command: req.command.clone(),
            exit_code: outcome.exit_code,
            output: outcome.output.clone(),
            cwd: req.cwd.clone(),
            duration_ms: outcome.duration_ms,
            timed_out: outcome.timed_out,
            denied: false,
            pty: false,
            background: false,
        });
        outcome.output
    }

    async fn execute_pty(&self, request_id: &str, req: &RunCommandRequest) -> String {
        let ceiling = if req.background {
            pty::MAX_BACKGROUND_TIMEOUT_SECS
        } else {
            pty::MAX_PTY_TIMEOUT_SECS
        };
        let timeout_secs = req.timeout_secs.clamp(1, ceiling);

        let workdir = match exec::resolve_workdir(&req.cwd) {
            Ok(dir) => dir,
            Err(message) => {
                self.record_pty_event(req, 1, &message, 0, false);
                return message;
            }
        };

        let session_id = Uuid::new_v4().to_string();
        let size = *self.last_pty_size.lock();
        let session = match pty::spawn_session(
            self.bus.clone(),
            &self.env,
            &session_id,
            request_id,
            &req.command,
            &workdir,
            &req.env,
            req.background,
            size,
        ) {
            Ok(session) => session,
            Err(message) => {
                self.record_pty_event(req, 1, &message, 0, false);
                return message;
            }
        };
        self.sessions
            .lock()
            .insert(session_id.clone(), session.clone());

        if req.background {
            let yield_ms = if req.yield_ms == 0 {
                DEFAULT_YIELD_MS
            } else {
                req.yield_ms
            };
            if session.wait_done(Duration::from_millis(yield_ms)).await {
                // Finished within the yield window: same as foreground.
                let output = session.recent_text(100);
                let exit_code = session.exit_code().unwrap_or(0);
                let duration_ms = session.duration_ms();
                self.broadcast_complete(request_id, exit_code, duration_ms);
                self.sessions.lock().remove(&session_id);
                self.record_pty_event(req, exit_code, &output, duration_ms, false);
                return output;
            }
            // Still running: hand the session to the model.
            let output = session.recent_text(100);
            let result = format!(
                "Process running (session_id: {session_id}).\n--- Recent Output ---\n{output}"
            );
            self.record_pty_event(req, 0, &result, session.duration_ms(), false);
            return result;
        }

        // Foreground: wait for exit or the timeout ceiling.
        if session.wait_done(Duration::from_secs(timeout_secs)).await {
            let output = session.recent_text(200);
            let exit_code = session.exit_code().unwrap_or(0);
            let duration_ms = session.duration_ms();
            self.broadcast_complete(request_id, exit_code, duration_ms);
            self.sessions.lock().remove(&session_id);
            self.record_pty_event(req, exit_code, &output, duration_ms, false);
            return output;
        }

        let duration_ms = session.duration_ms();
        let partial = session.recent_text(200);
        self.kill_session(&session_id, &format!("Command timed out after {timeout_secs}s"));
        let output = format!("{partial}\n[Timed out after {timeout_secs}s]");
        self.record_pty_event(req, -1, &output, duration_ms, true);
        output
    }

    fn record_pty_event(
        &self,
        req: &RunCommandRequest,
        exit_code: i32,
        output: &str,
        duration_ms: u64,
        timed_out: bool,
    ) {
        self.record_event(TerminalEvent {
            command: req.command.clone(),
            exit_code,
            output: output.to_string(),
            cwd: req.cwd.clone(),
            duration_ms,
            timed_out,
            denied: false,
            pty: true,
            background: req.background,
        });
    }

    // ── PTY session interaction ───────────────────────────────────

    fn session(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Decode escape sequences, write to the session's PTY, wait for the
    /// CLI to react, and return recent output.
    pub async fn send_input(
        &self,
        session_id: &str,
        text: &str,
        press_enter: bool,
        wait_ms: u64,
    ) -> String {
        let Some(session) = self.session(session_id) else {
            return format!("Error: No active session with ID {session_id}");
        };
        if !session.is_alive() {
            return format!("Error: Session {session_id} has already exited");
        }

        let mut decoded = decode_escapes(text);
        if press_enter && !decoded.ends_with('\r') && !decoded.ends_with('\n') {
            decoded.push('\r');
        }

        if let Err(e) = session.write_input(decoded.into_bytes()).await {
            return format!("Error sending input: {e}");
        }

        if wait_ms > 0 {
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }

        let output = session.recent_text(50);
        let state = if session.is_alive() { "running" } else { "exited" };
        format!("Input sent. Session is {state}.\n--- Recent Output ---\n{output}")
    }

    /// Last `lines` lines of a session's ANSI-stripped buffer.
    pub fn read_output(&self, session_id: &str, lines: usize) -> String {
        let Some(session) = self.session(session_id) else {
            return format!("Error: No active session with ID {session_id}");
        };
        let state = if session.is_alive() { "running" } else { "exited" };
        let elapsed = session.duration_ms() / 1000;
        let output = session.recent_text(lines);
        format!(
            "[Session {session_id} — {state}, {elapsed}s elapsed]\n--- Output ({lines} lines) ---\n{output}"
        )
    }

    /// Terminate a session by id.
    pub fn kill_process(&self, session_id: &str) -> String {
        if !self.sessions.lock().contains_key(session_id) {
            return format!("Error: No active session with ID {session_id}");
        }
        self.kill_session(session_id, "Process killed by LLM request");
        format!("Session {session_id} terminated")
    }

    fn kill_session(&self, session_id: &str, reason: &str) {
        let Some(session) = self.sessions.lock().remove(session_id) else {
            return;
        };
        session.kill();
        self.bus.broadcast(UiEvent::TerminalOutput {
            request_id: session.request_id.clone(),
            text: format!("\x1b[31m[{reason}]\x1b[0m"),
            stream: true,
            raw: true,
        });
        self.broadcast_complete(&session.request_id, -1, session.duration_ms());
    }

    /// Resize every active PTY to the frontend viewport.
    pub fn resize_all(&self, cols: u16, rows: u16) {
        *self.last_pty_size.lock() = (cols, rows);
        for session in self.sessions.lock().values() {
            session.resize(cols, rows);
        }
    }

    /// Kill button: stop the running standard command and every PTY.
    /// Returns true when anything was killed.
    pub fn kill_running(&self) -> bool {
        let mut killed = false;
        for (_, tx) in self.active_kills.lock().drain() {
            let _ = tx.try_send(());
            killed = true;
        }
        let ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for id in ids {
            self.kill_session(&id, "Process killed by user");
            killed = true;
        }
        killed
    }

    // ── Global cancellation ───────────────────────────────────────

    /// Stop sweep: deny every pending approval and session request, kill
    /// every running subprocess and PTY session. Idempotent.
    pub fn cancel_all_pending(&self) {
        for (_, pending) in self.pending_approvals.lock().drain() {
            let _ = pending.respond.send(ApprovalReply {
                approved: false,
                remember: false,
            });
        }
        if let Some(pending) = self.pending_session.lock().take() {
            let _ = pending.respond.send(false);
        }
        for (_, tx) in self.active_kills.lock().drain() {
            let _ = tx.try_send(());
        }
        let ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for id in ids {
            self.kill_session(&id, "Process killed by user");
        }
    }

    /// Full reset on context clear: cancel everything, end session mode,
    /// drop tracking state and deferred events.
    pub fn reset(&self) {
        self.cancel_all_pending();
        self.session_mode.store(false, Ordering::Release);
        for (_, entry) in self.running.lock().drain() {
            entry.notice.abort();
        }
        self.deferred.clear();
    }

    // ── Running notice ────────────────────────────────────────────

    fn track_running(&self, request_id: &str, command: &str) {
        let bus = self.bus.clone();
        let rid = request_id.to_string();
        let cmd = command.to_string();
        let started = Instant::now();
        let notice = tokio::spawn(async move {
            tokio::time::sleep(RUNNING_NOTICE_AFTER).await;
            bus.broadcast(UiEvent::TerminalRunningNotice {
                request_id: rid,
                command: cmd,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        });
        self.running.lock().insert(
            request_id.to_string(),
            RunningCommand {
                command: command.to_string(),
                started,
                notice,
            },
        );
    }

    fn stop_tracking(&self, request_id: &str) {
        if let Some(entry) = self.running.lock().remove(request_id) {
            entry.notice.abort();
            tracing::debug!(
                request_id,
                command = %entry.command,
                elapsed_ms = entry.started.elapsed().as_millis() as u64,
                "command finished"
            );
        }
    }

    // ── Terminal events ───────────────────────────────────────────

    fn broadcast_complete(&self, request_id: &str, exit_code: i32, duration_ms: u64) {
        self.bus.broadcast(UiEvent::TerminalCommandComplete {
            request_id: request_id.to_string(),
            exit_code,
            duration_ms,
        });
    }

    /// Persist an event, or queue it while no conversation id exists.
    fn record_event(&self, event: TerminalEvent) {
        let event = event.capped();
        let message_index = self.sink.message_index();
        match self.sink.conversation_id() {
            Some(conversation_id) => {
                self.sink.persist(&conversation_id, message_index, &event)
            }
            None => self.deferred.push(message_index, event),
        }
    }

    /// Flush deferred events under the newly-assigned conversation id.
    pub fn flush_deferred(&self, conversation_id: &str) {
        self.deferred.flush(self.sink.as_ref(), conversation_id);
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}

/// Decode JSON-style escape sequences so the model can write control
/// characters naturally (`\r`, `\n`, `\t`, `\xNN`, `\\`).
fn decode_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('x') => {
                let hi = chars.next();
                let lo = chars.next();
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        match u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                            Ok(byte) => out.push(byte as char),
                            Err(_) => {
                                out.push_str("\\x");
                                out.push(hi);
                                out.push(lo);
                            }
                        }
                    }
                    _ => out.push_str("\\x"),
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
