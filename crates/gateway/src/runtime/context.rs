//! Request lifecycle: one context per user turn, plus the gate that
//! enforces a single turn in flight.
//!
//! `cancel()` is the uniform cancellation signal. Every subsystem
//! checks the flag or registers a callback; once it fires, later work
//! must refuse or abort.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use valet_domain::error::{Error, Result};

use crate::skills::Skill;

type CancelCallback = Box<dyn Fn() + Send + Sync>;

pub struct RequestContext {
    /// Monotonic turn id.
    pub id: u64,
    /// Skills forced by slash commands in the user text.
    pub forced_skills: Vec<Skill>,
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<CancelCallback>>,
    done: AtomicBool,
}

impl RequestContext {
    fn new(id: u64, forced_skills: Vec<Skill>) -> Self {
        Self {
            id,
            forced_skills,
            cancelled: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancel this turn. Callbacks fire in registration order, once.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }

    /// Register a cleanup callback; fires immediately when the context
    /// is already cancelled.
    pub fn on_cancel(&self, callback: CancelCallback) {
        if self.is_cancelled() {
            callback();
            return;
        }
        self.callbacks.lock().push(callback);
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Serializes turns: exactly one context is current at a time.
#[derive(Default)]
pub struct RequestGate {
    current: Mutex<Option<Arc<RequestContext>>>,
    next_id: AtomicU64,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new turn, failing immediately when one is active.
    pub fn begin(&self, forced_skills: Vec<Skill>) -> Result<Arc<RequestContext>> {
        let mut current = self.current.lock();
        if let Some(active) = current.as_ref() {
            if !active.is_done() {
                return Err(Error::Busy);
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = Arc::new(RequestContext::new(id, forced_skills));
        *current = Some(ctx.clone());
        Ok(ctx)
    }

    pub fn current(&self) -> Option<Arc<RequestContext>> {
        self.current.lock().clone()
    }

    /// Cancel the active turn, if any. Returns true when one was found.
    pub fn cancel_current(&self) -> bool {
        match self.current() {
            Some(ctx) if !ctx.is_done() => {
                ctx.cancel();
                true
            }
            _ => false,
        }
    }

    /// Close a turn: mark done and clear "current" when it still refers
    /// to this context.
    pub fn finish(&self, ctx: &Arc<RequestContext>) {
        ctx.mark_done();
        let mut current = self.current.lock();
        if current.as_ref().map(|c| c.id) == Some(ctx.id) {
            *current = None;
        }
    }
}
