//! Screenshot and voice-capture contracts.
//!
//! Capture itself happens outside the core; the gateway owns only the
//! attached-screenshot list (replayed to newly-connected clients) and
//! the hooks the orchestrator calls.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use valet_domain::error::Result;
use valet_domain::event::UiEvent;

/// One captured screenshot handed to the core.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub name: String,
    pub path: String,
    pub thumbnail: Option<String>,
}

#[async_trait::async_trait]
pub trait ScreenshotCapture: Send + Sync {
    /// Capture the full screen, or `None` when capture is unavailable.
    async fn capture_fullscreen(&self) -> Result<Option<Screenshot>>;
}

/// Capture disabled (headless or capture service not installed).
pub struct NoopCapture;

#[async_trait::async_trait]
impl ScreenshotCapture for NoopCapture {
    async fn capture_fullscreen(&self) -> Result<Option<Screenshot>> {
        Ok(None)
    }
}

#[async_trait::async_trait]
pub trait VoiceTranscriber: Send + Sync {
    fn start_recording(&self);
    async fn stop_recording(&self) -> Result<String>;
}

pub struct NoopTranscriber;

#[async_trait::async_trait]
impl VoiceTranscriber for NoopTranscriber {
    fn start_recording(&self) {}
    async fn stop_recording(&self) -> Result<String> {
        Ok(String::new())
    }
}

#[derive(Debug, Clone)]
struct AttachedScreenshot {
    id: String,
    screenshot: Screenshot,
}

/// Screenshots attached to the next query.
#[derive(Default)]
pub struct ScreenshotList {
    items: Mutex<Vec<AttachedScreenshot>>,
    counter: AtomicU64,
}

impl ScreenshotList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a screenshot; returns its id.
    pub fn add(&self, screenshot: Screenshot) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("ss_{n}");
        self.items.lock().push(AttachedScreenshot {
            id: id.clone(),
            screenshot,
        });
        id
    }

    /// Remove by id; true when something was removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| item.id != id);
        items.len() != before
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Paths of attached screenshots that still exist on disk.
    pub fn image_paths(&self) -> Vec<String> {
        self.items
            .lock()
            .iter()
            .filter(|item| std::path::Path::new(&item.screenshot.path).exists())
            .map(|item| item.screenshot.path.clone())
            .collect()
    }

    /// Events replayed to a newly-connected client.
    pub fn replay_events(&self) -> Vec<UiEvent> {
        self.items
            .lock()
            .iter()
            .map(|item| UiEvent::ScreenshotAdded {
                id: item.id.clone(),
                name: item.screenshot.name.clone(),
                thumbnail: item.screenshot.thumbnail.clone(),
            })
            .collect()
    }
}
