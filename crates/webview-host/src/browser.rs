//! The browser runtime as seen by the streaming pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::BrowserError;
use crate::protocol::TouchPhase;

/// Opens and closes tabs.
#[async_trait]
pub trait BrowserRuntime: Send + Sync {
    /// Create a blank tab of the given size and take exclusive control of it.
    async fn acquire_tab(&self, width: u32, height: u32)
        -> Result<Arc<dyn PageHandle>, BrowserError>;

    async fn release_tab(&self, target_id: &str) -> Result<(), BrowserError>;
}

/// One tab owned by one device session.
#[async_trait]
pub trait PageHandle: Send + Sync {
    fn target_id(&self) -> &str;

    /// Apply the emulated viewport and report the size the page settled on.
    /// Safe to call again when the reported size does not match.
    async fn set_viewport(&self, settings: &ViewportSettings)
        -> Result<ViewportSize, BrowserError>;

    /// Evaluate a script and return its value.
    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError>;

    /// Begin the capture stream. Every event must be acknowledged with
    /// [`PageHandle::ack_capture`] or the browser stops producing stills.
    async fn start_capture(
        &self,
        options: CaptureOptions,
    ) -> Result<mpsc::Receiver<CaptureEvent>, BrowserError>;

    async fn ack_capture(&self, session_tag: i64) -> Result<(), BrowserError>;

    async fn stop_capture(&self) -> Result<(), BrowserError>;

    async fn inject_touch(&self, touch: TouchEvent) -> Result<(), BrowserError>;

    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewportSettings {
    pub width: u32,
    pub height: u32,
    pub locale: String,
    pub reduced_motion: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_dpr")]
    pub dpr: f64,
}

fn default_dpr() -> f64 {
    1.0
}

impl ViewportSize {
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    pub max_width: u32,
    pub max_height: u32,
    pub every_nth_frame: u32,
}

/// One captured still, as encoded by the browser.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub session_tag: i64,
    pub data: Bytes,
}

/// A touch point in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchEvent {
    pub phase: TouchPhase,
    pub pointer_id: u8,
    pub x: u32,
    pub y: u32,
}
