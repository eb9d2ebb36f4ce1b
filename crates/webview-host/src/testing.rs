//! Scripted browser runtime for unit tests.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::browser::{
    BrowserRuntime, CaptureEvent, CaptureOptions, PageHandle, TouchEvent, ViewportSettings,
    ViewportSize,
};
use crate::codec::{ImageDecoder, RawRgbaEncoder};
use crate::device::FrameCodecs;
use crate::error::BrowserError;

pub fn raw_codecs() -> FrameCodecs {
    FrameCodecs {
        decoder: Arc::new(ImageDecoder),
        encoder: Arc::new(RawRgbaEncoder),
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicU32,
    pages: Mutex<Vec<Arc<FakePage>>>,
    released: Mutex<Vec<String>>,
    pub fail_acquire: AtomicBool,
    pub fail_capture: AtomicBool,
    /// Viewport reports that come back wrong before the right one.
    pub viewport_misses: AtomicU32,
    pub acquire_delay_ms: AtomicU32,
    pub release_delay_ms: AtomicU32,
    log: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn page(&self, index: usize) -> Arc<FakePage> {
        Arc::clone(&self.pages.lock().unwrap()[index])
    }

    pub fn acquired(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    /// Acquire and release calls in the order they completed.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserRuntime for FakeRuntime {
    async fn acquire_tab(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Arc<dyn PageHandle>, BrowserError> {
        let delay = self.acquire_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(BrowserError::Unavailable("scripted failure".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let page = Arc::new(FakePage {
            target_id: format!("tab-{id}"),
            width,
            height,
            viewport_misses: AtomicU32::new(self.viewport_misses.load(Ordering::SeqCst)),
            fail_capture: AtomicBool::new(self.fail_capture.load(Ordering::SeqCst)),
            ..FakePage::default()
        });
        self.log.lock().unwrap().push(format!("acquire {}", page.target_id));
        self.pages.lock().unwrap().push(Arc::clone(&page));
        Ok(page)
    }

    async fn release_tab(&self, target_id: &str) -> Result<(), BrowserError> {
        let delay = self.release_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.released.lock().unwrap().push(target_id.to_string());
        self.log.lock().unwrap().push(format!("release {target_id}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePage {
    target_id: String,
    width: u32,
    height: u32,
    capture_tx: Mutex<Option<mpsc::Sender<CaptureEvent>>>,
    next_tag: AtomicI64,
    acks: Mutex<Vec<i64>>,
    touches: Mutex<Vec<TouchEvent>>,
    navigations: Mutex<Vec<String>>,
    evaluations: Mutex<Vec<String>>,
    viewport_calls: AtomicUsize,
    viewport_misses: AtomicU32,
    stops: AtomicUsize,
    pub fail_capture: AtomicBool,
}

impl FakePage {
    pub async fn push_still(&self, data: Bytes) {
        let tx = self.capture_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = tx
                .send(CaptureEvent {
                    session_tag: tag,
                    data,
                })
                .await;
        }
    }

    pub fn acks(&self) -> Vec<i64> {
        self.acks.lock().unwrap().clone()
    }

    pub fn touches(&self) -> Vec<TouchEvent> {
        self.touches.lock().unwrap().clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }

    pub fn evaluations(&self) -> Vec<String> {
        self.evaluations.lock().unwrap().clone()
    }

    pub fn viewport_calls(&self) -> usize {
        self.viewport_calls.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_capturing(&self) -> bool {
        self.capture_tx.lock().unwrap().is_some()
    }
}

#[async_trait]
impl PageHandle for FakePage {
    fn target_id(&self) -> &str {
        &self.target_id
    }

    async fn set_viewport(&self, s: &ViewportSettings) -> Result<ViewportSize, BrowserError> {
        self.viewport_calls.fetch_add(1, Ordering::SeqCst);
        let miss = self
            .viewport_misses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let width = if miss { s.width / 2 } else { s.width };
        Ok(ViewportSize {
            width,
            height: s.height,
            dpr: 1.0,
        })
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        self.evaluations.lock().unwrap().push(expression.to_string());
        Ok(json!({ "width": self.width, "height": self.height }))
    }

    async fn start_capture(
        &self,
        _options: CaptureOptions,
    ) -> Result<mpsc::Receiver<CaptureEvent>, BrowserError> {
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(BrowserError::Cdp("screencast refused".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        *self.capture_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn ack_capture(&self, session_tag: i64) -> Result<(), BrowserError> {
        self.acks.lock().unwrap().push(session_tag);
        Ok(())
    }

    async fn stop_capture(&self) -> Result<(), BrowserError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.capture_tx.lock().unwrap().take();
        Ok(())
    }

    async fn inject_touch(&self, touch: TouchEvent) -> Result<(), BrowserError> {
        self.touches.lock().unwrap().push(touch);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }
}
