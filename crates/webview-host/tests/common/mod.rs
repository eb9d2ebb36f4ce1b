//! Reusable harness for end-to-end streaming tests.
//!
//! Runs the real WebSocket server on an ephemeral port against a scripted
//! browser, and provides a display client that reassembles chunked frames.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay_webview_host::broadcast::Broadcaster;
use relay_webview_host::browser::{
    BrowserRuntime, CaptureEvent, CaptureOptions, PageHandle, TouchEvent, ViewportSettings,
    ViewportSize,
};
use relay_webview_host::codec::encode_png;
use relay_webview_host::config::DeviceConfig;
use relay_webview_host::device::FrameCodecs;
use relay_webview_host::error::BrowserError;
use relay_webview_host::manager::{DeviceManager, ManagerOptions};
use relay_webview_host::protocol::{decode_chunk, ControlMessage, EncodedRect};
use relay_webview_host::server::{serve, ServerState};
use relay_webview_host::tiles::PixelFrame;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ── Scripted browser ────────────────────────────────────────────────

#[derive(Default)]
pub struct StubBrowser {
    next_id: AtomicU32,
    pages: Mutex<Vec<Arc<StubPage>>>,
    released: Mutex<Vec<String>>,
}

impl StubBrowser {
    pub fn page(&self, index: usize) -> Arc<StubPage> {
        Arc::clone(&self.pages.lock().unwrap()[index])
    }

    pub fn acquired(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserRuntime for StubBrowser {
    async fn acquire_tab(
        &self,
        _width: u32,
        _height: u32,
    ) -> Result<Arc<dyn PageHandle>, BrowserError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let page = Arc::new(StubPage {
            target_id: format!("tab-{id}"),
            ..StubPage::default()
        });
        self.pages.lock().unwrap().push(Arc::clone(&page));
        Ok(page)
    }

    async fn release_tab(&self, target_id: &str) -> Result<(), BrowserError> {
        self.released.lock().unwrap().push(target_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct StubPage {
    target_id: String,
    capture_tx: Mutex<Option<mpsc::Sender<CaptureEvent>>>,
    next_tag: AtomicI64,
    touches: Mutex<Vec<TouchEvent>>,
    navigations: Mutex<Vec<String>>,
}

impl StubPage {
    pub fn is_capturing(&self) -> bool {
        self.capture_tx.lock().unwrap().is_some()
    }

    pub async fn push_still(&self, data: Vec<u8>) {
        let tx = self.capture_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = tx
                .send(CaptureEvent {
                    session_tag: tag,
                    data: Bytes::from(data),
                })
                .await;
        }
    }

    pub fn touches(&self) -> Vec<TouchEvent> {
        self.touches.lock().unwrap().clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageHandle for StubPage {
    fn target_id(&self) -> &str {
        &self.target_id
    }

    async fn set_viewport(&self, s: &ViewportSettings) -> Result<ViewportSize, BrowserError> {
        Ok(ViewportSize {
            width: s.width,
            height: s.height,
            dpr: 1.0,
        })
    }

    async fn evaluate(&self, _expression: &str) -> Result<Value, BrowserError> {
        Ok(json!({}))
    }

    async fn start_capture(
        &self,
        _options: CaptureOptions,
    ) -> Result<mpsc::Receiver<CaptureEvent>, BrowserError> {
        let (tx, rx) = mpsc::channel(16);
        *self.capture_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn ack_capture(&self, _session_tag: i64) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn stop_capture(&self) -> Result<(), BrowserError> {
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

// ── Server handle ───────────────────────────────────────────────────

/// A running server. The accept loop is aborted on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub manager: Arc<DeviceManager>,
    pub browser: Arc<StubBrowser>,
    accept_task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl TestServer {
    pub fn url(&self, query: &str) -> String {
        format!("ws://{}/?{}", self.addr, query)
    }

    /// Connect a display and wait until its device is live and capturing.
    pub async fn attach(&self, query: &str, device_id: &str) -> DisplayClient {
        let client = DisplayClient::connect(&self.url(query)).await;
        let manager = Arc::clone(&self.manager);
        let id = device_id.to_string();
        wait_until(move || manager.get(&id).is_some()).await;
        client
    }

    /// The page behind the live session of `device_id`.
    pub fn page_of(&self, device_id: &str) -> Arc<StubPage> {
        let session = self.manager.get(device_id).expect("device is live");
        let pages = self.browser.pages.lock().unwrap();
        let page = pages
            .iter()
            .find(|p| p.target_id == session.target_id())
            .expect("page for session");
        Arc::clone(page)
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(FrameCodecs::default()).await
}

pub async fn start_server_with(codecs: FrameCodecs) -> TestServer {
    let browser = Arc::new(StubBrowser::default());
    let manager = Arc::new(DeviceManager::new(
        browser.clone(),
        Arc::new(Broadcaster::default()),
        codecs,
        ManagerOptions::default(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(
        Arc::clone(&manager),
        DeviceConfig::default(),
    ));
    let accept_task = tokio::spawn(serve(listener, state));
    TestServer {
        addr,
        manager,
        browser,
        accept_task,
    }
}

// ── Display client ──────────────────────────────────────────────────

/// One reassembled frame as a display would draw it.
#[derive(Debug)]
pub struct ReceivedFrame {
    pub frame_id: u32,
    pub full_frame: bool,
    pub chunks: usize,
    pub rects: Vec<EncodedRect>,
}

pub struct DisplayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    partial: HashMap<u32, ReceivedFrame>,
}

impl DisplayClient {
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.expect("websocket connect");
        Self {
            ws,
            partial: HashMap::new(),
        }
    }

    pub async fn send(&mut self, msg: &ControlMessage) {
        self.ws
            .send(Message::Binary(msg.encode().into()))
            .await
            .expect("send control message");
    }

    /// Next complete frame, or `None` on timeout or close.
    pub async fn next_frame(&mut self) -> Option<ReceivedFrame> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .ok()??
                .ok()?;
            let Message::Binary(data) = msg else {
                if msg.is_close() {
                    return None;
                }
                continue;
            };
            let chunk = decode_chunk(&data).expect("well-formed frame chunk");
            let entry = self
                .partial
                .entry(chunk.frame_id)
                .or_insert_with(|| ReceivedFrame {
                    frame_id: chunk.frame_id,
                    full_frame: chunk.full_frame,
                    chunks: 0,
                    rects: Vec::new(),
                });
            entry.chunks += 1;
            entry.rects.extend(chunk.rects);
            if chunk.is_final {
                return self.partial.remove(&chunk.frame_id);
            }
        }
    }

    /// True when no frame arrives within `window`.
    pub async fn is_quiet_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.ws.next()).await.is_err()
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Drain until the server acknowledges the close.
        while let Ok(Some(Ok(_))) = tokio::time::timeout(RECV_TIMEOUT, self.ws.next()).await {}
    }
}

// ── Stills ──────────────────────────────────────────────────────────

/// A page image that changes one pixel per step, cycling through the
/// tiles of a `tile`-sized grid.
pub struct StillSequence {
    frame: PixelFrame,
    tile: u32,
    step: u32,
}

impl StillSequence {
    pub fn new(width: u32, height: u32, tile: u32) -> Self {
        Self {
            frame: PixelFrame::filled(width, height, [40, 40, 40, 255]),
            tile,
            step: 0,
        }
    }

    pub fn next_png(&mut self) -> Vec<u8> {
        let cols = self.frame.width().div_ceil(self.tile);
        let rows = self.frame.height().div_ceil(self.tile);
        let index = self.step % (cols * rows);
        let x = (index % cols) * self.tile + 1;
        let y = (index / cols) * self.tile + 1;
        let shade = (self.step * 7 % 200) as u8 + 50;
        self.frame.set_pixel(x, y, [shade, 255 - shade, 0, 255]);
        self.step += 1;
        encode_png(&self.frame).expect("png encode")
    }

    pub fn current_png(&self) -> Vec<u8> {
        encode_png(&self.frame).expect("png encode")
    }
}

pub fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    encode_png(&PixelFrame::filled(width, height, rgba)).expect("png encode")
}

// ── Waiting ─────────────────────────────────────────────────────────

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {RECV_TIMEOUT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
