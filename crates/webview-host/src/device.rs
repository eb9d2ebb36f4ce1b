//! One device: a tab, its capture stream, and the pipeline that turns
//! stills into broadcast frames.
//!
//! Stills arrive from the capture pump, go through the rate coalescer and
//! are processed one at a time on the blocking pool (dedup, decode, tile
//! diff, encode). Output is broadcast only while the session is open; a
//! frame finishing after teardown is dropped.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::broadcast::Broadcaster;
use crate::browser::{BrowserRuntime, CaptureEvent, PageHandle, TouchEvent};
use crate::codec::{ImageDecoder, JpegRectEncoder, RectEncoder, StillDecoder};
use crate::coalesce::Coalescer;
use crate::config::{DeviceConfig, Rotation};
use crate::dedup::{fingerprint, DedupGate};
use crate::error::{BrowserError, FrameError};
use crate::protocol::TouchInput;
use crate::stats::{DeviceMetrics, DeviceStats};
use crate::tiles::{FrameOutput, TileEncoder, TileSettings};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decoder and encoder shared by every session.
#[derive(Clone)]
pub struct FrameCodecs {
    pub decoder: Arc<dyn StillDecoder>,
    pub encoder: Arc<dyn RectEncoder>,
}

impl Default for FrameCodecs {
    fn default() -> Self {
        Self {
            decoder: Arc::new(ImageDecoder),
            encoder: Arc::new(JpegRectEncoder),
        }
    }
}

// ── Pipeline state ──────────────────────────────────────────────────

enum Processed {
    Duplicate,
    Frame(FrameOutput),
}

/// Pixel state of one session; only touched while processing its own still.
struct Pipeline {
    dedup: DedupGate,
    tiles: TileEncoder,
}

impl Pipeline {
    fn process(
        &mut self,
        still: &[u8],
        rotation: Rotation,
        force_full: bool,
        codecs: &FrameCodecs,
    ) -> Result<Processed, FrameError> {
        let hash = fingerprint(still);
        if !force_full && self.dedup.is_duplicate(hash) {
            return Ok(Processed::Duplicate);
        }
        let frame = codecs.decoder.decode(still, rotation)?;
        let output = self.tiles.process(frame, force_full, codecs.encoder.as_ref())?;
        self.dedup.record(hash);
        Ok(Processed::Frame(output))
    }
}

// ── Session ─────────────────────────────────────────────────────────

pub struct DeviceSession {
    device_id: String,
    config: DeviceConfig,
    page: Arc<dyn PageHandle>,
    runtime: Arc<dyn BrowserRuntime>,
    broadcaster: Arc<Broadcaster>,
    codecs: FrameCodecs,
    pipeline: Arc<Mutex<Pipeline>>,
    coalescer: Coalescer<Bytes>,
    stats: Arc<DeviceStats>,
    last_active: Mutex<Instant>,
    frame_id: AtomicU32,
    full_frame_requested: AtomicBool,
    /// Most recent capture, replayed when a full frame is requested.
    last_still: Mutex<Option<Bytes>>,
    capture_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DeviceSession {
    pub(crate) fn new(
        device_id: String,
        config: DeviceConfig,
        page: Arc<dyn PageHandle>,
        runtime: Arc<dyn BrowserRuntime>,
        broadcaster: Arc<Broadcaster>,
        codecs: FrameCodecs,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let coalescer = Coalescer::new(config.min_frame_interval, move |still: Bytes| {
                let weak = weak.clone();
                async move {
                    if let Some(session) = weak.upgrade() {
                        session.flush(still).await;
                    }
                }
            });
            Self {
                pipeline: Arc::new(Mutex::new(Pipeline {
                    dedup: DedupGate::new(),
                    tiles: TileEncoder::new(TileSettings::from(&config)),
                })),
                device_id,
                config,
                page,
                runtime,
                broadcaster,
                codecs,
                coalescer,
                stats: Arc::new(DeviceStats::default()),
                last_active: Mutex::new(Instant::now()),
                frame_id: AtomicU32::new(0),
                full_frame_requested: AtomicBool::new(false),
                last_still: Mutex::new(None),
                capture_task: Mutex::new(None),
                closed: AtomicBool::new(false),
            }
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn target_id(&self) -> &str {
        self.page.target_id()
    }

    pub fn stats(&self) -> &Arc<DeviceStats> {
        &self.stats
    }

    /// Id of the last broadcast frame; 0 before the first one.
    pub fn frame_id(&self) -> u32 {
        self.frame_id.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn client_count(&self) -> usize {
        self.broadcaster.client_count(&self.device_id)
    }

    pub fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *lock(&self.last_active)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    pub fn metrics(&self) -> DeviceMetrics {
        let (width, height) = self.config.display_size();
        self.stats
            .snapshot(&self.device_id, self.client_count(), width, height)
    }

    /// Start pumping capture events into the pipeline. Each event is
    /// acknowledged before it is looked at.
    pub(crate) fn attach_capture(self: &Arc<Self>, mut events: mpsc::Receiver<CaptureEvent>) {
        let weak = Arc::downgrade(self);
        let page = Arc::clone(&self.page);
        let device_id = self.device_id.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = page.ack_capture(event.session_tag).await {
                    debug!(device = %device_id, error = %e, "capture ack failed");
                }
                let Some(session) = weak.upgrade() else { break };
                session.on_capture(event.data);
            }
            trace!(device = %device_id, "capture stream ended");
        });
        *lock(&self.capture_task) = Some(task);
    }

    /// A new still from the browser. Without subscribers it is only kept
    /// for replay; activity is not refreshed.
    pub fn on_capture(&self, still: Bytes) {
        *lock(&self.last_still) = Some(still.clone());
        if self.is_closed() || self.client_count() == 0 {
            return;
        }
        self.touch();
        if self.coalescer.offer(still) {
            self.stats.record_superseded();
        }
    }

    /// Send the whole frame with the next processed still, re-offering the
    /// latest capture so a static page still produces it.
    pub fn request_full_frame(&self) {
        self.full_frame_requested.store(true, Ordering::Release);
        if self.is_closed() || self.client_count() == 0 {
            return;
        }
        let still = lock(&self.last_still).clone();
        if let Some(still) = still {
            self.coalescer.offer(still);
        }
    }

    async fn flush(&self, still: Bytes) {
        if self.is_closed() || self.client_count() == 0 {
            return;
        }
        let force = self.full_frame_requested.swap(false, Ordering::AcqRel);
        let pipeline = Arc::clone(&self.pipeline);
        let codecs = self.codecs.clone();
        let rotation = self.config.rotation;

        let result = tokio::task::spawn_blocking(move || {
            lock(&pipeline).process(&still, rotation, force, &codecs)
        })
        .await
        .unwrap_or_else(|e| Err(FrameError::Join(e.to_string())));

        match result {
            Ok(Processed::Duplicate) => {
                self.stats.record_duplicate();
                trace!(device = %self.device_id, "duplicate still skipped");
            }
            Ok(Processed::Frame(output)) => self.broadcast(output),
            Err(e) => {
                warn!(device = %self.device_id, error = %e, "frame dropped");
                self.stats.record_error();
                if force {
                    self.full_frame_requested.store(true, Ordering::Release);
                }
            }
        }
    }

    fn broadcast(&self, output: FrameOutput) {
        if output.is_empty() || self.is_closed() {
            return;
        }
        // Flushes are sequential per session, so load/store cannot race.
        let frame_id = self.frame_id.load(Ordering::Acquire).wrapping_add(1);
        match self.broadcaster.send_frame_chunked(
            &self.device_id,
            frame_id,
            &output,
            self.config.max_bytes_per_message,
        ) {
            Ok(0) => {}
            Ok(chunks) => {
                self.frame_id.store(frame_id, Ordering::Release);
                self.stats
                    .record_frame(output.byte_len(), chunks, output.full_frame);
                debug!(
                    device = %self.device_id,
                    frame_id,
                    rects = output.rects.len(),
                    bytes = output.byte_len(),
                    chunks,
                    full = output.full_frame,
                    "frame sent"
                );
            }
            Err(e) => {
                warn!(device = %self.device_id, frame_id, error = %e, "frame not sent");
                self.stats.record_error();
            }
        }
    }

    /// Forward a touch from the display, mapped into page coordinates.
    pub async fn inject_touch(&self, input: TouchInput) -> Result<(), BrowserError> {
        let (x, y) = self.config.rotation.display_to_page(
            input.x as u32,
            input.y as u32,
            self.config.width,
            self.config.height,
        );
        self.page
            .inject_touch(TouchEvent {
                phase: input.phase,
                pointer_id: input.pointer_id,
                x,
                y,
            })
            .await
    }

    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.page.navigate(url).await
    }

    /// Stop timers, stop capture, release the tab. Each step is best-effort;
    /// calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.coalescer.cancel();
        if let Some(task) = lock(&self.capture_task).take() {
            task.abort();
        }
        if let Err(e) = self.page.stop_capture().await {
            warn!(device = %self.device_id, error = %e, "stop capture failed");
        }
        if let Err(e) = self.runtime.release_tab(self.page.target_id()).await {
            warn!(device = %self.device_id, error = %e, "release tab failed");
        }
        info!(device = %self.device_id, target = %self.page.target_id(), "device torn down");
    }
}
