//! Owner of every device session.
//!
//! Each device id has a slot guarded by an async mutex, so creating,
//! replacing and deleting the session of one id never interleave while
//! different ids proceed independently. Live sessions are mirrored in a
//! lock-free map for lookups from the input path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::browser::{BrowserRuntime, CaptureOptions, PageHandle, ViewportSettings};
use crate::config::{DeviceConfig, ServerConfig};
use crate::device::{DeviceSession, FrameCodecs};
use crate::error::BrowserError;
use crate::stats::DeviceMetrics;

type Slot = Arc<Mutex<Option<Arc<DeviceSession>>>>;

const CODEC_PROBE: &str = r#"(() => {
  const video = document.createElement('video');
  return {
    h264: video.canPlayType('video/mp4; codecs="avc1.42E01E"'),
    h264High: video.canPlayType('video/mp4; codecs="avc1.64001E"'),
    vp9: video.canPlayType('video/webm; codecs="vp9"'),
    av1: video.canPlayType('video/mp4; codecs="av01.0.05M.08"')
  };
})()"#;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub locale: String,
    pub reduced_motion: bool,
    pub start_url: Option<String>,
    pub viewport_attempts: u32,
    pub viewport_backoff: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            locale: "en-US".to_string(),
            reduced_motion: false,
            start_url: None,
            viewport_attempts: 3,
            viewport_backoff: Duration::from_millis(500),
        }
    }
}

impl From<&ServerConfig> for ManagerOptions {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            locale: cfg.browser_locale.clone(),
            reduced_motion: cfg.prefers_reduced_motion,
            start_url: cfg.start_url.clone(),
            ..Self::default()
        }
    }
}

pub struct DeviceManager {
    runtime: Arc<dyn BrowserRuntime>,
    broadcaster: Arc<Broadcaster>,
    codecs: FrameCodecs,
    options: ManagerOptions,
    slots: DashMap<String, Slot>,
    live: DashMap<String, Arc<DeviceSession>>,
    sweeping: AtomicBool,
    codecs_probed: AtomicBool,
}

/// Clears the sweep flag however the sweep ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DeviceManager {
    pub fn new(
        runtime: Arc<dyn BrowserRuntime>,
        broadcaster: Arc<Broadcaster>,
        codecs: FrameCodecs,
        options: ManagerOptions,
    ) -> Self {
        Self {
            runtime,
            broadcaster,
            codecs,
            options,
            slots: DashMap::new(),
            live: DashMap::new(),
            sweeping: AtomicBool::new(false),
            codecs_probed: AtomicBool::new(false),
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.live.get(device_id).map(|s| Arc::clone(s.value()))
    }

    pub fn device_count(&self) -> usize {
        self.live.len()
    }

    fn slot(&self, device_id: &str) -> Slot {
        Arc::clone(self.slots.entry(device_id.to_string()).or_default().value())
    }

    /// Return the session for `device_id`, creating or recreating it so it
    /// runs with `config`.
    pub async fn ensure_device(
        &self,
        device_id: &str,
        config: &DeviceConfig,
    ) -> Result<Arc<DeviceSession>, BrowserError> {
        let slot = self.slot(device_id);
        let mut current = slot.lock().await;

        if let Some(existing) = current.as_ref() {
            if !existing.is_closed() && existing.config() == config {
                existing.touch();
                existing.request_full_frame();
                return Ok(Arc::clone(existing));
            }
        }
        if let Some(old) = current.take() {
            info!(device = %device_id, "reconfiguring device");
            self.live.remove(device_id);
            old.shutdown().await;
        }

        let session = self.create(device_id, config).await?;
        self.live
            .insert(device_id.to_string(), Arc::clone(&session));
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn create(
        &self,
        device_id: &str,
        config: &DeviceConfig,
    ) -> Result<Arc<DeviceSession>, BrowserError> {
        let page = self
            .runtime
            .acquire_tab(config.width, config.height)
            .await?;

        if !self.establish_viewport(device_id, page.as_ref(), config).await {
            warn!(
                device = %device_id,
                width = config.width,
                height = config.height,
                "viewport may not match the requested size"
            );
        }
        self.probe_codecs(page.as_ref()).await;

        if let Some(url) = &self.options.start_url {
            if let Err(e) = page.navigate(url).await {
                warn!(device = %device_id, url = %url, error = %e, "start page failed to load");
            }
        }

        let events = match page
            .start_capture(CaptureOptions {
                max_width: config.width,
                max_height: config.height,
                every_nth_frame: config.every_nth_frame,
            })
            .await
        {
            Ok(events) => events,
            Err(e) => {
                if let Err(release) = self.runtime.release_tab(page.target_id()).await {
                    warn!(device = %device_id, error = %release, "release after failed start");
                }
                return Err(e);
            }
        };

        let session = DeviceSession::new(
            device_id.to_string(),
            config.clone(),
            Arc::clone(&page),
            Arc::clone(&self.runtime),
            Arc::clone(&self.broadcaster),
            self.codecs.clone(),
        );
        session.attach_capture(events);
        session.request_full_frame();
        info!(
            device = %device_id,
            target = %page.target_id(),
            width = config.width,
            height = config.height,
            "device created"
        );
        Ok(session)
    }

    /// Apply the viewport until the page reports the requested size.
    /// Returns false when it never converged; the device is usable anyway.
    async fn establish_viewport(
        &self,
        device_id: &str,
        page: &dyn PageHandle,
        config: &DeviceConfig,
    ) -> bool {
        let settings = ViewportSettings {
            width: config.width,
            height: config.height,
            locale: self.options.locale.clone(),
            reduced_motion: self.options.reduced_motion,
        };
        let attempts = self.options.viewport_attempts.max(1);
        for attempt in 1..=attempts {
            match page.set_viewport(&settings).await {
                Ok(size) if size.matches(config.width, config.height) => {
                    debug!(device = %device_id, attempt, "viewport set");
                    return true;
                }
                Ok(size) => debug!(
                    device = %device_id,
                    attempt,
                    got_width = size.width,
                    got_height = size.height,
                    "viewport size mismatch"
                ),
                Err(e) => warn!(device = %device_id, attempt, error = %e, "viewport setup failed"),
            }
            if attempt < attempts {
                time::sleep(self.options.viewport_backoff).await;
            }
        }
        false
    }

    /// Log the page's media codec support once per manager.
    async fn probe_codecs(&self, page: &dyn PageHandle) {
        if self
            .codecs_probed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match page.evaluate(CODEC_PROBE).await {
            Ok(support) => {
                let field = |k: &str| {
                    support[k]
                        .as_str()
                        .filter(|s| !s.is_empty())
                        .unwrap_or("no")
                        .to_string()
                };
                info!(
                    h264 = %field("h264"),
                    h264_high = %field("h264High"),
                    vp9 = %field("vp9"),
                    av1 = %field("av1"),
                    "browser codec support"
                );
                if field("h264") == "no" && field("h264High") == "no" {
                    warn!("browser cannot play H.264 video; pages with video may render blank");
                }
            }
            Err(e) => {
                warn!(error = %e, "codec probe failed");
                self.codecs_probed.store(false, Ordering::Release);
            }
        }
    }

    /// Tear down the session of `device_id`, if any.
    pub async fn remove_device(&self, device_id: &str) -> bool {
        let Some(slot) = self.slots.get(device_id).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut current = slot.lock().await;
        self.live.remove(device_id);
        match current.take() {
            Some(session) => {
                session.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Tear down sessions idle for longer than `ttl`. Returns how many were
    /// removed; a sweep started while another runs does nothing.
    pub async fn cleanup_idle(&self, ttl: Duration) -> usize {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            debug!("idle sweep already running");
            return 0;
        }
        let _guard = SweepGuard(&self.sweeping);

        let now = Instant::now();
        let stale: Vec<String> = self
            .live
            .iter()
            .filter(|s| s.value().idle_for(now) > ttl)
            .map(|s| s.key().clone())
            .collect();

        let mut removed = 0;
        for device_id in stale {
            let slot = self.slot(&device_id);
            let mut current = slot.lock().await;
            // A client may have reattached while we waited for the slot.
            let expired = current
                .as_ref()
                .is_some_and(|s| s.idle_for(Instant::now()) > ttl);
            if !expired {
                continue;
            }
            if let Some(session) = current.take() {
                info!(device = %device_id, "expiring idle device");
                self.live.remove(&device_id);
                session.shutdown().await;
                removed += 1;
            }
        }

        self.slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |s| s.is_some())
        });
        removed
    }

    /// Run [`DeviceManager::cleanup_idle`] every `period`.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, ttl: Duration, period: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = manager.cleanup_idle(ttl).await;
                if removed > 0 {
                    info!(removed, remaining = manager.device_count(), "idle sweep");
                }
            }
        })
    }

    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.slots.iter().map(|s| s.key().clone()).collect();
        for device_id in ids {
            self.remove_device(&device_id).await;
        }
    }

    pub fn snapshots(&self) -> Vec<DeviceMetrics> {
        self.live.iter().map(|s| s.value().metrics()).collect()
    }
}
