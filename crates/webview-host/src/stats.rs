//! Per-device telemetry and periodic JSON snapshots.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::ClientFrameStats;

// ── Throughput windows (1/5/15m) ────────────────────────────────────

const LONGEST_WINDOW: Duration = Duration::from_secs(15 * 60);

struct Sample {
    at: Instant,
    bytes: usize,
}

#[derive(Default)]
pub struct ThroughputTracker {
    samples: Vec<Sample>,
}

impl ThroughputTracker {
    pub fn record(&mut self, bytes: usize) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, at: Instant, bytes: usize) {
        self.samples.push(Sample { at, bytes });
        if let Some(cutoff) = at.checked_sub(LONGEST_WINDOW) {
            self.samples.retain(|s| s.at >= cutoff);
        }
    }

    /// Average bytes/sec over the trailing `window`.
    fn bps_at(&self, now: Instant, window: Duration) -> f64 {
        if window.is_zero() {
            return 0.0;
        }
        let cutoff = now.checked_sub(window);
        let total: usize = self
            .samples
            .iter()
            .filter(|s| cutoff.map_or(true, |c| s.at >= c))
            .map(|s| s.bytes)
            .sum();
        total as f64 / window.as_secs_f64()
    }

    pub fn windows(&self) -> (f64, f64, f64) {
        let now = Instant::now();
        (
            self.bps_at(now, Duration::from_secs(60)),
            self.bps_at(now, Duration::from_secs(300)),
            self.bps_at(now, LONGEST_WINDOW),
        )
    }
}

// ── Device stats ────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    frames_sent: u64,
    full_frames: u64,
    chunks_sent: u64,
    bytes_sent: u64,
    duplicates_skipped: u64,
    superseded: u64,
    pipeline_errors: u64,
    client_reports: u64,
    last_client: Option<ClientFrameStats>,
    throughput: ThroughputTracker,
}

/// Counters for one device session, shared by its pipeline and the router.
pub struct DeviceStats {
    created_at: u64,
    inner: Mutex<Counters>,
}

impl Default for DeviceStats {
    fn default() -> Self {
        Self {
            created_at: now_millis(),
            inner: Mutex::new(Counters::default()),
        }
    }
}

impl DeviceStats {
    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_frame(&self, bytes: usize, chunks: usize, full_frame: bool) {
        let mut c = self.lock();
        c.frames_sent += 1;
        c.chunks_sent += chunks as u64;
        c.bytes_sent += bytes as u64;
        if full_frame {
            c.full_frames += 1;
        }
        c.throughput.record(bytes);
    }

    pub fn record_duplicate(&self) {
        self.lock().duplicates_skipped += 1;
    }

    pub fn record_superseded(&self) {
        self.lock().superseded += 1;
    }

    pub fn record_error(&self) {
        self.lock().pipeline_errors += 1;
    }

    pub fn record_client_stats(&self, stats: ClientFrameStats) {
        let mut c = self.lock();
        c.client_reports += 1;
        c.last_client = Some(stats);
    }

    pub fn frames_sent(&self) -> u64 {
        self.lock().frames_sent
    }

    pub fn duplicates_skipped(&self) -> u64 {
        self.lock().duplicates_skipped
    }

    pub fn snapshot(&self, device_id: &str, clients: usize, width: u32, height: u32) -> DeviceMetrics {
        let c = self.lock();
        let (bps1, bps5, bps15) = c.throughput.windows();
        DeviceMetrics {
            device_id: device_id.to_string(),
            width,
            height,
            clients,
            created_at: self.created_at,
            updated_at: now_millis(),
            frames_sent: c.frames_sent,
            full_frames: c.full_frames,
            chunks_sent: c.chunks_sent,
            bytes_sent: c.bytes_sent,
            duplicates_skipped: c.duplicates_skipped,
            superseded_stills: c.superseded,
            pipeline_errors: c.pipeline_errors,
            client_reports: c.client_reports,
            last_client_frame_id: c.last_client.map(|s| s.frame_id),
            last_client_decode_ms: c.last_client.map(|s| s.decode_ms),
            last_client_draw_ms: c.last_client.map(|s| s.draw_ms),
            bps1,
            bps5,
            bps15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetrics {
    pub device_id: String,
    pub width: u32,
    pub height: u32,
    pub clients: usize,
    pub created_at: u64,
    pub updated_at: u64,
    pub frames_sent: u64,
    pub full_frames: u64,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub duplicates_skipped: u64,
    pub superseded_stills: u64,
    pub pipeline_errors: u64,
    pub client_reports: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_client_frame_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_client_decode_ms: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_client_draw_ms: Option<u16>,
    /// 1-minute bytes/sec rolling average
    pub bps1: f64,
    /// 5-minute bytes/sec rolling average
    pub bps5: f64,
    /// 15-minute bytes/sec rolling average
    pub bps15: f64,
}

// ── Snapshot files ──────────────────────────────────────────────────

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// File-name-safe form of a device id.
pub fn sanitize_id(device_id: &str) -> String {
    let out: String = device_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "device".to_string()
    } else {
        out
    }
}

/// Write to a temp file then rename, so readers never see a partial file.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json)?;
    fs::rename(&tmp_path, path)
}

/// Write one `<device>.json` per snapshot into `dir`. Failures are logged.
pub fn write_snapshots(dir: &Path, snapshots: &[DeviceMetrics]) -> Vec<PathBuf> {
    if let Err(e) = fs::create_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "cannot create stats dir");
        return Vec::new();
    }
    let mut written = Vec::with_capacity(snapshots.len());
    for snap in snapshots {
        let path = dir.join(format!("{}.json", sanitize_id(&snap.device_id)));
        match atomic_write_json(&path, snap) {
            Ok(()) => written.push(path),
            Err(e) => warn!(path = %path.display(), error = %e, "stats write failed"),
        }
    }
    written
}
