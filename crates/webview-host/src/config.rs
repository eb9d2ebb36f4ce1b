//! Server settings (environment) and per-device stream configuration
//! (client connection query).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

pub const DEFAULT_DEVICE_ID: &str = "default";

/// Largest page edge a frame rectangle can describe on the wire.
pub const MAX_DIMENSION: u32 = u16::MAX as u32;

// ── Rotation ────────────────────────────────────────────────────────

/// Clockwise rotation applied to captured stills before diffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Cw90),
            180 => Some(Rotation::Cw180),
            270 => Some(Rotation::Cw270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }

    /// Map a point on the (rotated) display back into page coordinates.
    /// `page_width`/`page_height` are the unrotated tab dimensions.
    pub fn display_to_page(self, x: u32, y: u32, page_width: u32, page_height: u32) -> (u32, u32) {
        let max_x = page_width.saturating_sub(1);
        let max_y = page_height.saturating_sub(1);
        let (px, py) = match self {
            Rotation::None => (x, y),
            Rotation::Cw90 => (y, max_y.saturating_sub(x)),
            Rotation::Cw180 => (max_x.saturating_sub(x), max_y.saturating_sub(y)),
            Rotation::Cw270 => (max_x.saturating_sub(y), x),
        };
        (px.min(max_x), py.min(max_y))
    }
}

// ── DeviceConfig ────────────────────────────────────────────────────

/// Everything that shapes one device's stream. Two configs are equal only if
/// every field matches; any difference means the tab is recreated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub full_frame_tile_count: usize,
    pub full_frame_area_threshold: f64,
    pub jpeg_quality: u8,
    /// Force a full frame every N processed frames (0 disables).
    pub full_frame_every: u32,
    #[serde(serialize_with = "serialize_millis")]
    pub min_frame_interval: Duration,
    pub max_bytes_per_message: usize,
    pub every_nth_frame: u32,
    pub rotation: Rotation,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            width: 480,
            height: 480,
            tile_size: 32,
            full_frame_tile_count: 4,
            full_frame_area_threshold: 0.5,
            jpeg_quality: 85,
            full_frame_every: 50,
            min_frame_interval: Duration::from_millis(80),
            max_bytes_per_message: 14_336,
            every_nth_frame: 1,
            rotation: Rotation::None,
        }
    }
}

/// Device id plus stream configuration requested by a connecting client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientParams {
    pub device_id: String,
    pub config: DeviceConfig,
}

impl ClientParams {
    /// Parse the query string of a client connection URL. Unknown keys are
    /// ignored; unparseable values keep the default.
    pub fn from_query(query: Option<&str>, defaults: &DeviceConfig) -> Self {
        let mut device_id = DEFAULT_DEVICE_ID.to_string();
        let mut cfg = defaults.clone();

        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            let value = value.trim();
            match key.as_ref() {
                "id" => {
                    if !value.is_empty() {
                        device_id = value.to_string();
                    }
                }
                "w" | "width" => parse_into(&key, value, &mut cfg.width),
                "h" | "height" => parse_into(&key, value, &mut cfg.height),
                "tileSize" => parse_into(&key, value, &mut cfg.tile_size),
                "fullFrameTileCount" => parse_into(&key, value, &mut cfg.full_frame_tile_count),
                "fullFrameAreaThreshold" => {
                    parse_into(&key, value, &mut cfg.full_frame_area_threshold)
                }
                "jpegQuality" => parse_into(&key, value, &mut cfg.jpeg_quality),
                "fullFrameEvery" => parse_into(&key, value, &mut cfg.full_frame_every),
                "everyNthFrame" => parse_into(&key, value, &mut cfg.every_nth_frame),
                "maxBytesPerMessage" => parse_into(&key, value, &mut cfg.max_bytes_per_message),
                "minFrameInterval" => {
                    let mut ms = cfg.min_frame_interval.as_millis() as u64;
                    parse_into(&key, value, &mut ms);
                    cfg.min_frame_interval = Duration::from_millis(ms);
                }
                "rotation" => {
                    let mut degrees = cfg.rotation.degrees();
                    parse_into(&key, value, &mut degrees);
                    match Rotation::from_degrees(degrees) {
                        Some(rotation) => cfg.rotation = rotation,
                        None => warn!(value, "ignoring unsupported rotation"),
                    }
                }
                _ => {}
            }
        }

        Self {
            device_id,
            config: cfg.clamped(),
        }
    }
}

impl DeviceConfig {
    fn clamped(mut self) -> Self {
        self.width = self.width.clamp(1, MAX_DIMENSION);
        self.height = self.height.clamp(1, MAX_DIMENSION);
        self.tile_size = self.tile_size.max(8);
        self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
        self.every_nth_frame = self.every_nth_frame.max(1);
        if !self.full_frame_area_threshold.is_finite() || self.full_frame_area_threshold < 0.0 {
            self.full_frame_area_threshold = DeviceConfig::default().full_frame_area_threshold;
        }
        self
    }

    /// Dimensions of the frames the client displays (rotation applied).
    pub fn display_size(&self) -> (u32, u32) {
        match self.rotation {
            Rotation::Cw90 | Rotation::Cw270 => (self.height, self.width),
            Rotation::None | Rotation::Cw180 => (self.width, self.height),
        }
    }
}

fn parse_into<T: FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "ignoring invalid device parameter"),
    }
}

// ── ServerConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ws_bind: String,
    pub ws_port: u16,
    pub debug_port: u16,
    pub cdp_ws_url: Option<String>,
    pub idle_ttl: Duration,
    pub idle_sweep_interval: Duration,
    pub browser_locale: String,
    pub prefers_reduced_motion: bool,
    pub stats_dir: Option<PathBuf>,
    pub stats_interval: Duration,
    pub start_url: Option<String>,
    pub device_defaults: DeviceConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ws_bind: env::var("WS_BIND").unwrap_or(defaults.ws_bind),
            ws_port: env_parse("WS_PORT").unwrap_or(defaults.ws_port),
            debug_port: env_parse("DEBUG_PORT").unwrap_or(defaults.debug_port),
            cdp_ws_url: env_string("CDP_WS_URL"),
            idle_ttl: env_parse("IDLE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_ttl),
            idle_sweep_interval: env_parse("IDLE_SWEEP_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_sweep_interval),
            browser_locale: env_string("BROWSER_LOCALE").unwrap_or(defaults.browser_locale),
            prefers_reduced_motion: env_bool("PREFERS_REDUCED_MOTION"),
            stats_dir: env_string("STATS_DIR").map(PathBuf::from),
            stats_interval: env_parse("STATS_INTERVAL_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.stats_interval),
            start_url: env_string("START_URL"),
            device_defaults: DeviceConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_bind: "0.0.0.0".to_string(),
            ws_port: 8081,
            debug_port: 9221,
            cdp_ws_url: None,
            idle_ttl: Duration::from_secs(5 * 60),
            idle_sweep_interval: Duration::from_secs(60),
            browser_locale: "en-US".to_string(),
            prefers_reduced_motion: false,
            stats_dir: None,
            stats_interval: Duration::from_secs(5),
            start_url: None,
            device_defaults: DeviceConfig::default(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key)?.parse().ok()
}

fn env_bool(key: &str) -> bool {
    env_string(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
