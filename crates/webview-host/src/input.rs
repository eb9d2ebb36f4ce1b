//! Routes client control messages to the device they are attached to.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::manager::DeviceManager;
use crate::protocol::ControlMessage;

pub struct InputRouter {
    manager: Arc<DeviceManager>,
}

impl InputRouter {
    pub fn new(manager: Arc<DeviceManager>) -> Self {
        Self { manager }
    }

    /// Handle one binary message from a client of `device_id`. Any valid
    /// message counts as activity. Browser work runs on a spawned task, whose
    /// handle is returned. Malformed messages are logged and ignored.
    pub fn route(&self, device_id: &str, data: &[u8]) -> Option<JoinHandle<()>> {
        let msg = match ControlMessage::decode(data) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(device = %device_id, tag = data[0], "ignoring unknown message");
                return None;
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "malformed control message");
                return None;
            }
        };
        let Some(session) = self.manager.get(device_id) else {
            debug!(device = %device_id, "message for a device that is not running");
            return None;
        };
        session.touch();

        match msg {
            ControlMessage::Keepalive => None,
            ControlMessage::FrameStats(stats) => {
                session.stats().record_client_stats(stats);
                None
            }
            ControlMessage::Touch(touch) => Some(tokio::spawn(async move {
                if let Err(e) = session.inject_touch(touch).await {
                    warn!(device = %session.device_id(), error = %e, "touch injection failed");
                }
            })),
            ControlMessage::OpenUrl(raw) => {
                let url = match validate_url(&raw) {
                    Ok(url) => url,
                    Err(reason) => {
                        warn!(device = %device_id, url = %raw, reason, "refusing to open url");
                        return None;
                    }
                };
                Some(tokio::spawn(async move {
                    match session.navigate(url.as_str()).await {
                        Ok(()) => debug!(device = %session.device_id(), url = %url, "navigated"),
                        Err(e) => warn!(
                            device = %session.device_id(),
                            url = %url,
                            error = %e,
                            "navigation failed"
                        ),
                    }
                }))
            }
        }
    }
}

/// Only web pages and `about:` documents may be opened from a display.
pub fn validate_url(raw: &str) -> Result<Url, &'static str> {
    let parsed = Url::parse(raw).map_err(|_| "invalid url")?;
    match parsed.scheme() {
        "about" => Ok(parsed),
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        "http" | "https" => Err("missing host"),
        "file" | "data" | "javascript" => Err("blocked scheme"),
        _ => Err("unsupported scheme"),
    }
}
