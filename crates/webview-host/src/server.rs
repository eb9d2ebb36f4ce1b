//! WebSocket front door: one socket is one subscription to one device.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::{ClientParams, DeviceConfig};
use crate::input::InputRouter;
use crate::manager::DeviceManager;

pub struct ServerState {
    pub manager: Arc<DeviceManager>,
    pub router: InputRouter,
    pub device_defaults: DeviceConfig,
}

impl ServerState {
    pub fn new(manager: Arc<DeviceManager>, device_defaults: DeviceConfig) -> Self {
        Self {
            router: InputRouter::new(Arc::clone(&manager)),
            manager,
            device_defaults,
        }
    }
}

/// Accept clients until the listener fails permanently.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                tokio::spawn(handle_client(stream, peer, Arc::clone(&state)));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

// ── Client handler ──────────────────────────────────────────────────

async fn handle_client(stream: TcpStream, peer: SocketAddr, state: Arc<ServerState>) {
    let mut query: Option<String> = None;
    let capture_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_string);
        Ok(resp)
    };
    let ws = match accept_hdr_async(stream, capture_query).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };

    let ClientParams { device_id, config } =
        ClientParams::from_query(query.as_deref(), &state.device_defaults);
    info!(
        %peer,
        device = %device_id,
        width = config.width,
        height = config.height,
        tile = config.tile_size,
        quality = config.jpeg_quality,
        interval_ms = config.min_frame_interval.as_millis() as u64,
        rotation = config.rotation.degrees(),
        "client connected"
    );

    let broadcaster = Arc::clone(state.manager.broadcaster());
    // Subscribe first so the initial full frame finds this client.
    let mut frames = broadcaster.subscribe(&device_id);
    let (mut ws_tx, mut ws_rx) = ws.split();

    if let Err(e) = state.manager.ensure_device(&device_id, &config).await {
        warn!(device = %device_id, error = %e, "device unavailable");
        let _ = ws_tx.send(Message::Close(None)).await;
        drop(frames);
        broadcaster.prune(&device_id);
        return;
    }

    // Forward this device's frames to the socket.
    let forwarder = {
        let manager = Arc::clone(&state.manager);
        let device_id = device_id.clone();
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(chunk) => {
                        if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(device = %device_id, skipped, "client lagged; resending full frame");
                        if let Some(session) = manager.get(&device_id) {
                            session.request_full_frame();
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                state.router.route(&device_id, &data);
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(_)) => debug!(device = %device_id, "ignoring text message"),
            Ok(_) => {}
            Err(e) => {
                debug!(device = %device_id, error = %e, "client read error");
                break;
            }
        }
    }

    if let Some(session) = state.manager.get(&device_id) {
        session.touch();
    }
    forwarder.abort();
    let _ = forwarder.await;
    broadcaster.prune(&device_id);
    info!(%peer, device = %device_id, "client disconnected");
}
