//! Chrome DevTools Protocol runtime over one multiplexed WebSocket.
//!
//! Tabs are attached with flattened sessions, so every page command travels
//! on the browser connection tagged with its `sessionId`. Screencast events
//! are routed back to the page that started them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::browser::{
    BrowserRuntime, CaptureEvent, CaptureOptions, PageHandle, TouchEvent, ViewportSettings,
    ViewportSize,
};
use crate::error::BrowserError;
use crate::protocol::TouchPhase;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingTx = oneshot::Sender<Result<Value, String>>;
type Routes = Arc<DashMap<String, CaptureRoute>>;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_POLL: Duration = Duration::from_millis(250);
const VIEWPORT_SETTLE: Duration = Duration::from_millis(300);
/// Stills handed to a page's consumer ahead of the one waiting in its slot.
const CAPTURE_QUEUE: usize = 1;

struct CdpCommand {
    session_id: Option<String>,
    method: String,
    params: Value,
    response_tx: PendingTx,
}

// ── Capture intake ──────────────────────────────────────────────────

/// Latest-wins intake for one page's screencast. A newer still replaces one
/// the consumer has not picked up yet; the replaced still is returned so the
/// caller can acknowledge it.
#[derive(Default)]
struct CaptureSlot {
    latest: Mutex<Option<CaptureEvent>>,
    ready: Notify,
}

impl CaptureSlot {
    fn put(&self, event: CaptureEvent) -> Option<CaptureEvent> {
        let replaced = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(event);
        self.ready.notify_one();
        replaced
    }

    fn take(&self) -> Option<CaptureEvent> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Route entry of a capturing page. Dropping it stops the forwarder.
struct CaptureRoute {
    slot: Arc<CaptureSlot>,
    forwarder: JoinHandle<()>,
}

impl CaptureRoute {
    fn new(tx: mpsc::Sender<CaptureEvent>) -> Self {
        let slot = Arc::new(CaptureSlot::default());
        let forwarder = tokio::spawn({
            let slot = Arc::clone(&slot);
            async move {
                loop {
                    slot.ready.notified().await;
                    let Some(event) = slot.take() else { continue };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });
        Self { slot, forwarder }
    }
}

impl Drop for CaptureRoute {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

// ── Connection ──────────────────────────────────────────────────────

struct Connection {
    cmd_tx: mpsc::Sender<CdpCommand>,
    routes: Routes,
    _handler: JoinHandle<()>,
}

impl Connection {
    async fn send(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, BrowserError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CdpCommand {
                session_id: session_id.map(str::to_string),
                method: method.into(),
                params,
                response_tx: tx,
            })
            .await
            .map_err(|_| BrowserError::Closed)?;

        let result = tokio::time::timeout(COMMAND_TIMEOUT, rx)
            .await
            .map_err(|_| BrowserError::Timeout {
                timeout_ms: COMMAND_TIMEOUT.as_millis() as u64,
                context: format!("CDP {method}"),
            })?
            .map_err(|_| BrowserError::Closed)?;

        result.map_err(BrowserError::Cdp)
    }
}

/// Browser-level handle; tabs it creates share its connection.
pub struct CdpRuntime {
    conn: Arc<Connection>,
}

impl CdpRuntime {
    /// Connect to `ws_url`, or discover the endpoint on `debug_port`.
    pub async fn connect(ws_url: Option<&str>, debug_port: u16) -> Result<Self, BrowserError> {
        let url = match ws_url {
            Some(url) => url.to_string(),
            None => wait_for_ws_url(debug_port, DISCOVERY_TIMEOUT).await?,
        };
        Self::connect_ws(&url).await
    }

    pub async fn connect_ws(url: &str) -> Result<Self, BrowserError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| BrowserError::Unavailable(format!("WebSocket connect {url}: {e}")))?;
        info!(url, "connected to browser");

        let routes: Routes = Arc::new(DashMap::new());
        let (cmd_tx, cmd_rx) = mpsc::channel::<CdpCommand>(64);
        let handler = tokio::spawn(cdp_handler_loop(ws, cmd_rx, Arc::clone(&routes)));

        Ok(Self {
            conn: Arc::new(Connection {
                cmd_tx,
                routes,
                _handler: handler,
            }),
        })
    }

    /// Browser product string, e.g. `HeadlessChrome/120.0`.
    pub async fn version(&self) -> Result<String, BrowserError> {
        let v = self.conn.send(None, "Browser.getVersion", json!({})).await?;
        Ok(v["product"].as_str().unwrap_or("unknown").to_string())
    }
}

#[async_trait]
impl BrowserRuntime for CdpRuntime {
    async fn acquire_tab(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Arc<dyn PageHandle>, BrowserError> {
        let created = self
            .conn
            .send(
                None,
                "Target.createTarget",
                json!({ "url": "about:blank", "width": width, "height": height }),
            )
            .await?;
        let target_id = required_str(&created, "targetId")?;

        let attached = self
            .conn
            .send(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = required_str(&attached, "sessionId")?;

        let page = CdpPage {
            target_id,
            session_id,
            conn: Arc::clone(&self.conn),
        };
        page.send("Page.enable", json!({})).await?;
        debug!(target = %page.target_id, session = %page.session_id, "tab attached");
        Ok(Arc::new(page))
    }

    async fn release_tab(&self, target_id: &str) -> Result<(), BrowserError> {
        self.conn
            .send(None, "Target.closeTarget", json!({ "targetId": target_id }))
            .await?;
        Ok(())
    }
}

fn required_str(value: &Value, key: &str) -> Result<String, BrowserError> {
    value[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| BrowserError::Protocol(format!("missing {key} in {value}")))
}

// ── Page ────────────────────────────────────────────────────────────

pub struct CdpPage {
    target_id: String,
    session_id: String,
    conn: Arc<Connection>,
}

impl CdpPage {
    async fn send(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        self.conn.send(Some(&self.session_id), method, params).await
    }
}

#[async_trait]
impl PageHandle for CdpPage {
    fn target_id(&self) -> &str {
        &self.target_id
    }

    async fn set_viewport(&self, s: &ViewportSettings) -> Result<ViewportSize, BrowserError> {
        self.send(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": s.width,
                "height": s.height,
                "deviceScaleFactor": 1,
                "mobile": false,
                "screenWidth": s.width,
                "screenHeight": s.height,
                "positionX": 0,
                "positionY": 0,
            }),
        )
        .await?;
        self.send("Emulation.setFocusEmulationEnabled", json!({ "enabled": true }))
            .await?;
        if let Err(e) = self
            .send("Emulation.setLocaleOverride", json!({ "locale": s.locale }))
            .await
        {
            debug!(error = %e, "locale override not applied");
        }
        if s.reduced_motion {
            self.send(
                "Emulation.setEmulatedMedia",
                json!({
                    "media": "screen",
                    "features": [{ "name": "prefers-reduced-motion", "value": "reduce" }],
                }),
            )
            .await?;
        }

        tokio::time::sleep(VIEWPORT_SETTLE).await;

        let value = self
            .evaluate(
                "({ width: window.innerWidth, height: window.innerHeight, dpr: window.devicePixelRatio })",
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| BrowserError::Protocol(format!("viewport report: {e}")))
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let result = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("script threw");
            return Err(BrowserError::Cdp(text.to_string()));
        }
        Ok(result["result"]["value"].clone())
    }

    async fn start_capture(
        &self,
        options: CaptureOptions,
    ) -> Result<mpsc::Receiver<CaptureEvent>, BrowserError> {
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE);
        self.conn
            .routes
            .insert(self.session_id.clone(), CaptureRoute::new(tx));
        let started = self
            .send(
                "Page.startScreencast",
                json!({
                    "format": "png",
                    "maxWidth": options.max_width,
                    "maxHeight": options.max_height,
                    "everyNthFrame": options.every_nth_frame,
                }),
            )
            .await;
        if let Err(e) = started {
            self.conn.routes.remove(&self.session_id);
            return Err(e);
        }
        Ok(rx)
    }

    async fn ack_capture(&self, session_tag: i64) -> Result<(), BrowserError> {
        self.send("Page.screencastFrameAck", json!({ "sessionId": session_tag }))
            .await?;
        Ok(())
    }

    async fn stop_capture(&self) -> Result<(), BrowserError> {
        self.conn.routes.remove(&self.session_id);
        self.send("Page.stopScreencast", json!({})).await?;
        Ok(())
    }

    async fn inject_touch(&self, touch: TouchEvent) -> Result<(), BrowserError> {
        let (kind, points) = match touch.phase {
            TouchPhase::Start => ("touchStart", true),
            TouchPhase::Move => ("touchMove", true),
            TouchPhase::End => ("touchEnd", false),
            TouchPhase::Cancel => ("touchCancel", false),
        };
        let touch_points = if points {
            json!([{ "x": touch.x, "y": touch.y, "id": touch.pointer_id }])
        } else {
            json!([])
        };
        self.send(
            "Input.dispatchTouchEvent",
            json!({ "type": kind, "touchPoints": touch_points }),
        )
        .await?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let result = self.send("Page.navigate", json!({ "url": url })).await?;
        if let Some(err) = result["errorText"].as_str() {
            return Err(BrowserError::Cdp(format!("navigate {url}: {err}")));
        }
        Ok(())
    }
}

// ── Discovery ───────────────────────────────────────────────────────

/// Poll `/json/version` until the browser publishes its WebSocket URL.
pub async fn wait_for_ws_url(port: u16, timeout: Duration) -> Result<String, BrowserError> {
    let url = format!("http://127.0.0.1:{port}/json/version");
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(info) = resp.json::<Value>().await {
                if let Some(ws_url) = info["webSocketDebuggerUrl"].as_str() {
                    info!(
                        browser = info["Browser"].as_str().unwrap_or("unknown"),
                        "browser debugger found"
                    );
                    return Ok(ws_url.to_string());
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(BrowserError::Unavailable(format!(
                "no debugger on port {port} after {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(DISCOVERY_POLL).await;
    }
}

// ── Handler loop ────────────────────────────────────────────────────

/// Owns the socket: writes commands, resolves responses, routes events.
async fn cdp_handler_loop(ws: WsStream, mut cmd_rx: mpsc::Receiver<CdpCommand>, routes: Routes) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();
    let next_id = AtomicU64::new(1);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let mut msg = json!({
                    "id": id,
                    "method": cmd.method,
                    "params": cmd.params,
                });
                if let Some(session_id) = cmd.session_id {
                    msg["sessionId"] = Value::String(session_id);
                }
                prune_abandoned(&mut pending);
                pending.insert(id, cmd.response_tx);
                if ws_tx.send(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(val) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };

                if let Some(id) = val.get("id").and_then(Value::as_u64) {
                    if let Some(tx) = pending.remove(&id) {
                        if let Some(err) = val.get("error") {
                            let msg = err["message"].as_str().unwrap_or("CDP error");
                            let _ = tx.send(Err(msg.into()));
                        } else {
                            let _ = tx.send(Ok(val["result"].clone()));
                        }
                    }
                    continue;
                }

                if val["method"] == "Page.screencastFrame" {
                    if let Some(ack) = route_screencast_frame(&routes, &val) {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        if ws_tx.send(Message::Text(ack(id).into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    warn!(pending = pending.len(), "browser connection closed");
    routes.clear();
}

/// Forget commands whose callers stopped waiting, e.g. after a timeout.
fn prune_abandoned(pending: &mut HashMap<u64, PendingTx>) {
    pending.retain(|_, tx| !tx.is_closed());
}

/// Hand a still to its page. When a still goes unconsumed, either this one
/// (no route, bad data) or an older one it replaced, return an ack message
/// builder for it so the browser keeps producing.
fn route_screencast_frame(routes: &Routes, event: &Value) -> Option<impl FnOnce(u64) -> String> {
    let session_id = event["sessionId"].as_str()?.to_string();
    let params = &event["params"];
    let session_tag = params["sessionId"].as_i64()?;

    let unconsumed = match params["data"]
        .as_str()
        .map(|b64| base64::engine::general_purpose::STANDARD.decode(b64))
    {
        Some(Ok(data)) => match routes.get(&session_id) {
            Some(route) => route
                .slot
                .put(CaptureEvent {
                    session_tag,
                    data: Bytes::from(data),
                })
                .map(|older| older.session_tag),
            None => Some(session_tag),
        },
        _ => {
            warn!(session = %session_id, "screencast frame without decodable data");
            Some(session_tag)
        }
    };

    let session_tag = unconsumed?;
    trace!(session = %session_id, session_tag, "screencast frame dropped");
    Some(move |id: u64| {
        json!({
            "id": id,
            "sessionId": session_id,
            "method": "Page.screencastFrameAck",
            "params": { "sessionId": session_tag },
        })
        .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimal browser: answers every command, and after
    /// `Page.startScreencast` pushes one still for that session.
    async fn fake_browser() -> (String, mpsc::UnboundedReceiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let cmd: Value = serde_json::from_str(text.as_str()).unwrap();
                let _ = seen_tx.send(cmd.clone());
                let result = match cmd["method"].as_str().unwrap_or_default() {
                    "Target.createTarget" => json!({ "targetId": "T1" }),
                    "Target.attachToTarget" => json!({ "sessionId": "S1" }),
                    "Runtime.evaluate" => json!({ "result": { "value": 42 } }),
                    "Page.navigate" => json!({ "errorText": "net::ERR_NAME_NOT_RESOLVED" }),
                    _ => json!({}),
                };
                let reply = if cmd["method"] == "Emulation.setLocaleOverride" {
                    json!({ "id": cmd["id"], "error": { "message": "not supported" } })
                } else {
                    json!({ "id": cmd["id"], "result": result })
                };
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();

                if cmd["method"] == "Page.startScreencast" {
                    let data = base64::engine::general_purpose::STANDARD.encode(b"still");
                    let event = json!({
                        "method": "Page.screencastFrame",
                        "sessionId": cmd["sessionId"],
                        "params": { "data": data, "sessionId": 7, "metadata": {} },
                    });
                    ws.send(Message::Text(event.to_string().into())).await.unwrap();
                }
            }
        });

        (format!("ws://{addr}"), seen_rx)
    }

    #[tokio::test]
    async fn acquire_tab_uses_flattened_session() {
        let (url, mut seen) = fake_browser().await;
        let runtime = CdpRuntime::connect_ws(&url).await.unwrap();
        let page = runtime.acquire_tab(320, 240).await.unwrap();
        assert_eq!(page.target_id(), "T1");

        let create = seen.recv().await.unwrap();
        assert_eq!(create["method"], "Target.createTarget");
        assert_eq!(create["params"]["width"], 320);
        assert!(create.get("sessionId").is_none());

        let attach = seen.recv().await.unwrap();
        assert_eq!(attach["params"]["flatten"], true);

        let enable = seen.recv().await.unwrap();
        assert_eq!(enable["method"], "Page.enable");
        assert_eq!(enable["sessionId"], "S1");
    }

    #[tokio::test]
    async fn evaluate_returns_value_and_errors_propagate() {
        let (url, _seen) = fake_browser().await;
        let runtime = CdpRuntime::connect_ws(&url).await.unwrap();
        let page = runtime.acquire_tab(100, 100).await.unwrap();
        assert_eq!(page.evaluate("6 * 7").await.unwrap(), json!(42));

        let err = page.navigate("http://nowhere.invalid").await.unwrap_err();
        assert!(err.to_string().contains("ERR_NAME_NOT_RESOLVED"));
    }

    #[tokio::test]
    async fn screencast_frames_are_routed_to_their_page() {
        let (url, mut seen) = fake_browser().await;
        let runtime = CdpRuntime::connect_ws(&url).await.unwrap();
        let page = runtime.acquire_tab(100, 100).await.unwrap();
        let mut frames = page
            .start_capture(CaptureOptions {
                max_width: 100,
                max_height: 100,
                every_nth_frame: 1,
            })
            .await
            .unwrap();

        let event = frames.recv().await.unwrap();
        assert_eq!(event.session_tag, 7);
        assert_eq!(&event.data[..], b"still");

        page.ack_capture(event.session_tag).await.unwrap();
        let ack = loop {
            let cmd = seen.recv().await.unwrap();
            if cmd["method"] == "Page.screencastFrameAck" {
                break cmd;
            }
        };
        assert_eq!(ack["params"]["sessionId"], 7);
        assert_eq!(ack["sessionId"], "S1");
    }

    #[tokio::test]
    async fn unrouted_frames_are_acked_by_the_loop() {
        let routes: Routes = Arc::new(DashMap::new());
        let event = json!({
            "method": "Page.screencastFrame",
            "sessionId": "S9",
            "params": { "data": "c3RpbGw=", "sessionId": 3 },
        });
        let ack = route_screencast_frame(&routes, &event).expect("ack expected");
        let msg: Value = serde_json::from_str(&ack(99)).unwrap();
        assert_eq!(msg["id"], 99);
        assert_eq!(msg["method"], "Page.screencastFrameAck");
        assert_eq!(msg["params"]["sessionId"], 3);
    }

    fn frame_event(session: &str, tag: i64, data: &[u8]) -> Value {
        json!({
            "method": "Page.screencastFrame",
            "sessionId": session,
            "params": {
                "data": base64::engine::general_purpose::STANDARD.encode(data),
                "sessionId": tag,
            },
        })
    }

    #[tokio::test]
    async fn newer_still_replaces_an_unconsumed_one() {
        let routes: Routes = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::channel(CAPTURE_QUEUE);
        routes.insert("S1".into(), CaptureRoute::new(tx));

        // The forwarder has not run yet, so the first still is still waiting.
        assert!(route_screencast_frame(&routes, &frame_event("S1", 1, b"old")).is_none());
        let ack = route_screencast_frame(&routes, &frame_event("S1", 2, b"new"))
            .expect("replaced still must be acked");
        let msg: Value = serde_json::from_str(&ack(5)).unwrap();
        assert_eq!(msg["params"]["sessionId"], 1);
        assert_eq!(msg["sessionId"], "S1");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_tag, 2);
        assert_eq!(&event.data[..], b"new");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn abandoned_commands_are_pruned() {
        let mut pending: HashMap<u64, PendingTx> = HashMap::new();
        let (waiting_tx, _waiting_rx) = oneshot::channel();
        let (gone_tx, gone_rx) = oneshot::channel();
        pending.insert(1, waiting_tx);
        pending.insert(2, gone_tx);
        drop(gone_rx);

        prune_abandoned(&mut pending);
        assert_eq!(pending.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn dropping_a_route_closes_its_stream() {
        let routes: Routes = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::channel(CAPTURE_QUEUE);
        routes.insert("S1".into(), CaptureRoute::new(tx));
        routes.remove("S1");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn locale_failure_is_tolerated() {
        let (url, _seen) = fake_browser().await;
        let runtime = CdpRuntime::connect_ws(&url).await.unwrap();
        let page = runtime.acquire_tab(100, 100).await.unwrap();
        // The fake reports 42 for every evaluation, which is not a size.
        let err = page
            .set_viewport(&ViewportSettings {
                width: 100,
                height: 100,
                locale: "de-DE".into(),
                reduced_motion: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::Protocol(_)));
    }

    #[tokio::test]
    async fn discovery_gives_up_after_timeout() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = wait_for_ws_url(port, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, BrowserError::Unavailable(_)));
    }
}
