//! Media-source monitor.
//!
//! The control plane can ask the agent to watch one OBS media input and push
//! coarse state events upstream, independently of whatever events the relay
//! filters. The monitor runs a pull loop on its own authenticated OBS
//! connection (events suppressed) and emits synthetic op-5 `AgentSourceState`
//! events through the bridge's relay writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::obs::{self, ObsStream};

/// Configuration pushed from the relay via `AgentConfigureMonitor`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub poll_interval_ms: i64,
    #[serde(default)]
    pub enabled: bool,
}

/// Floor for the poll cadence, whatever the relay asks for.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Scene index lifetime between rebuilds.
const SCENE_INDEX_TTL: Duration = Duration::from_secs(30);

/// Per-request deadline on the monitor OBS connection.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames scanned per request while looking for the matching response.
const MAX_RESPONSE_SCAN: usize = 10;

/// Map an OBS media state to the coarse upstream state. Playing is "normal",
/// every other known state is "buffering"; callers fall back to "offline"
/// for unknown states and connection failures.
fn coarse_state(media_state: &str) -> Option<&'static str> {
    match media_state {
        "OBS_MEDIA_STATE_PLAYING" => Some("normal"),
        "OBS_MEDIA_STATE_OPENING"
        | "OBS_MEDIA_STATE_BUFFERING"
        | "OBS_MEDIA_STATE_ENDED"
        | "OBS_MEDIA_STATE_ERROR"
        | "OBS_MEDIA_STATE_STOPPED"
        | "OBS_MEDIA_STATE_NONE" => Some("buffering"),
        _ => None,
    }
}

/// Callback that hands an event payload to the relay writer.
pub type SendEvent = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

struct ActivePoll {
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
}

/// Polls one OBS media input and pushes state events upstream.
///
/// Owns its OBS connection end to end; the bridge only hands it the writer
/// callback at construction, so there are no back-references.
pub struct Monitor {
    obs_addr: String,
    obs_pass: String,
    send_event: SendEvent,
    active: Mutex<Option<ActivePoll>>,
}

impl Monitor {
    pub fn new(obs_addr: String, obs_pass: String, send_event: SendEvent) -> Self {
        Self {
            obs_addr,
            obs_pass,
            send_event,
            active: Mutex::new(None),
        }
    }

    /// Apply a config pushed from the relay: stop any running poll loop
    /// (waiting for it to wind down), then start a new one iff enabled with
    /// a non-empty source. The interval is clamped to at least 500 ms.
    pub async fn configure(&self, cfg: MonitorConfig) {
        let mut active = self.active.lock().await;
        stop_active(&mut active).await;

        if !cfg.enabled || cfg.source.is_empty() {
            info!(source = %cfg.source, enabled = cfg.enabled, "monitor disabled");
            return;
        }

        let interval = Duration::from_millis(cfg.poll_interval_ms.max(0) as u64)
            .max(MIN_POLL_INTERVAL);

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        info!(
            source = %cfg.source,
            interval_ms = interval.as_millis() as u64,
            "monitor configured"
        );

        tokio::spawn(poll_loop(PollParams {
            obs_addr: self.obs_addr.clone(),
            obs_pass: self.obs_pass.clone(),
            source: cfg.source,
            interval,
            send_event: self.send_event.clone(),
            cancel: cancel.clone(),
            done: done_tx,
        }));

        *active = Some(ActivePoll {
            cancel,
            done: done_rx,
        });
    }

    /// Stop the poll loop and block until it has fully terminated, closing
    /// any open monitor OBS connection on the way out.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        stop_active(&mut active).await;
    }
}

async fn stop_active(active: &mut Option<ActivePoll>) {
    if let Some(poll) = active.take() {
        poll.cancel.cancel();
        let _ = poll.done.await;
    }
}

struct PollParams {
    obs_addr: String,
    obs_pass: String,
    source: String,
    interval: Duration,
    send_event: SendEvent,
    cancel: CancellationToken,
    done: oneshot::Sender<()>,
}

/// Ticker-driven poll. Manages its own OBS connection and scene index.
async fn poll_loop(params: PollParams) {
    let PollParams {
        obs_addr,
        obs_pass,
        source,
        interval,
        send_event,
        cancel,
        done,
    } = params;

    let mut conn: Option<ObsStream> = None;
    let mut scene_index: HashMap<String, String> = HashMap::new();
    let mut index_refreshed_at: Option<Instant> = None;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick would race the bridge's synthetic op-7
    // response; wait one full interval instead.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("monitor poll loop stopped");
                break;
            }
            _ = ticker.tick() => {
                if conn.is_none() {
                    match obs::connect_monitor(&obs_addr, &obs_pass).await {
                        Ok(stream) => {
                            debug!("monitor OBS connection established");
                            conn = Some(stream);
                            // Stale index may describe a different OBS session
                            index_refreshed_at = None;
                        }
                        Err(e) => {
                            warn!("monitor OBS connect failed: {}", e);
                            send_state(&send_event, &source, "", "offline", "");
                            continue;
                        }
                    }
                }
                let Some(stream) = conn.as_mut() else {
                    continue;
                };

                if index_refreshed_at.map_or(true, |at| at.elapsed() >= SCENE_INDEX_TTL) {
                    match build_scene_index(stream).await {
                        Ok(index) => {
                            debug!(sources = index.len(), "scene index refreshed");
                            scene_index = index;
                            index_refreshed_at = Some(Instant::now());
                        }
                        Err(e) => warn!("scene index refresh failed: {}", e),
                    }
                }
                let containing_scene = scene_index.get(&source).cloned().unwrap_or_default();

                match poll_media_state(stream, &source).await {
                    Ok(media_state) => {
                        let state = coarse_state(&media_state).unwrap_or("offline");
                        send_state(&send_event, &source, &media_state, state, &containing_scene);
                    }
                    Err(e) => {
                        warn!("monitor poll failed: {}", e);
                        if let Some(mut stream) = conn.take() {
                            let _ = stream.close(None).await;
                        }
                        send_state(&send_event, &source, "", "offline", &containing_scene);
                    }
                }
            }
        }
    }

    if let Some(mut stream) = conn.take() {
        let _ = stream.close(None).await;
    }
    let _ = done.send(());
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, thiserror::Error)]
enum PollError {
    #[error("encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("write request: {0}")]
    Write(String),
    #[error("read response: {0}")]
    Read(String),
    #[error("request timed out")]
    Timeout,
    #[error("no matching response after 10 messages")]
    NoMatchingResponse,
}

/// Issue one op-6 request on the monitor connection and scan for the op-7
/// response with the matching request id, skipping anything else.
async fn obs_request(
    stream: &mut ObsStream,
    request_type: &str,
    request_data: Option<Value>,
) -> Result<Value, PollError> {
    let request_id = format!("mon-{}-{}", request_type, now_millis());

    let mut d = json!({
        "requestType": request_type,
        "requestId": request_id,
    });
    if let Some(data) = request_data {
        d["requestData"] = data;
    }
    let text = serde_json::to_string(&json!({"op": 6, "d": d}))?;

    match tokio::time::timeout(REQUEST_TIMEOUT, stream.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(PollError::Write(e.to_string())),
        Err(_) => return Err(PollError::Timeout),
    }

    let deadline = tokio::time::Instant::now() + REQUEST_TIMEOUT;
    for _ in 0..MAX_RESPONSE_SCAN {
        let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(msg) => msg,
            Err(_) => return Err(PollError::Timeout),
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                return Err(PollError::Read("connection closed".into()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(PollError::Read(e.to_string())),
        };

        let frame: Value = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };

        if frame.get("op").and_then(|v| v.as_i64()) == Some(7)
            && frame
                .get("d")
                .and_then(|d| d.get("requestId"))
                .and_then(|v| v.as_str())
                == Some(request_id.as_str())
        {
            let response_data = frame
                .get("d")
                .and_then(|d| d.get("responseData"))
                .cloned()
                .unwrap_or_else(|| json!({}));
            return Ok(response_data);
        }
    }

    Err(PollError::NoMatchingResponse)
}

/// `GetMediaInputStatus` for the watched source.
async fn poll_media_state(stream: &mut ObsStream, source: &str) -> Result<String, PollError> {
    let response = obs_request(
        stream,
        "GetMediaInputStatus",
        Some(json!({"inputName": source})),
    )
    .await?;

    Ok(response
        .get("mediaState")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("OBS_MEDIA_STATE_NONE")
        .to_string())
}

/// Walk all scenes to map source name -> containing scene name. On collision
/// a source keeps its first-seen scene.
async fn build_scene_index(stream: &mut ObsStream) -> Result<HashMap<String, String>, PollError> {
    let scenes = obs_request(stream, "GetSceneList", None).await?;

    let mut index = HashMap::new();
    let scene_list = match scenes.get("scenes").and_then(|v| v.as_array()) {
        Some(list) => list,
        None => return Ok(index),
    };

    for scene in scene_list {
        let scene_name = match scene.get("sceneName").and_then(|v| v.as_str()) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => continue,
        };

        let items = match obs_request(
            stream,
            "GetSceneItemList",
            Some(json!({"sceneName": scene_name})),
        )
        .await
        {
            Ok(items) => items,
            Err(_) => continue,
        };

        if let Some(item_list) = items.get("sceneItems").and_then(|v| v.as_array()) {
            for item in item_list {
                if let Some(source_name) = item.get("sourceName").and_then(|v| v.as_str()) {
                    if !source_name.is_empty() {
                        index
                            .entry(source_name.to_string())
                            .or_insert_with(|| scene_name.clone());
                    }
                }
            }
        }
    }

    Ok(index)
}

/// Build the synthetic op-5 `AgentSourceState` event and hand it to the
/// relay writer callback.
fn send_state(
    send_event: &SendEvent,
    input_name: &str,
    media_state: &str,
    state: &str,
    containing_scene: &str,
) {
    let event = json!({
        "op": 5,
        "d": {
            "eventType": "AgentSourceState",
            "eventIntent": 1,
            "eventData": {
                "inputName": input_name,
                "mediaState": media_state,
                "state": state,
                "containingScene": containing_scene,
            },
        },
    });

    match serde_json::to_vec(&event) {
        Ok(bytes) => send_event(bytes),
        Err(e) => warn!("failed to encode monitor event: {}", e),
    }
}
