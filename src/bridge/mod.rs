//! Bidirectional envelope bridge between local OBS and the relay.
//!
//! Everything read from the relay is verified (HMAC + timestamp + nonce +
//! OBS protocol) before it can touch the OBS socket, and everything headed
//! for the relay is policy-checked and sealed. Binary and unparseable frames
//! are dropped, never forwarded.
//!
//! Four tasks run per session under one cancellation scope: the relay
//! writer, the two pipes, and a ping timer. All writes to the relay socket
//! funnel through one bounded channel whose consumer is the sole writer;
//! WebSocket sinks do not tolerate concurrent writers, and the producers
//! (OBS pipe, monitor, ping timer, intercepted-request responder) would
//! otherwise race.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::{Codec, NonceCache, SystemClock};
use crate::monitor::{Monitor, MonitorConfig};
use crate::obs::{ObsStream, OBS_READ_TIMEOUT};
use crate::policy::{self, Direction};
use crate::relay::RelayStream;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const RELAY_SEND_CAP: usize = 64;

/// Request type the bridge handles locally instead of forwarding to OBS.
const CONFIGURE_MONITOR_REQUEST: &str = "AgentConfigureMonitor";

/// Which activity ended the session.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("relay writer closed: {0}")]
    RelayWriter(String),
    #[error("relay to OBS pipe closed: {0}")]
    RelayToObs(String),
    #[error("OBS to relay pipe closed: {0}")]
    ObsToRelay(String),
    #[error("bridge cancelled")]
    Cancelled,
}

/// Items on the relay writer channel: `None` means "send a WebSocket ping",
/// anything else is a raw OBS payload for the writer to seal and send.
type WriterItem = Option<Vec<u8>>;

/// Pipe traffic between an authenticated OBS connection and an established
/// relay session until either side fails or `cancel` fires.
///
/// Returns the first activity error, or [`BridgeError::Cancelled`] when the
/// session was torn down from above (cancellation wins over the error
/// channel for exit classification). All tasks and the monitor are joined
/// before returning.
pub async fn envelope_bridge(
    obs_stream: ObsStream,
    relay_stream: RelayStream,
    session_key: Vec<u8>,
    obs_addr: String,
    obs_pass: String,
    cancel: CancellationToken,
) -> BridgeError {
    let scope = cancel.child_token();

    let codec = Codec::new(Arc::new(SystemClock));
    let cache = Arc::new(NonceCache::new());

    let (relay_write, relay_read) = relay_stream.split();
    let (obs_write, obs_read) = obs_stream.split();

    let (relay_send, relay_recv) = mpsc::channel::<WriterItem>(RELAY_SEND_CAP);
    let (err_tx, mut err_rx) = mpsc::channel::<BridgeError>(4);

    // The monitor gets a closure onto the writer channel; dropped samples are
    // redundant, so a full channel is silent here.
    let monitor = {
        let tx = relay_send.clone();
        Arc::new(Monitor::new(
            obs_addr,
            obs_pass,
            Arc::new(move |bytes| {
                let _ = tx.try_send(Some(bytes));
            }),
        ))
    };

    let writer_handle = {
        let scope = scope.clone();
        let err_tx = err_tx.clone();
        let codec = codec.clone();
        let key = session_key.clone();
        tokio::spawn(async move {
            if let Err(cause) = relay_writer(&scope, relay_write, key, codec, relay_recv).await {
                let _ = err_tx.try_send(BridgeError::RelayWriter(cause));
            }
            scope.cancel();
        })
    };

    let relay_to_obs_handle = {
        let scope = scope.clone();
        let err_tx = err_tx.clone();
        let codec = codec.clone();
        let cache = cache.clone();
        let monitor = monitor.clone();
        let relay_send = relay_send.clone();
        let key = session_key.clone();
        tokio::spawn(async move {
            if let Err(cause) = pipe_relay_to_obs(
                &scope, relay_read, obs_write, key, codec, cache, monitor, relay_send,
            )
            .await
            {
                let _ = err_tx.try_send(BridgeError::RelayToObs(cause));
            }
            scope.cancel();
        })
    };

    let obs_to_relay_handle = {
        let scope = scope.clone();
        let err_tx = err_tx.clone();
        let relay_send = relay_send.clone();
        tokio::spawn(async move {
            if let Err(cause) = pipe_obs_to_relay(&scope, obs_read, relay_send).await {
                let _ = err_tx.try_send(BridgeError::ObsToRelay(cause));
            }
            scope.cancel();
        })
    };

    let ping_handle = {
        let scope = scope.clone();
        let relay_send = relay_send.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = ticker.tick() => {
                        let _ = relay_send.try_send(None);
                    }
                }
            }
        })
    };

    let first_error = tokio::select! {
        err = err_rx.recv() => err,
        _ = cancel.cancelled() => None,
    };

    scope.cancel();
    monitor.stop().await;
    for handle in [
        writer_handle,
        relay_to_obs_handle,
        obs_to_relay_handle,
        ping_handle,
    ] {
        let _ = handle.await;
    }

    match first_error {
        Some(_) if cancel.is_cancelled() => BridgeError::Cancelled,
        Some(err) => err,
        None => BridgeError::Cancelled,
    }
}

/// Sole writer to the relay socket. Seals payloads from the channel and
/// turns `None` items into WebSocket pings.
async fn relay_writer(
    cancel: &CancellationToken,
    mut sink: SplitSink<RelayStream, Message>,
    session_key: Vec<u8>,
    codec: Codec,
    mut rx: mpsc::Receiver<WriterItem>,
) -> Result<(), String> {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            item = rx.recv() => item,
        };

        let Some(item) = item else {
            return Err("send channel closed".into());
        };

        match item {
            None => {
                match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Ping(Bytes::new())))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(format!("ping write error: {}", e)),
                    Err(_) => return Err("ping write timed out".into()),
                }
            }
            Some(payload) => {
                let sealed = match codec.seal(&session_key, &payload) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!("failed to seal message: {}", e);
                        continue;
                    }
                };
                match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(sealed.into())))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(format!("relay write error: {}", e)),
                    Err(_) => return Err("relay write timed out".into()),
                }
            }
        }
    }
}

/// Reads signed envelopes from the relay, verifies and policy-checks them,
/// and forwards the raw OBS payload to local OBS. `AgentConfigureMonitor`
/// requests are handled locally and never reach OBS.
#[allow(clippy::too_many_arguments)]
async fn pipe_relay_to_obs(
    cancel: &CancellationToken,
    mut relay_read: SplitStream<RelayStream>,
    mut obs_write: SplitSink<ObsStream, Message>,
    session_key: Vec<u8>,
    codec: Codec,
    cache: Arc<NonceCache>,
    monitor: Arc<Monitor>,
    relay_send: mpsc::Sender<WriterItem>,
) -> Result<(), String> {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = relay_read.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return Err("relay connection closed".into()),
            Some(Ok(_)) => continue, // DROP binary frames
            Some(Err(e)) => return Err(format!("relay read error: {}", e)),
        };

        // Verify the signed envelope, then the OBS protocol. Invalid frames
        // are dropped; the connection stays up.
        let payload = match codec.open(&session_key, text.as_bytes(), &cache) {
            Ok(payload) => payload,
            Err(reason) => {
                warn!("Rejected relay message: {}", reason);
                continue;
            }
        };

        let frame = match policy::validate(&payload, Direction::RelayToAgent) {
            Ok(frame) => frame,
            Err(violation) => {
                warn!("Rejected OBS message from relay: {}", violation);
                continue;
            }
        };

        if frame.op == 6 {
            if let Some(d) = frame.d.as_ref() {
                if d.get("requestType").and_then(|v| v.as_str()) == Some(CONFIGURE_MONITOR_REQUEST)
                {
                    handle_configure_monitor(d, &monitor, &relay_send).await;
                    continue;
                }
            }
        }

        let payload = match String::from_utf8(payload) {
            Ok(payload) => payload,
            Err(_) => continue,
        };
        match tokio::time::timeout(WRITE_TIMEOUT, obs_write.send(Message::Text(payload.into())))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(format!("OBS write error: {}", e)),
            Err(_) => return Err("OBS write timed out".into()),
        }
    }
}

/// Apply an intercepted `AgentConfigureMonitor` and queue the synthetic op-7
/// success response.
async fn handle_configure_monitor(
    d: &serde_json::Value,
    monitor: &Arc<Monitor>,
    relay_send: &mpsc::Sender<WriterItem>,
) {
    let request_id = d
        .get("requestId")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    match d
        .get("requestData")
        .cloned()
        .map(serde_json::from_value::<MonitorConfig>)
    {
        Some(Ok(cfg)) => monitor.configure(cfg).await,
        Some(Err(e)) => warn!("bad {} data: {}", CONFIGURE_MONITOR_REQUEST, e),
        None => warn!("{} missing requestData", CONFIGURE_MONITOR_REQUEST),
    }

    let response = json!({
        "op": 7,
        "d": {
            "requestType": CONFIGURE_MONITOR_REQUEST,
            "requestId": request_id,
            "requestStatus": {"result": true, "code": 100},
        },
    });
    match serde_json::to_vec(&response) {
        Ok(bytes) => {
            let _ = relay_send.try_send(Some(bytes));
        }
        Err(e) => warn!("failed to encode {} response: {}", CONFIGURE_MONITOR_REQUEST, e),
    }
    debug!("{} intercepted", CONFIGURE_MONITOR_REQUEST);
}

/// Reads raw OBS frames, policy-checks them, and queues the raw payload for
/// the relay writer to seal. The 90s OBS read deadline is re-armed on every
/// successful read.
async fn pipe_obs_to_relay(
    cancel: &CancellationToken,
    mut obs_read: SplitStream<ObsStream>,
    relay_send: mpsc::Sender<WriterItem>,
) -> Result<(), String> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = tokio::time::timeout(OBS_READ_TIMEOUT, obs_read.next()) => next,
        };

        let msg = match next {
            Ok(msg) => msg,
            Err(_) => return Err("OBS read timed out".into()),
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return Err("OBS connection closed".into()),
            Some(Ok(_)) => continue, // DROP binary frames
            Some(Err(e)) => return Err(format!("OBS read error: {}", e)),
        };

        // No log on policy failure: local OBS emits assorted frames during
        // its own handshake phases.
        if policy::validate(text.as_bytes(), Direction::AgentToRelay).is_err() {
            continue;
        }

        if relay_send.try_send(Some(text.as_bytes().to_vec())).is_err() {
            warn!("Relay send channel full, dropping OBS message");
        }
    }
}
