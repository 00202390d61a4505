//! End-to-end bridge tests against real loopback WebSocket peers.
//!
//! Each test wires a fake relay (a bare WebSocket server driven by the test)
//! and a fake OBS (see `common`) through `envelope_bridge`, then exercises
//! the security boundary: sealing, replay, policy, interception, teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use obsrelay::bridge::{envelope_bridge, BridgeError};
use obsrelay::envelope::{derive_session_key, Codec, NonceCache, SystemClock};
use obsrelay::obs;

use common::FakeObs;

const TOKEN: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

type ServerWs = WebSocketStream<TcpStream>;

/// A running bridge plus handles to both fake peers.
struct TestBridge {
    relay: ServerWs,
    obs: FakeObs,
    key: Vec<u8>,
    codec: Codec,
    cache: NonceCache,
    cancel: CancellationToken,
    handle: JoinHandle<BridgeError>,
}

async fn relay_pair() -> (obsrelay::relay::RelayStream, ServerWs) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    (client, server.await.unwrap())
}

async fn start_bridge() -> TestBridge {
    let obs_server = FakeObs::spawn(None).await;
    let obs_stream = obs::connect(&obs_server.addr, "").await.unwrap();

    let (relay_client, relay_server) = relay_pair().await;

    let key = derive_session_key(TOKEN, "abcd0123abcd0123");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(envelope_bridge(
        obs_stream,
        relay_client,
        key.clone(),
        obs_server.addr.clone(),
        String::new(),
        cancel.clone(),
    ));

    TestBridge {
        relay: relay_server,
        obs: obs_server,
        key,
        codec: Codec::new(Arc::new(SystemClock)),
        cache: NonceCache::new(),
        cancel,
        handle,
    }
}

impl TestBridge {
    /// Seal `payload` as the relay would and send it to the agent.
    async fn send_sealed(&mut self, payload: &[u8]) {
        let sealed = self.codec.seal(&self.key, payload).unwrap();
        self.relay
            .send(Message::Text(sealed.into()))
            .await
            .unwrap();
    }

    /// Send a pre-sealed frame verbatim (for replay tests).
    async fn send_raw(&mut self, frame: &str) {
        self.relay
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    /// Next envelope from the agent, opened and returned as raw payload.
    async fn recv_payload(&mut self, wait: Duration) -> Option<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.relay.next())
                .await
                .ok()??;
            match msg.ok()? {
                Message::Text(text) => {
                    return self.codec.open(&self.key, text.as_bytes(), &self.cache).ok();
                }
                _ => continue, // skip pings
            }
        }
    }

    /// Next envelope parsed as an OBS frame.
    async fn recv_frame(&mut self, wait: Duration) -> Option<Value> {
        let payload = self.recv_payload(wait).await?;
        serde_json::from_slice(&payload).ok()
    }

    async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = self.relay.close(None).await;
        let _ = self.handle.await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sealed_request_reaches_obs_byte_identical() {
    let mut bridge = start_bridge().await;

    let payload = br#"{"op":6,"d":{"requestType":"GetVersion","requestId":"r1"}}"#;
    bridge.send_sealed(payload).await;

    let (conn, text) = bridge.obs.recv(Duration::from_secs(5)).await.unwrap();
    assert_eq!(conn, 0);
    assert_eq!(text.as_bytes(), payload, "inner payload must be forwarded verbatim");

    // The fake OBS answers GetVersion; the response must come back sealed.
    let frame = bridge.recv_frame(Duration::from_secs(5)).await.unwrap();
    assert_eq!(frame["op"], 7);
    assert_eq!(frame["d"]["requestId"], "r1");

    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replayed_envelope_dropped() {
    let mut bridge = start_bridge().await;

    let payload = br#"{"op":6,"d":{"requestType":"GetVersion","requestId":"replay-1"}}"#;
    let sealed = bridge.codec.seal(&bridge.key, payload).unwrap();

    bridge.send_raw(&sealed).await;
    assert!(bridge.obs.recv(Duration::from_secs(5)).await.is_some());

    // Byte-identical resend: nonce already seen, frame must be dropped and
    // the connection must stay up.
    bridge.send_raw(&sealed).await;
    assert!(
        bridge.obs.recv(Duration::from_millis(400)).await.is_none(),
        "replayed frame must not reach OBS"
    );

    let fresh = br#"{"op":6,"d":{"requestType":"GetStats","requestId":"after-replay"}}"#;
    bridge.send_sealed(fresh).await;
    assert!(bridge.obs.recv(Duration::from_secs(5)).await.is_some());

    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forbidden_op_dropped_connection_stays() {
    let mut bridge = start_bridge().await;

    bridge.send_sealed(br#"{"op":42,"d":{}}"#).await;
    assert!(
        bridge.obs.recv(Duration::from_millis(400)).await.is_none(),
        "op 42 must not reach OBS"
    );

    bridge
        .send_sealed(br#"{"op":6,"d":{"requestType":"GetVersion","requestId":"r2"}}"#)
        .await;
    assert!(bridge.obs.recv(Duration::from_secs(5)).await.is_some());

    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forbidden_request_type_dropped() {
    let mut bridge = start_bridge().await;

    bridge
        .send_sealed(br#"{"op":6,"d":{"requestType":"Shutdown","requestId":"evil"}}"#)
        .await;
    assert!(bridge.obs.recv(Duration::from_millis(400)).await.is_none());

    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsealed_frame_dropped() {
    let mut bridge = start_bridge().await;

    bridge
        .send_raw(r#"{"op":6,"d":{"requestType":"GetVersion","requestId":"bare"}}"#)
        .await;
    assert!(
        bridge.obs.recv(Duration::from_millis(400)).await.is_none(),
        "unsealed frames must never reach OBS"
    );

    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_obs_event_sealed_to_relay() {
    let mut bridge = start_bridge().await;

    let event = r#"{"op":5,"d":{"eventType":"StreamStateChanged","eventData":{"outputActive":true}}}"#;
    bridge.obs.inject(event);

    let payload = bridge.recv_payload(Duration::from_secs(5)).await.unwrap();
    assert_eq!(payload, event.as_bytes(), "open must recover the original bytes");

    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configure_monitor_intercepted_and_polling_starts() {
    let mut bridge = start_bridge().await;

    let configure = br#"{"op":6,"d":{"requestType":"AgentConfigureMonitor","requestId":"cfg-1","requestData":{"source":"stream1","pollIntervalMs":100,"enabled":true}}}"#;
    bridge.send_sealed(configure).await;

    // The synthetic op-7 success response comes back over the relay...
    let frame = bridge.recv_frame(Duration::from_secs(5)).await.unwrap();
    assert_eq!(frame["op"], 7);
    assert_eq!(frame["d"]["requestType"], "AgentConfigureMonitor");
    assert_eq!(frame["d"]["requestId"], "cfg-1");
    assert_eq!(frame["d"]["requestStatus"]["result"], true);
    assert_eq!(frame["d"]["requestStatus"]["code"], 100);

    // ...and the poll loop (interval clamped to 500ms) emits a synthetic
    // op-5 event built from the fake OBS responses.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let event = loop {
        assert!(tokio::time::Instant::now() < deadline, "no AgentSourceState event");
        let Some(frame) = bridge.recv_frame(Duration::from_secs(5)).await else {
            continue;
        };
        if frame["op"] == 5 && frame["d"]["eventType"] == "AgentSourceState" {
            break frame;
        }
    };
    let data = &event["d"]["eventData"];
    assert_eq!(data["inputName"], "stream1");
    assert_eq!(data["mediaState"], "OBS_MEDIA_STATE_PLAYING");
    assert_eq!(data["state"], "normal");
    assert_eq!(data["containingScene"], "Main");

    // The intercepted request itself must never have reached OBS.
    // (The monitor's own GetSceneList/GetMediaInputStatus requests land on
    // connection 1, the polling connection, never connection 0.)
    while let Some((conn, text)) = bridge.obs.recv(Duration::from_millis(200)).await {
        assert!(
            !text.contains("AgentConfigureMonitor"),
            "AgentConfigureMonitor must not be forwarded to OBS"
        );
        assert_ne!(
            conn, 0,
            "bridge OBS connection must not see monitor traffic: {}",
            text
        );
    }

    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_burst_all_sealed_with_unique_nonces() {
    let mut bridge = start_bridge().await;

    const COUNT: usize = 100;
    for i in 0..COUNT {
        bridge.obs.inject(
            json!({
                "op": 5,
                "d": {"eventType": "Tick", "eventData": {"seq": i}},
            })
            .to_string(),
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut seen = vec![false; COUNT];
    for _ in 0..COUNT {
        // recv_payload opens against a shared nonce cache, so a duplicate
        // nonce would fail the open and this unwrap.
        let frame: Value = serde_json::from_slice(
            &bridge.recv_payload(Duration::from_secs(5)).await.unwrap(),
        )
        .unwrap();
        let seq = frame["d"]["eventData"]["seq"].as_u64().unwrap() as usize;
        assert!(!seen[seq], "sequence {} delivered twice", seq);
        seen[seq] = true;
    }
    assert!(seen.iter().all(|s| *s));

    bridge.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_tears_bridge_down() {
    let bridge = start_bridge().await;
    let handle = bridge.handle;
    bridge.cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("bridge must unwind within a deadline window")
        .unwrap();
    assert!(matches!(err, BridgeError::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_obs_close_ends_session() {
    let mut bridge = start_bridge().await;
    bridge.obs.close_primary();

    let err = tokio::time::timeout(Duration::from_secs(10), bridge.handle)
        .await
        .expect("bridge must notice the closed OBS socket")
        .unwrap();
    assert!(
        matches!(err, BridgeError::ObsToRelay(_)),
        "unexpected error: {}",
        err
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_obs_auth_challenge_round_trip() {
    let obs_server = FakeObs::spawn(Some("hunter2")).await;

    // Wrong password: the fake OBS closes instead of sending Identified.
    assert!(obs::connect(&obs_server.addr, "wrong").await.is_err());

    // Right password: full handshake succeeds.
    let stream = obs::connect(&obs_server.addr, "hunter2").await;
    assert!(stream.is_ok());
}
