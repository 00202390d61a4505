//! Shared test harness: a fake local OBS WebSocket v5 server.
//!
//! Speaks the Hello/Identify/Identified handshake (optionally with a
//! challenge), records every frame it receives, lets tests inject frames on
//! the first (bridge) connection, and auto-answers the request types the
//! agent uses.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const CHALLENGE: &str = "ztTBnnuqrqaKDzRM3xcVdbYm";
const SALT: &str = "PZVbYpvAnZut2SS6JNJytDm9";

pub struct FakeObs {
    pub addr: String,
    received: mpsc::UnboundedReceiver<(usize, String)>,
    inject: Option<mpsc::UnboundedSender<String>>,
    pub connections: Arc<AtomicUsize>,
}

impl FakeObs {
    /// Start the server. With `password`, the Hello advertises a challenge
    /// and the Identify must carry the matching auth string.
    pub async fn spawn(password: Option<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

        let (recv_tx, received) = mpsc::unbounded_channel();
        let (inject_tx, inject_rx) = mpsc::unbounded_channel::<String>();
        let connections = Arc::new(AtomicUsize::new(0));

        let conn_counter = connections.clone();
        tokio::spawn(async move {
            let mut inject_rx = Some(inject_rx);
            let mut index = 0usize;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                conn_counter.fetch_add(1, Ordering::SeqCst);
                // Only the first connection (the bridge's) gets the inject feed;
                // later ones are the monitor's polling connections.
                let inject = if index == 0 { inject_rx.take() } else { None };
                tokio::spawn(serve_conn(stream, index, password, recv_tx.clone(), inject));
                index += 1;
            }
        });

        Self {
            addr,
            received,
            inject: Some(inject_tx),
            connections,
        }
    }

    pub fn obs_port(&self) -> u16 {
        self.addr.rsplit(':').next().unwrap().parse().unwrap()
    }

    /// Send a raw text frame from OBS to the agent on the bridge connection.
    pub fn inject(&self, frame: impl Into<String>) {
        if let Some(tx) = &self.inject {
            let _ = tx.send(frame.into());
        }
    }

    /// Close the bridge connection, as OBS would on shutdown.
    pub fn close_primary(&mut self) {
        self.inject = None;
    }

    /// Next `(connection_index, frame_text)` the server received, if any
    /// arrives within `wait`.
    pub async fn recv(&mut self, wait: Duration) -> Option<(usize, String)> {
        tokio::time::timeout(wait, self.received.recv())
            .await
            .ok()
            .flatten()
    }
}

pub fn expected_auth(password: &str, salt: &str, challenge: &str) -> String {
    let secret = BASE64.encode(Sha256::digest(format!("{}{}", password, salt).as_bytes()));
    BASE64.encode(Sha256::digest(format!("{}{}", secret, challenge).as_bytes()))
}

async fn serve_conn(
    stream: TcpStream,
    index: usize,
    password: Option<&'static str>,
    recv_tx: mpsc::UnboundedSender<(usize, String)>,
    inject: Option<mpsc::UnboundedReceiver<String>>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    // Hello (op 0)
    let hello = match password {
        Some(_) => json!({
            "op": 0,
            "d": {
                "obsWebSocketVersion": "5.3.3",
                "rpcVersion": 1,
                "authentication": {"challenge": CHALLENGE, "salt": SALT},
            },
        }),
        None => json!({
            "op": 0,
            "d": {"obsWebSocketVersion": "5.3.3", "rpcVersion": 1},
        }),
    };
    if ws.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }

    // Identify (op 1)
    let identify_text = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(_)) => continue,
            _ => return,
        }
    };
    let identify: Value = serde_json::from_str(&identify_text).unwrap_or(json!({}));
    if identify.get("op").and_then(|v| v.as_i64()) != Some(1) {
        let _ = ws.close(None).await;
        return;
    }
    if let Some(pw) = password {
        let got = identify["d"]["authentication"].as_str().unwrap_or("");
        if got != expected_auth(pw, SALT, CHALLENGE) {
            let _ = ws.close(None).await;
            return;
        }
    }

    // Identified (op 2)
    let identified = json!({"op": 2, "d": {"negotiatedRpcVersion": 1}});
    if ws
        .send(Message::Text(identified.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut inject = inject;
    loop {
        tokio::select! {
            frame = async {
                match inject.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match frame {
                    Some(text) => {
                        if ws.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        // inject sender dropped: simulate OBS going away
                        let _ = ws.close(None).await;
                        return;
                    }
                }
            }
            msg = ws.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => return,
                };
                let _ = recv_tx.send((index, text.to_string()));
                if let Some(response) = auto_response(&text) {
                    if ws.send(Message::Text(response.into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Canned op-7 responses for the request types the agent issues.
fn auto_response(text: &str) -> Option<String> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame.get("op")?.as_i64()? != 6 {
        return None;
    }
    let d = frame.get("d")?;
    let request_type = d.get("requestType")?.as_str()?;
    let request_id = d.get("requestId").and_then(|v| v.as_str()).unwrap_or("");

    let response_data = match request_type {
        "GetVersion" => json!({"obsVersion": "30.2.0", "rpcVersion": 1}),
        "GetSceneList" => json!({
            "scenes": [{"sceneName": "Main"}, {"sceneName": "Backup"}],
        }),
        "GetSceneItemList" => {
            let scene = d
                .pointer("/requestData/sceneName")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if scene == "Main" {
                json!({"sceneItems": [{"sourceName": "stream1"}, {"sourceName": "camera"}]})
            } else {
                json!({"sceneItems": [{"sourceName": "overlay"}]})
            }
        }
        "GetMediaInputStatus" => json!({"mediaState": "OBS_MEDIA_STATE_PLAYING"}),
        _ => json!({}),
    };

    Some(
        json!({
            "op": 7,
            "d": {
                "requestType": request_type,
                "requestId": request_id,
                "requestStatus": {"result": true, "code": 100},
                "responseData": response_data,
            },
        })
        .to_string(),
    )
}
