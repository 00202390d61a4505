//! OBS WebSocket v5 Hello/Identify handshake.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_tungstenite::tungstenite::Message;

use super::{ObsError, ObsStream};

/// Per-step deadline for the three-message handshake.
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ObsMessage {
    op: i64,
    #[serde(default)]
    d: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct HelloData {
    #[serde(default)]
    authentication: Option<AuthChallenge>,
}

#[derive(Debug, Deserialize)]
struct AuthChallenge {
    challenge: String,
    salt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentifyData {
    rpc_version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    authentication: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_subscriptions: Option<u64>,
}

/// Auth string per the obs-websocket protocol:
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`.
fn generate_auth_string(password: &str, salt: &str, challenge: &str) -> String {
    let secret_hash = Sha256::digest(format!("{}{}", password, salt).as_bytes());
    let secret_b64 = BASE64.encode(secret_hash);

    let auth_hash = Sha256::digest(format!("{}{}", secret_b64, challenge).as_bytes());
    BASE64.encode(auth_hash)
}

async fn read_handshake_frame(stream: &mut ObsStream) -> Result<ObsMessage, ObsError> {
    let deadline = tokio::time::timeout(HANDSHAKE_STEP_TIMEOUT, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ObsError::Handshake("connection closed".into()))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ObsError::Handshake(e.to_string())),
            }
        }
    });

    let text = match deadline.await {
        Ok(result) => result?,
        Err(_) => return Err(ObsError::HandshakeTimeout),
    };

    serde_json::from_str(&text).map_err(|e| ObsError::Handshake(format!("bad frame: {}", e)))
}

/// Perform the OBS v5 Hello (op 0) -> Identify (op 1) -> Identified (op 2)
/// handshake. OBS requires the Identify even when no password is set.
///
/// `event_subscriptions` is carried in the Identify when set; the monitor
/// connection passes `Some(0)` so no event stream competes with request
/// responses on its socket.
pub(super) async fn authenticate(
    stream: &mut ObsStream,
    password: &str,
    event_subscriptions: Option<u64>,
) -> Result<(), ObsError> {
    let hello = read_handshake_frame(stream).await?;
    if hello.op != 0 {
        return Err(ObsError::Handshake(format!(
            "expected Hello (op 0), got op {}",
            hello.op
        )));
    }

    let hello_data: HelloData = serde_json::from_value(hello.d)
        .map_err(|e| ObsError::Handshake(format!("bad Hello data: {}", e)))?;

    let identify = IdentifyData {
        rpc_version: 1,
        authentication: hello_data
            .authentication
            .map(|auth| generate_auth_string(password, &auth.salt, &auth.challenge)),
        event_subscriptions,
    };

    let frame = serde_json::json!({"op": 1, "d": identify});
    let text = serde_json::to_string(&frame)
        .map_err(|e| ObsError::Handshake(format!("encode Identify: {}", e)))?;

    match tokio::time::timeout(HANDSHAKE_STEP_TIMEOUT, stream.send(Message::Text(text.into())))
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(ObsError::Handshake(format!("send Identify: {}", e))),
        Err(_) => return Err(ObsError::HandshakeTimeout),
    }

    let response = read_handshake_frame(stream).await?;
    if response.op != 2 {
        return Err(ObsError::AuthRejected(response.op));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_string_shape() {
        // base64(sha256) is always 44 chars and decodes to 32 bytes
        let auth = generate_auth_string(
            "supersecretpassword",
            "PZVbYpvAnZut2SS6JNJytDm9",
            "ztTBnnuqrqaKDzRM3xcVdbYm",
        );
        assert_eq!(auth.len(), 44);
        assert_eq!(BASE64.decode(&auth).unwrap().len(), 32);
    }

    #[test]
    fn test_auth_string_deterministic() {
        let a = generate_auth_string("pw", "salt", "challenge");
        let b = generate_auth_string("pw", "salt", "challenge");
        assert_eq!(a, b);
        assert_ne!(a, generate_auth_string("other", "salt", "challenge"));
    }

    #[test]
    fn test_identify_omits_unset_fields() {
        let identify = IdentifyData {
            rpc_version: 1,
            authentication: None,
            event_subscriptions: None,
        };
        let json = serde_json::to_string(&identify).unwrap();
        assert_eq!(json, r#"{"rpcVersion":1}"#);

        let identify = IdentifyData {
            rpc_version: 1,
            authentication: Some("abc".into()),
            event_subscriptions: Some(0),
        };
        let json = serde_json::to_string(&identify).unwrap();
        assert!(json.contains(r#""authentication":"abc""#));
        assert!(json.contains(r#""eventSubscriptions":0"#));
    }
}
