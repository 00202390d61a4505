//! Relay tunnel client.
//!
//! Dials the relay over TLS (1.3 minimum) with the agent token in a header,
//! then drives the session handshake: the relay sends
//! `{"type":"session","nonce":...}` followed by `{"type":"connected"}`, and
//! both sides derive the session key from token + nonce without ever
//! transmitting it.
//!
//! Error messages stay generic on refusal. The relay does not enumerate
//! server-side failure reasons and neither do we; the one distinguished case
//! is close code 4100 (token refused), which the supervisor treats as
//! terminal.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::envelope::derive_session_key;

/// Connected relay socket.
pub type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code the relay sends when it refuses the agent token.
pub const TOKEN_REJECTED_CLOSE_CODE: u16 = 4100;

/// OBS v5 frames are small; anything larger than this is suspicious.
const RELAY_READ_LIMIT: usize = 256 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Overall deadline for the session handshake phase.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The relay refused the agent token (close 4100). Terminal: the
    /// supervisor must stop retrying and hand control back to the caller.
    #[error("token rejected by relay")]
    TokenRejected,
    #[error("connection refused by relay (HTTP {0})")]
    Refused(u16),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("session handshake failed: {0}")]
    Handshake(String),
}

impl RelayError {
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Self::TokenRejected)
    }
}

/// rustls client config pinned to TLS 1.3. Cipher suites are left at the
/// defaults; all TLS 1.3 suites are acceptable.
fn tls_connector() -> Result<Connector, RelayError> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
    };

    let config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(config)))
}

/// Dial the relay. The token travels in the `X-Agent-Token` header, never in
/// the URL, so it cannot land in server access logs.
pub async fn connect(url: &str, token: &str, version: &str) -> Result<RelayStream, RelayError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| RelayError::ConnectionFailed(format!("invalid relay URL: {}", e)))?;

    let token_value = HeaderValue::from_str(token)
        .map_err(|_| RelayError::ConnectionFailed("token contains invalid characters".into()))?;
    request.headers_mut().insert("X-Agent-Token", token_value);
    if !version.is_empty() {
        if let Ok(value) = HeaderValue::from_str(version) {
            request.headers_mut().insert("X-Agent-Version", value);
        }
    }

    let ws_config = WebSocketConfig::default().max_message_size(Some(RELAY_READ_LIMIT));
    let connector = tls_connector()?;

    let connect = connect_async_tls_with_config(request, Some(ws_config), false, Some(connector));
    match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        // A completed-but-refused HTTP upgrade: report the status code only.
        Ok(Err(WsError::Http(response))) => Err(RelayError::Refused(response.status().as_u16())),
        Ok(Err(e)) => Err(RelayError::ConnectionFailed(e.to_string())),
        Err(_) => Err(RelayError::ConnectionFailed("connect timed out".into())),
    }
}

#[derive(Debug, Deserialize)]
struct HandshakeFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
}

/// Read handshake frames until `session` + `connected` have both arrived,
/// and return the derived session key.
///
/// `update_available` frames are advisory and only logged. A close with code
/// 4100 during this phase classifies as [`RelayError::TokenRejected`].
pub async fn wait_for_session(
    stream: &mut RelayStream,
    token: &str,
) -> Result<Vec<u8>, RelayError> {
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    let mut session_key: Option<Vec<u8>> = None;

    loop {
        let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(msg) => msg,
            Err(_) => return Err(RelayError::Handshake("timed out".into())),
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                if let Some(frame) = &frame {
                    if u16::from(frame.code) == TOKEN_REJECTED_CLOSE_CODE {
                        return Err(RelayError::TokenRejected);
                    }
                }
                return Err(RelayError::Handshake("connection closed".into()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(RelayError::Handshake(e.to_string())),
            None => return Err(RelayError::Handshake("connection closed".into())),
        };

        // Skip unparseable frames during the handshake
        let frame: HandshakeFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };

        match frame.frame_type.as_str() {
            "session" => {
                let nonce = frame
                    .nonce
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| RelayError::Handshake("session message missing nonce".into()))?;
                session_key = Some(derive_session_key(token, &nonce));
                debug!("session key derived");
            }
            "connected" => {
                return match session_key {
                    Some(key) => {
                        info!("relay session established");
                        Ok(key)
                    }
                    None => Err(RelayError::Handshake("received connected before session".into())),
                };
            }
            "update_available" => {
                info!(
                    version = frame.version.as_deref().unwrap_or("?"),
                    download_url = frame.download_url.as_deref().unwrap_or("?"),
                    "update available"
                );
            }
            _ => {
                // Unknown handshake frame type, skip
            }
        }
    }
}
