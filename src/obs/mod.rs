//! Local OBS Studio WebSocket v5 client.
//!
//! Plain-WebSocket dial plus the authenticated Hello/Identify handshake. No
//! retries at this layer; the supervisor owns reconnection.

mod auth;

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

/// Connected OBS socket.
pub type ObsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read deadline for OBS connections; the bridge re-arms it on every
/// successful read.
pub const OBS_READ_TIMEOUT: Duration = Duration::from_secs(90);

/// OBS frames are JSON and small; 1 MiB covers large scene lists.
const OBS_READ_LIMIT: usize = 1024 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ObsError {
    #[error("OBS WS dial failed: {0}")]
    Dial(String),
    #[error("OBS handshake failed: {0}")]
    Handshake(String),
    #[error("OBS handshake timed out")]
    HandshakeTimeout,
    #[error("OBS authentication failed (op {0})")]
    AuthRejected(i64),
}

async fn dial(addr: &str) -> Result<ObsStream, ObsError> {
    let url = format!("ws://{}", addr);
    let ws_config = WebSocketConfig::default().max_message_size(Some(OBS_READ_LIMIT));

    let connect = connect_async_with_config(url.as_str(), Some(ws_config), false);
    match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(ObsError::Dial(e.to_string())),
        Err(_) => Err(ObsError::Dial("connect timed out".into())),
    }
}

/// Connect to local OBS and complete the v5 handshake. The Identify is sent
/// even when no password is configured.
pub async fn connect(addr: &str, password: &str) -> Result<ObsStream, ObsError> {
    let mut stream = dial(addr).await?;
    if let Err(e) = auth::authenticate(&mut stream, password, None).await {
        let _ = futures_util::SinkExt::close(&mut stream).await;
        return Err(e);
    }
    Ok(stream)
}

/// Connect to local OBS with events suppressed (`eventSubscriptions: 0`).
/// Used for the monitor's dedicated polling connection, which must only ever
/// see request responses.
pub async fn connect_monitor(addr: &str, password: &str) -> Result<ObsStream, ObsError> {
    let mut stream = dial(addr).await?;
    if let Err(e) = auth::authenticate(&mut stream, password, Some(0)).await {
        let _ = futures_util::SinkExt::close(&mut stream).await;
        return Err(e);
    }
    Ok(stream)
}
