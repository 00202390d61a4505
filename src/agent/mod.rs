//! Per-session lifecycle supervisor.
//!
//! One `Agent` owns one OBS + relay session at a time: connect to local OBS,
//! connect to the relay, complete the session handshake, then run the
//! envelope bridge until something fails. Transient failures are retried
//! forever with exponential backoff; only token rejection and external
//! cancellation are terminal.

pub mod reconnect;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::{envelope_bridge, BridgeError};
use crate::config::{token_fingerprint, AgentConfig};
use crate::obs::{self, ObsError};
use crate::relay::{self, RelayError};
use crate::status::StatusState;

/// Observable lifecycle states, in the order a healthy session visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Starting,
    ConnectingObs,
    ConnectingRelay,
    Connected,
    Reconnecting,
    TokenRejected,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::ConnectingObs => "connecting_obs",
            Self::ConnectingRelay => "connecting_relay",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::TokenRejected => "token_rejected",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What ended a session attempt.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Obs(#[from] ObsError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl SessionError {
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Self::Relay(RelayError::TokenRejected))
    }
}

/// Reconnection tuning.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Reset the attempt counter once a session has stayed connected this
    /// long. `None` never resets on health, so a flapping session keeps
    /// climbing the backoff curve.
    pub healthy_reset: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: reconnect::BASE_DELAY,
            max_delay: reconnect::MAX_DELAY,
            healthy_reset: Some(Duration::from_secs(60)),
        }
    }
}

struct SessionRun {
    /// How long the session spent in `connected` before failing, if it got
    /// that far.
    connected_for: Option<Duration>,
    error: SessionError,
}

/// Supervises one session at a time, restarting on transient failure.
pub struct Agent {
    cfg: AgentConfig,
    status: Arc<StatusState>,
    cancel: CancellationToken,
    policy: ReconnectPolicy,
}

impl Agent {
    pub fn new(cfg: AgentConfig, status: Arc<StatusState>, cancel: CancellationToken) -> Self {
        Self {
            cfg,
            status,
            cancel,
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the current session. `run` unwinds, joins every activity, and
    /// returns `Ok(())`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Main loop: run sessions until cancelled or the token is rejected.
    ///
    /// Returns `Ok(())` on clean shutdown. The only error it surfaces is
    /// token rejection, which needs the caller to re-authenticate.
    pub async fn run(&self) -> Result<(), SessionError> {
        info!(
            token = %token_fingerprint(&self.cfg.token),
            relay = %self.cfg.relay_url,
            "agent starting"
        );

        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                self.shutdown_status();
                return Ok(());
            }

            let session = self.run_session().await;

            if self.cancel.is_cancelled() {
                self.shutdown_status();
                return Ok(());
            }

            self.status.set_status(AgentStatus::Reconnecting.as_str());
            self.status.set_obs_connected(false);
            self.status.set_relay_connected(false);

            if session.error.is_token_rejected() {
                warn!("token rejected by relay; re-authentication required");
                self.status.set_status(AgentStatus::TokenRejected.as_str());
                self.status
                    .set_error("token rejected — re-authentication required");
                return Err(session.error);
            }

            if let (Some(threshold), Some(connected_for)) =
                (self.policy.healthy_reset, session.connected_for)
            {
                if connected_for >= threshold {
                    attempt = 0;
                }
            }

            let delay =
                reconnect::backoff_with(self.policy.base_delay, self.policy.max_delay, attempt);
            attempt += 1;
            warn!(
                "connection lost: {} — reconnecting in {:?} (attempt {})",
                session.error, delay, attempt
            );
            self.status.set_error(&session.error.to_string());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.shutdown_status();
                    return Ok(());
                }
            }
        }
    }

    /// One connection lifecycle: OBS, relay, session handshake, bridge.
    async fn run_session(&self) -> SessionRun {
        let obs_addr = self.cfg.obs_addr();

        self.status.set_status(AgentStatus::ConnectingObs.as_str());
        info!("connecting to local OBS at {}", obs_addr);
        let obs_stream = tokio::select! {
            _ = self.cancel.cancelled() => return SessionRun::cancelled(),
            result = obs::connect(&obs_addr, &self.cfg.obs_pass) => match result {
                Ok(stream) => stream,
                Err(e) => return SessionRun::failed(e.into()),
            },
        };
        info!("connected to local OBS");
        self.status.set_obs_connected(true);

        self.status
            .set_status(AgentStatus::ConnectingRelay.as_str());
        info!("connecting to relay at {}", self.cfg.relay_url);
        let mut relay_stream = tokio::select! {
            _ = self.cancel.cancelled() => return SessionRun::cancelled(),
            result = relay::connect(&self.cfg.relay_url, &self.cfg.token, &self.cfg.version) => {
                match result {
                    Ok(stream) => stream,
                    Err(e) => return SessionRun::failed(e.into()),
                }
            }
        };
        info!("connected to relay");
        self.status.set_relay_connected(true);

        let session_key = tokio::select! {
            _ = self.cancel.cancelled() => return SessionRun::cancelled(),
            result = relay::wait_for_session(&mut relay_stream, &self.cfg.token) => match result {
                Ok(key) => key,
                Err(e) => return SessionRun::failed(e.into()),
            },
        };

        self.status.set_status(AgentStatus::Connected.as_str());
        self.status.set_error("");
        info!("bridge active — relaying signed messages");
        let connected_at = Instant::now();

        let bridge_error = envelope_bridge(
            obs_stream,
            relay_stream,
            session_key,
            obs_addr,
            self.cfg.obs_pass.clone(),
            self.cancel.child_token(),
        )
        .await;

        SessionRun {
            connected_for: Some(connected_at.elapsed()),
            error: bridge_error.into(),
        }
    }

    fn shutdown_status(&self) {
        info!("agent stopping");
        self.status.set_status(AgentStatus::Stopped.as_str());
        self.status.set_obs_connected(false);
        self.status.set_relay_connected(false);
    }
}

impl SessionRun {
    fn failed(error: SessionError) -> Self {
        Self {
            connected_for: None,
            error,
        }
    }

    fn cancelled() -> Self {
        Self::failed(SessionError::Bridge(BridgeError::Cancelled))
    }
}
