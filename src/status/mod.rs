//! Agent status surface.
//!
//! Holds the observable agent state (lifecycle status, per-connection flags,
//! last error) written by the supervisor, and exposes it on a loopback-only
//! HTTP endpoint for the dashboard and the `status` CLI subcommand.
//! Connection-state transitions fire an injectable notification hook,
//! debounced per event kind.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Preferred listen address. If the port is busy the server falls back to an
/// OS-assigned port on the same loopback interface.
pub const DEFAULT_ADDR: &str = "127.0.0.1:8765";

/// Default status port, used by the `status` CLI subcommand.
pub const DEFAULT_PORT: u16 = 8765;

/// Minimum gap between notifications of the same event kind.
const NOTIFY_DEBOUNCE: Duration = Duration::from_secs(30);

/// Callback invoked for quit/reconfigure requests from the endpoint.
pub type Hook = Box<dyn Fn() + Send + Sync>;

/// Callback invoked on connection-state transitions: `(event, message)`.
pub type StateChangeHook = Box<dyn Fn(&str, &str) + Send + Sync>;

/// JSON shape served by `/` and `/api/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub version: String,
    pub status: String,
    pub obs_connected: bool,
    pub relay_connected: bool,
    pub obs_host: String,
    pub obs_port: u16,
    pub relay_url: String,
    pub uptime_seconds: i64,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub pid: u32,
}

#[derive(Debug, Default)]
struct Inner {
    status: String,
    obs_connected: bool,
    relay_connected: bool,
    last_error: String,
    listen_addr: Option<SocketAddr>,
}

#[derive(Default)]
struct Hooks {
    on_quit: Option<Hook>,
    on_reconfigure: Option<Hook>,
    on_state_change: Option<StateChangeHook>,
}

/// Shared, thread-safe status store. Written by the supervisor, read by the
/// HTTP handlers and CLI.
pub struct StatusState {
    version: String,
    obs_host: String,
    obs_port: u16,
    relay_url: String,
    started_at: Instant,
    started_at_stamp: String,
    inner: RwLock<Inner>,
    hooks: RwLock<Hooks>,
    debounce: Mutex<HashMap<String, Instant>>,
}

impl StatusState {
    pub fn new(version: &str, obs_host: &str, obs_port: u16, relay_url: &str) -> Self {
        Self {
            version: version.to_string(),
            obs_host: obs_host.to_string(),
            obs_port,
            relay_url: relay_url.to_string(),
            started_at: Instant::now(),
            started_at_stamp: chrono::Utc::now().to_rfc3339(),
            inner: RwLock::new(Inner {
                status: "starting".to_string(),
                ..Inner::default()
            }),
            hooks: RwLock::new(Hooks::default()),
            debounce: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_status(&self, status: &str) {
        self.inner.write().status = status.to_string();
    }

    pub fn set_error(&self, error: &str) {
        self.inner.write().last_error = error.to_string();
    }

    /// Update the OBS connection flag, notifying on transitions.
    pub fn set_obs_connected(&self, connected: bool) {
        let changed = {
            let mut inner = self.inner.write();
            let changed = inner.obs_connected != connected;
            inner.obs_connected = connected;
            changed
        };
        if changed {
            if connected {
                let msg = format!("OBS connected ({}:{})", self.obs_host, self.obs_port);
                self.notify("obs_connected", &msg);
            } else {
                let msg = format!("OBS disconnected ({}:{})", self.obs_host, self.obs_port);
                self.notify("obs_disconnected", &msg);
            }
        }
    }

    /// Update the relay connection flag, notifying on transitions.
    pub fn set_relay_connected(&self, connected: bool) {
        let changed = {
            let mut inner = self.inner.write();
            let changed = inner.relay_connected != connected;
            inner.relay_connected = connected;
            changed
        };
        if changed {
            if connected {
                self.notify("relay_connected", "Relay server connected");
            } else {
                self.notify("relay_disconnected", "Relay server disconnected");
            }
        }
    }

    pub fn set_quit_hook(&self, hook: Hook) {
        self.hooks.write().on_quit = Some(hook);
    }

    pub fn set_reconfigure_hook(&self, hook: Hook) {
        self.hooks.write().on_reconfigure = Some(hook);
    }

    pub fn set_state_change_hook(&self, hook: StateChangeHook) {
        self.hooks.write().on_state_change = Some(hook);
    }

    /// Actual bound address once the endpoint is serving.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.read().listen_addr
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read();
        StatusSnapshot {
            version: self.version.clone(),
            status: inner.status.clone(),
            obs_connected: inner.obs_connected,
            relay_connected: inner.relay_connected,
            obs_host: self.obs_host.clone(),
            obs_port: self.obs_port,
            relay_url: self.relay_url.clone(),
            uptime_seconds: self.started_at.elapsed().as_secs() as i64,
            started_at: self.started_at_stamp.clone(),
            last_error: inner.last_error.clone(),
            pid: std::process::id(),
        }
    }

    /// Fire the state-change hook unless the same event kind fired within
    /// the debounce window.
    fn notify(&self, event: &str, message: &str) {
        {
            let mut debounce = self.debounce.lock();
            if let Some(last) = debounce.get(event) {
                if last.elapsed() < NOTIFY_DEBOUNCE {
                    return;
                }
            }
            debounce.insert(event.to_string(), Instant::now());
        }

        let hooks = self.hooks.read();
        if let Some(hook) = hooks.on_state_change.as_ref() {
            hook(event, message);
        }
    }

    fn fire_quit(&self) -> bool {
        let hooks = self.hooks.read();
        match hooks.on_quit.as_ref() {
            Some(hook) => {
                hook();
                true
            }
            None => false,
        }
    }

    fn fire_reconfigure(&self) -> bool {
        let hooks = self.hooks.read();
        match hooks.on_reconfigure.as_ref() {
            Some(hook) => {
                hook();
                true
            }
            None => false,
        }
    }
}

/// Serve the status endpoint until `cancel` fires. Binding failures are
/// logged and swallowed: the agent keeps running without the endpoint.
pub async fn serve(state: Arc<StatusState>, cancel: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(DEFAULT_ADDR).await {
        Ok(listener) => listener,
        Err(_) => {
            // Preferred port busy; let the OS assign one
            match tokio::net::TcpListener::bind("127.0.0.1:0").await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("could not start status endpoint: {} (non-fatal)", e);
                    return;
                }
            }
        }
    };

    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("could not resolve status endpoint address: {} (non-fatal)", e);
            return;
        }
    };
    state.inner.write().listen_addr = Some(addr);
    info!("status endpoint listening on {}", addr);

    let app = Router::new()
        .route("/", get(handle_status))
        .route("/api/status", get(handle_status))
        .route("/health", get(handle_health))
        .route("/api/quit", post(handle_quit))
        .route("/api/reconfigure", post(handle_reconfigure))
        .with_state(state);

    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        warn!("status endpoint error: {}", e);
    }
}

async fn handle_status(State(state): State<Arc<StatusState>>) -> Json<StatusSnapshot> {
    Json(state.snapshot())
}

async fn handle_health() -> Json<Value> {
    Json(json!({"ok": true}))
}

async fn handle_quit(State(state): State<Arc<StatusState>>) -> Json<Value> {
    if state.hooks.read().on_quit.is_none() {
        return Json(json!({"ok": false, "error": "no quit handler"}));
    }
    // Let the response flush before tearing the process down
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        state.fire_quit();
    });
    Json(json!({"ok": true}))
}

async fn handle_reconfigure(State(state): State<Arc<StatusState>>) -> Json<Value> {
    if state.hooks.read().on_reconfigure.is_none() {
        return Json(json!({"ok": false, "error": "no reconfigure handler"}));
    }
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        state.fire_reconfigure();
    });
    Json(json!({"ok": true}))
}
