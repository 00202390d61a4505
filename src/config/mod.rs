//! Agent configuration.
//!
//! Runtime config is a small value object assembled from three layers with
//! fixed precedence: CLI flags > environment variables > config file >
//! built-in defaults. The token is validated up front and only ever logged
//! as a fingerprint.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Relay endpoint used when none is configured.
pub const DEFAULT_RELAY_URL: &str = "wss://relay.obsrelay.dev/ws/agent";

pub const DEFAULT_OBS_HOST: &str = "localhost";
pub const DEFAULT_OBS_PORT: u16 = 4455;

/// Agent tokens are exactly 64 lowercase hex characters (256 bits).
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{64}$").expect("failed to compile token regex"));

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("agent token is required (pass --token, set OBSRELAY_TOKEN, or add it to the config file)")]
    MissingToken,

    #[error("agent token must be exactly 64 lowercase hex characters")]
    InvalidToken,
}

/// Resolved runtime configuration. Immutable for the lifetime of a
/// supervisor; a reconfigure cycles the supervisor with a fresh load.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub relay_url: String,
    pub token: String,
    pub obs_host: String,
    pub obs_port: u16,
    pub obs_pass: String,
    pub version: String,
}

/// On-disk shape; every field optional so partial files work.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    relay_url: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    obs_host: Option<String>,
    #[serde(default)]
    obs_port: Option<u16>,
    #[serde(default)]
    obs_pass: Option<String>,
}

/// Values supplied on the command line; highest precedence.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub relay_url: Option<String>,
    pub token: Option<String>,
    pub obs_host: Option<String>,
    pub obs_port: Option<u16>,
    pub obs_pass: Option<String>,
}

/// Config file location.
/// Priority: `OBSRELAY_CONFIG_PATH` > `OBSRELAY_STATE_DIR/obsrelay.json` >
/// `~/.obsrelay/obsrelay.json`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var("OBSRELAY_CONFIG_PATH") {
        return PathBuf::from(path);
    }

    if let Ok(state_dir) = env::var("OBSRELAY_STATE_DIR") {
        return PathBuf::from(state_dir).join("obsrelay.json");
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".obsrelay")
        .join("obsrelay.json")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_string(name: &str) -> Option<String> {
    non_empty(env::var(name).ok())
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

impl AgentConfig {
    /// Assemble the runtime config from flags, environment, and the config
    /// file. Fails if no valid token can be found anywhere.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let path = overrides
            .config_path
            .clone()
            .unwrap_or_else(default_config_path);
        let file = load_file(&path)?;

        let token = non_empty(overrides.token.clone())
            .or_else(|| env_string("OBSRELAY_TOKEN"))
            .or_else(|| non_empty(file.token))
            .ok_or(ConfigError::MissingToken)?;
        validate_token(&token)?;

        let relay_url = non_empty(overrides.relay_url.clone())
            .or_else(|| env_string("OBSRELAY_RELAY_URL"))
            .or_else(|| non_empty(file.relay_url))
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

        let obs_host = non_empty(overrides.obs_host.clone())
            .or_else(|| env_string("OBS_HOST"))
            .or_else(|| non_empty(file.obs_host))
            .unwrap_or_else(|| DEFAULT_OBS_HOST.to_string());

        let obs_port = overrides
            .obs_port
            .or_else(|| env_string("OBS_PORT").and_then(|p| p.parse().ok()))
            .or(file.obs_port)
            .unwrap_or(DEFAULT_OBS_PORT);

        let obs_pass = non_empty(overrides.obs_pass.clone())
            .or_else(|| env_string("OBS_PASS"))
            .or_else(|| non_empty(file.obs_pass))
            .unwrap_or_default();

        Ok(Self {
            relay_url,
            token,
            obs_host,
            obs_port,
            obs_pass,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    pub fn obs_addr(&self) -> String {
        format!("{}:{}", self.obs_host, self.obs_port)
    }
}

pub fn validate_token(token: &str) -> Result<(), ConfigError> {
    if TOKEN_RE.is_match(token) {
        Ok(())
    } else {
        Err(ConfigError::InvalidToken)
    }
}

/// First-4/last-4 fingerprint, the only form of the token that may appear in
/// logs or error messages.
pub fn token_fingerprint(token: &str) -> String {
    if token.len() >= 8 {
        format!("{}…{}", &token[..4], &token[token.len() - 4..])
    } else {
        "****".to_string()
    }
}
