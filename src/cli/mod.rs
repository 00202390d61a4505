//! CLI subcommand definitions and handlers.
//!
//! - `start` (default) -- run the agent
//! - `status` -- query a running instance's local status endpoint
//! - `config-path` -- print the resolved config file location
//! - `version` -- print version info

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config;
use crate::status::DEFAULT_PORT;

/// OBS relay agent.
#[derive(Parser, Debug)]
#[command(
    name = "obsrelay",
    version = env!("CARGO_PKG_VERSION"),
    about = "obsrelay — bridges a cloud control plane to a local OBS Studio instance"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent (default when no subcommand is given).
    Start {
        /// Agent authentication token (64 hex chars).
        #[arg(long)]
        token: Option<String>,

        /// Relay WebSocket URL.
        #[arg(long)]
        relay_url: Option<String>,

        /// Local OBS WebSocket host.
        #[arg(long)]
        obs_host: Option<String>,

        /// Local OBS WebSocket port.
        #[arg(long)]
        obs_port: Option<u16>,

        /// Local OBS WebSocket password.
        #[arg(long)]
        obs_pass: Option<String>,

        /// Config file path (overridden by the flags above).
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Query a running agent for status information.
    Status {
        /// Host of the running instance.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port of the running instance's status endpoint.
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },

    /// Print the resolved config file path.
    ConfigPath,

    /// Print version information.
    Version,
}

impl Command {
    /// Collect the `start` flags into config overrides.
    pub fn overrides(&self) -> config::ConfigOverrides {
        match self {
            Command::Start {
                token,
                relay_url,
                obs_host,
                obs_port,
                obs_pass,
                config,
            } => config::ConfigOverrides {
                config_path: config.clone(),
                relay_url: relay_url.clone(),
                token: token.clone(),
                obs_host: obs_host.clone(),
                obs_port: *obs_port,
                obs_pass: obs_pass.clone(),
            },
            _ => config::ConfigOverrides::default(),
        }
    }
}

/// Fetch and print the status snapshot from a running instance.
pub async fn handle_status(host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("http://{}:{}/api/status", host, port);
    let response = reqwest::get(&url)
        .await
        .map_err(|e| format!("could not reach agent at {}: {}", url, e))?;

    let snapshot: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

pub fn handle_config_path() {
    println!("{}", config::default_config_path().display());
}

pub fn handle_version() {
    println!("obsrelay {}", env!("CARGO_PKG_VERSION"));
}
