#![allow(dead_code)]
#![allow(unused_imports)]

mod agent;
mod bridge;
mod cli;
mod config;
mod envelope;
mod logging;
mod monitor;
mod obs;
mod policy;
mod relay;
mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both run the agent.
        None => run_agent(config::ConfigOverrides::default()).await,
        Some(command @ Command::Start { .. }) => {
            let overrides = command.overrides();
            run_agent(overrides).await
        }

        Some(Command::Status { host, port }) => cli::handle_status(&host, port).await,

        Some(Command::ConfigPath) => {
            cli::handle_config_path();
            Ok(())
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

/// Run the agent under supervision until shutdown or token rejection.
async fn run_agent(overrides: config::ConfigOverrides) -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    // Fail fast on unusable config before anything is spawned.
    let cfg = config::AgentConfig::load(&overrides)?;
    info!("obsrelay v{}", cfg.version);

    let app_cancel = CancellationToken::new();

    let status = Arc::new(status::StatusState::new(
        &cfg.version,
        &cfg.obs_host,
        cfg.obs_port,
        &cfg.relay_url,
    ));
    tokio::spawn(status::serve(status.clone(), app_cancel.clone()));

    {
        let cancel = app_cancel.clone();
        status.set_quit_hook(Box::new(move || cancel.cancel()));
    }
    status.set_state_change_hook(Box::new(|event, message| {
        info!(event = event, "{}", message);
    }));

    {
        let cancel = app_cancel.clone();
        tokio::spawn(async move {
            let reason = await_shutdown_trigger().await;
            info!("Shutdown signal received ({})", reason);
            cancel.cancel();
        });
    }

    // Supervision loop. A reconfigure request cancels the current session
    // token; the loop then comes back around with a freshly loaded config.
    loop {
        let cfg = config::AgentConfig::load(&overrides)?;
        let session_cancel = app_cancel.child_token();
        let reload = Arc::new(AtomicBool::new(false));
        {
            let reload = reload.clone();
            let cancel = session_cancel.clone();
            status.set_reconfigure_hook(Box::new(move || {
                reload.store(true, Ordering::SeqCst);
                cancel.cancel();
            }));
        }

        let agent = agent::Agent::new(cfg, status.clone(), session_cancel);
        if let Err(e) = agent.run().await {
            error!("agent stopped: {}", e);
            return Err(e.into());
        }

        if app_cancel.is_cancelled() || !reload.swap(false, Ordering::SeqCst) {
            break;
        }
        info!("reconfigure requested — restarting supervision");
    }

    info!("obsrelay shut down");
    Ok(())
}

/// Initialize logging based on the OBSRELAY_DEV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if std::env::var("OBSRELAY_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
    {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            match tokio::signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(e) => {
                    panic!("Failed to install Ctrl+C handler: {}", e);
                }
            }
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            panic!("Failed to install Ctrl+C handler: {}", e);
        }
    }
}
