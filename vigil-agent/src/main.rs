//! Vigil agent binary
//!
//! Wires the library together for a real deployment:
//! - Configuration from TOML (+ `.env`, keyring for the SMS token)
//! - MQTT link to the flight platform, shared with the MQTT alert channel
//! - PGM directory frame source
//! - Control API, Ctrl-C for orderly shutdown
//! - `set-sms-token <token>` stores the SMS gateway token in the OS keyring

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vigil_agent::control::{self, ControlState};
use vigil_agent::frame::PgmDirectorySource;
use vigil_agent::notify::build_targets;
use vigil_agent::platform::MqttPlatformLink;
use vigil_agent::{Agent, AgentConfig, ControlCommand};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil_agent=info")),
        )
        .init();

    // vigil-agent set-sms-token <token>
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("set-sms-token") {
        let token = args.get(2).context("usage: vigil-agent set-sms-token <token>")?;
        AgentConfig::save_sms_token(token).context("Failed to store SMS token in keyring")?;
        info!("SMS token stored in OS keyring");
        return Ok(());
    }

    info!("Vigil agent starting...");

    let config = AgentConfig::load().await.context("Failed to load configuration")?;
    info!(
        "Configuration loaded from {}",
        AgentConfig::config_file_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "defaults".to_string())
    );

    let (link, _event_loop) = MqttPlatformLink::connect(&config);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.notify.send_timeout_ms))
        .build()
        .context("Failed to build HTTP client")?;
    let targets = build_targets(&config, http, Some(link.client()));

    let source = PgmDirectorySource::open(&config.source.frames_dir)
        .with_context(|| format!("Failed to open frame source {}", config.source.frames_dir.display()))?;

    let mut agent = Agent::new(config.clone(), Box::new(source), link, targets)
        .with_context(|| format!("Failed to open audit log {}", config.audit.path.display()))?;

    if config.control.enabled {
        let addr = config.control_addr().context("Invalid control API address")?;
        let state = ControlState {
            status: agent.status_handle(),
            alerts: agent.alerts_handle(),
            commands: agent.control_sender(),
            api_key: ControlState::api_key_from_env(),
        };
        if state.api_key.is_none() {
            warn!("VIGIL_API_KEY not set: control API will refuse every request but /health");
        }
        tokio::spawn(async move {
            if let Err(e) = control::serve(addr, state).await {
                error!("Control API stopped: {}", e);
            }
        });
    }

    let shutdown = agent.control_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = shutdown.send(ControlCommand::Shutdown).await;
        }
    });

    if let Err(e) = agent.start() {
        error!("Agent faulted at startup: {}", e);
    }

    let outcome = agent.run().await;
    info!(?outcome, "Vigil agent exited");
    Ok(())
}
