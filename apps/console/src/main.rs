//! Terminal consumer for the cropwatch telemetry engine.
//!
//! Connects the WebSocket channel to the sync engine and logs a live-view
//! summary every few seconds. Configured entirely through environment
//! variables so it can sit next to any deployment of the platform.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use cropwatch_channel::{ChannelConnection, ConnectOptions};
use cropwatch_engine::{
    EngineConfig, EngineHandle, IdentityProvider, StaticIdentity, SyncEngine, UserProfile,
};

const ENV_WS_URL: &str = "CROPWATCH_WS_URL";
const ENV_TOKEN: &str = "CROPWATCH_TOKEN";
const ENV_USER_ID: &str = "CROPWATCH_USER_ID";
const ENV_SIMULATE_NOISE: &str = "CROPWATCH_SIMULATE_NOISE";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws";

const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
enum ConfigError {
    #[error("endpoint url must not be empty")]
    EmptyUrl,
    #[error("endpoint url must use ws:// or wss://")]
    InvalidScheme,
    #[error("{0} must be an integer user id")]
    InvalidUserId(&'static str),
}

#[derive(Debug, Clone)]
struct ConsoleConfig {
    ws_url: String,
    token: Option<String>,
    user_id: Option<i64>,
    simulate_noise: bool,
}

impl ConsoleConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let ws_url = normalize_ws_url(
            &std::env::var(ENV_WS_URL).unwrap_or_else(|_| DEFAULT_WS_URL.to_string()),
        )?;
        let token = env_non_empty(ENV_TOKEN);
        let user_id = match env_non_empty(ENV_USER_ID) {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| ConfigError::InvalidUserId(ENV_USER_ID))?,
            ),
            None => None,
        };
        let simulate_noise = matches!(
            env_non_empty(ENV_SIMULATE_NOISE).as_deref(),
            Some("1" | "true" | "yes")
        );
        Ok(Self {
            ws_url,
            token,
            user_id,
            simulate_noise,
        })
    }
}

fn normalize_ws_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyUrl);
    }
    if !(trimmed.starts_with("ws://") || trimmed.starts_with("wss://")) {
        return Err(ConfigError::InvalidScheme);
    }
    Ok(trimmed.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn log_summary(handle: &EngineHandle) {
    let latest = handle.latest();
    let mut counts: Vec<String> = handle
        .counts()
        .iter()
        .map(|(kind, count)| format!("{kind}:{count}"))
        .collect();
    counts.sort();

    info!(
        "connected={} sensors={} history={} [{}]",
        handle.is_connected(),
        latest.len(),
        handle.history().len(),
        counts.join(" ")
    );
    if let Some(error) = handle.connection_error() {
        warn!("channel: {}", error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ConsoleConfig::from_env().context("invalid console configuration")?;
    info!("connecting to {}", config.ws_url);

    let identity: Arc<dyn IdentityProvider> = match config.user_id {
        Some(id) => Arc::new(StaticIdentity::authenticated(UserProfile::with_id(id))),
        None => Arc::new(StaticIdentity::guest()),
    };
    let channel = Arc::new(
        ChannelConnection::new(
            &config.ws_url,
            ConnectOptions {
                token: config.token.clone(),
                user_id: config.user_id,
                groups: vec!["sensor:alerts".to_string()],
            },
        )
        .context("invalid channel endpoint")?,
    );

    let (alert_tx, mut alert_rx) = mpsc::channel(32);
    let engine_config = EngineConfig {
        simulate_noise: config.simulate_noise,
        ..EngineConfig::default()
    };
    let handle = SyncEngine::start_with_alerts(channel, identity, engine_config, Some(alert_tx));

    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    loop {
        tokio::select! {
            _ = summary.tick() => log_summary(&handle),
            Some(alert) = alert_rx.recv() => {
                warn!("alert [{}] {}", alert.sensor_id, alert.message);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}
