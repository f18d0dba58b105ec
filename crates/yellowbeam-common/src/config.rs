//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use config::builder::{ConfigBuilder, DefaultState};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = with_defaults()?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (YELLOWBEAM_SERVER__PORT, YELLOWBEAM_MEDIA__KURENTO_URL, etc.)
        .add_source(
            config::Environment::with_prefix("YELLOWBEAM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

fn with_defaults() -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
    config::Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8443)?
        .set_default("media.kurento_url", "ws://localhost:8888/kurento")?
        .set_default("media.request_timeout_secs", 10)?
        .set_default("media.keepalive_secs", 240)? // Kurento drops idle sessions
        .set_default("signaling.call_proposal_ttl_secs", 60)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    /// JSON-RPC WebSocket URL of the media server.
    pub kurento_url: String,
    /// Upper bound on a single media-server request.
    pub request_timeout_secs: u64,
    /// Interval between keepalive pings on the media-server socket.
    pub keepalive_secs: u64,
}

impl MediaConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// How long an unanswered call proposal lives. `0` disables expiry.
    pub call_proposal_ttl_secs: u64,
}

impl SignalingConfig {
    pub fn call_proposal_ttl(&self) -> Option<Duration> {
        (self.call_proposal_ttl_secs > 0).then(|| Duration::from_secs(self.call_proposal_ttl_secs))
    }
}
