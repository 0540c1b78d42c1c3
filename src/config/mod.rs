//! Configuration module for the newsroom board.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::SyncError;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the hosted service
    pub backend_url: String,
    /// Public API key sent with every request
    pub anon_key: Option<String>,
    /// Privileged key, only needed for the admin user directory
    pub service_key: Option<String>,
    /// Where the session token is persisted between runs
    pub session_path: PathBuf,
    /// Buffered change notifications per table before a subscriber lags
    pub realtime_capacity: usize,
    /// Realtime socket heartbeat interval
    pub heartbeat: Duration,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines instead of text
    pub log_json: bool,
    /// Display name used by the watcher when no session is persisted
    pub login_name: Option<String>,
    pub login_password: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, SyncError> {
        dotenvy::dotenv().ok();

        let backend_url = env::var("NEWSROOM_BACKEND_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:54321".to_string())
            .trim_end_matches('/')
            .to_string();

        let anon_key = env::var("NEWSROOM_ANON_KEY").ok();
        let service_key = env::var("NEWSROOM_SERVICE_KEY").ok();

        let session_path = env::var("NEWSROOM_SESSION_PATH")
            .unwrap_or_else(|_| "./data/session.json".to_string())
            .into();

        let realtime_capacity = parse_var("NEWSROOM_REALTIME_CAPACITY", 256)?;
        let heartbeat = Duration::from_secs(parse_var("NEWSROOM_HEARTBEAT_SECS", 25)?);

        let log_level = env::var("NEWSROOM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("NEWSROOM_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let login_name = env::var("NEWSROOM_LOGIN_NAME").ok();
        let login_password = env::var("NEWSROOM_LOGIN_PASSWORD").ok();

        Ok(Self {
            backend_url,
            anon_key,
            service_key,
            session_path,
            realtime_capacity,
            heartbeat,
            log_level,
            log_json,
            login_name,
            login_password,
        })
    }

    /// Websocket endpoint of the realtime service.
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.backend_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.backend_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.backend_url.clone()
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base,
            self.anon_key.as_deref().unwrap_or_default()
        )
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, SyncError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SyncError::Config(format!("Invalid {} value: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}
