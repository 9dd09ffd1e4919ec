use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const HOST_VAR: &str = "INTERVENE_API_HOST";
pub const SECURE_VAR: &str = "INTERVENE_API_SECURE";

/// Where the job service lives and how hard to try reaching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// `host[:port]` of the job service.
    pub host: String,
    /// Use `wss`/`https` instead of `ws`/`http`.
    pub secure: bool,
    pub ws_path: String,
    pub reconnection_attempts: u32,
    pub reconnection_delay_ms: u64,
    pub wait_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "localhost:5001".to_string(),
            secure: false,
            ws_path: "/ws".to_string(),
            reconnection_attempts: 10,
            reconnection_delay_ms: 500,
            wait_timeout_secs: 10,
        }
    }
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `INTERVENE_API_HOST` and `INTERVENE_API_SECURE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(host) = lookup(HOST_VAR) {
            config.host = host;
        }
        if let Some(secure) = lookup(SECURE_VAR) {
            match secure.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.secure = true,
                "0" | "false" | "no" => config.secure = false,
                other => log::warn!("Ignoring {SECURE_VAR}={other}, expected true or false"),
            }
        }
        config
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}{}", self.host, self.ws_path)
    }

    pub fn http_url(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}{path}", self.host)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }
}
