use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeConfig {
    /// Stable identifier. Defaults to `host:port`.
    #[serde(default)]
    pub identifier: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Offer the stored session id on connect and enable resuming once ready.
    #[serde(default = "default_true")]
    pub resume: bool,
    #[serde(default = "default_resume_timeout_secs")]
    pub resume_timeout_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            identifier: None,
            host: host.into(),
            port,
            password: password.into(),
            resume: true,
            resume_timeout_secs: default_resume_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn id(&self) -> String {
        self.identifier
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    pub fn websocket_url(&self) -> String {
        format!("ws://{}:{}/v4/websocket", self.host, self.port)
    }

    pub fn rest_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_resume_timeout_secs() -> u64 {
    60
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}
