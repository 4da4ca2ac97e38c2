use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Playback and recovery policy shared by every player.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlayerConfig {
    #[serde(default = "default_volume")]
    pub default_volume: u16,
    /// Bound of the previous-tracks buffer.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default)]
    pub autoplay: bool,
    /// Destroy the player once the queue has run dry.
    #[serde(default)]
    pub auto_leave: bool,
    #[serde(default = "default_true")]
    pub retry_on_failure: bool,
    #[serde(default = "default_max_load_retries")]
    pub max_load_retries: u32,
    #[serde(default)]
    pub skip_stuck_tracks: bool,
    #[serde(default = "default_stuck_seek_ms")]
    pub stuck_seek_ms: u64,
    #[serde(default = "default_max_stuck_attempts")]
    pub max_stuck_attempts: u32,
    #[serde(default)]
    pub auto_skip_on_error: bool,
    #[serde(default = "default_exception_threshold")]
    pub exception_threshold: u32,
    #[serde(default = "default_voice_connect_timeout_ms")]
    pub voice_connect_timeout_ms: u64,
    #[serde(default = "default_voice_reconnect_attempts")]
    pub voice_reconnect_attempts: u32,
    #[serde(default = "default_voice_reconnect_delay_ms")]
    pub voice_reconnect_delay_ms: u64,
    #[serde(default = "default_health_grace_ms")]
    pub health_grace_ms: u64,
    #[serde(default = "default_restart_seek_delay_ms")]
    pub restart_seek_delay_ms: u64,
    #[serde(default = "default_position_persist_interval_ms")]
    pub position_persist_interval_ms: u64,
}

impl PlayerConfig {
    pub fn voice_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.voice_connect_timeout_ms)
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_millis(self.health_grace_ms)
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            history_size: default_history_size(),
            autoplay: false,
            auto_leave: false,
            retry_on_failure: true,
            max_load_retries: default_max_load_retries(),
            skip_stuck_tracks: false,
            stuck_seek_ms: default_stuck_seek_ms(),
            max_stuck_attempts: default_max_stuck_attempts(),
            auto_skip_on_error: false,
            exception_threshold: default_exception_threshold(),
            voice_connect_timeout_ms: default_voice_connect_timeout_ms(),
            voice_reconnect_attempts: default_voice_reconnect_attempts(),
            voice_reconnect_delay_ms: default_voice_reconnect_delay_ms(),
            health_grace_ms: default_health_grace_ms(),
            restart_seek_delay_ms: default_restart_seek_delay_ms(),
            position_persist_interval_ms: default_position_persist_interval_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_volume() -> u16 {
    100
}

fn default_history_size() -> usize {
    25
}

fn default_max_load_retries() -> u32 {
    2
}

fn default_stuck_seek_ms() -> u64 {
    5_000
}

fn default_max_stuck_attempts() -> u32 {
    3
}

fn default_exception_threshold() -> u32 {
    3
}

fn default_voice_connect_timeout_ms() -> u64 {
    15_000
}

fn default_voice_reconnect_attempts() -> u32 {
    3
}

fn default_voice_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_health_grace_ms() -> u64 {
    5_000
}

fn default_restart_seek_delay_ms() -> u64 {
    500
}

fn default_position_persist_interval_ms() -> u64 {
    10_000
}
