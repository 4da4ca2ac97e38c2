use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{
    common::types::{ChannelId, now_ms},
    protocol::tracks::Track,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

/// Transient recovery counters, reset on track start.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub stuck: u32,
    pub exceptions: u32,
    pub load_retries: u32,
    pub voice_reconnects: u32,
    pub health_strikes: u32,
}

/// Local view of a player. Everything here is mirrored from, or about to
/// be sent to, the owning node.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    pub current: Option<Track>,
    /// Previously played tracks, newest last.
    pub history: VecDeque<Track>,
    pub history_limit: usize,
    pub playing: bool,
    pub paused: bool,
    pub connected: bool,
    pub volume: u16,
    pub loop_mode: LoopMode,
    /// Remaining track repeats; `None` loops forever.
    pub repeat: Option<u32>,
    /// Last known position in ms.
    pub position: u64,
    /// Local time of the last position sample.
    pub last_update: u64,
    pub ping: i64,
    pub voice_channel: Option<ChannelId>,
    pub text_channel: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
    /// Set while the player is re-sending its track after a restart.
    pub resuming: bool,
    pub counters: Counters,
    pub data: HashMap<String, serde_json::Value>,
    pub filters: Option<serde_json::Value>,
    pub last_persist: u64,
}

impl PlaybackState {
    pub fn new(volume: u16, history_limit: usize) -> Self {
        Self {
            current: None,
            history: VecDeque::with_capacity(history_limit),
            history_limit,
            playing: false,
            paused: false,
            connected: false,
            volume,
            loop_mode: LoopMode::Off,
            repeat: None,
            position: 0,
            last_update: 0,
            ping: -1,
            voice_channel: None,
            text_channel: None,
            self_mute: false,
            self_deaf: true,
            resuming: false,
            counters: Counters::default(),
            data: HashMap::new(),
            filters: None,
            last_persist: 0,
        }
    }

    /// Appends to history, evicting the oldest entries past the limit.
    pub fn push_history(&mut self, track: Track) {
        if self.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(track);
    }

    /// Position extrapolated from the last sample while playing.
    pub fn estimated_position(&self) -> u64 {
        if !self.playing || self.paused || self.last_update == 0 {
            return self.position;
        }
        let elapsed = now_ms().saturating_sub(self.last_update);
        let position = self.position + elapsed;
        match &self.current {
            Some(track) if track.info.length > 0 && !track.info.is_stream => {
                position.min(track.info.length)
            }
            _ => position,
        }
    }

    pub fn set_position(&mut self, position: u64) {
        self.position = position;
        self.last_update = now_ms();
    }
}

/// Serializable player snapshot kept in the store under `player:{guild}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub guild_id: String,
    pub node_id: String,
    pub voice_channel: Option<ChannelId>,
    pub text_channel: Option<ChannelId>,
    pub current: Option<String>,
    #[serde(default)]
    pub queue: Vec<String>,
    #[serde(default)]
    pub history: Vec<String>,
    pub position: u64,
    pub volume: u16,
    pub paused: bool,
    pub loop_mode: LoopMode,
    #[serde(default)]
    pub repeat: Option<u32>,
    #[serde(default)]
    pub filters: Option<serde_json::Value>,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_track;

    #[test]
    fn test_history_is_bounded() {
        let mut state = PlaybackState::new(100, 2);
        for id in ["a", "b", "c"] {
            state.push_history(sample_track(id, 1_000));
        }
        let ids: Vec<&str> = state.history.iter().map(|t| t.info.identifier.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);

        let mut none = PlaybackState::new(100, 0);
        none.push_history(sample_track("a", 1_000));
        assert!(none.history.is_empty());
    }

    #[test]
    fn test_estimated_position_is_clamped_to_length() {
        let mut state = PlaybackState::new(100, 5);
        state.current = Some(sample_track("a", 10_000));
        state.playing = true;
        state.position = 9_000;
        state.last_update = now_ms() - 5_000;
        assert_eq!(state.estimated_position(), 10_000);

        state.paused = true;
        assert_eq!(state.estimated_position(), 9_000);
    }

    #[test]
    fn test_loop_mode_wire_names() {
        assert_eq!(serde_json::to_string(&LoopMode::Queue).unwrap(), "\"queue\"");
        let mode: LoopMode = serde_json::from_str("\"track\"").unwrap();
        assert_eq!(mode, LoopMode::Track);
    }
}
