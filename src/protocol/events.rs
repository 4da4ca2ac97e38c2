use serde::{Deserialize, Serialize};

use crate::{
    common::{Severity, types::GuildId},
    protocol::tracks::Track,
};

/// Player events pushed by a node inside an `event` message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename = "TrackStartEvent")]
    TrackStart {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
    },

    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
        reason: TrackEndReason,
    },

    #[serde(rename = "TrackExceptionEvent")]
    TrackException {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
        exception: TrackException,
    },

    #[serde(rename = "TrackStuckEvent")]
    TrackStuck {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
        #[serde(rename = "thresholdMs")]
        threshold_ms: u64,
    },

    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        code: u16,
        reason: String,
        #[serde(rename = "byRemote")]
        by_remote: bool,
    },

    /// Plugin or future event types.
    #[serde(other)]
    Unknown,
}

impl NodeEvent {
    pub fn guild_id(&self) -> Option<&GuildId> {
        match self {
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::TrackStuck { guild_id, .. }
            | Self::WebSocketClosed { guild_id, .. } => Some(guild_id),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Whether the node expects the client to start the next track.
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
    #[serde(default)]
    pub cause_stack_trace: Option<String>,
}

/// Discord voice close codes after which reconnecting is pointless.
///
/// - `4004`: authentication failed
/// - `4011`: server not found
/// - `4012`: unknown protocol
/// - `4014`: disconnected (kicked, channel deleted)
/// - `4016`: unknown encryption mode
pub fn is_fatal_voice_close(code: u16) -> bool {
    matches!(code, 4004 | 4011 | 4012 | 4014 | 4016)
}
