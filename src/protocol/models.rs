use serde::{Deserialize, Serialize};

use crate::{common::types::GuildId, protocol::tracks::Track};

/// Player state carried by `playerUpdate` messages and REST player objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Unix timestamp in milliseconds.
    pub time: u64,
    /// Playback position in milliseconds.
    #[serde(default)]
    pub position: u64,
    /// Whether the node is connected to the voice gateway.
    pub connected: bool,
    /// Voice gateway ping in milliseconds. -1 if not connected.
    pub ping: i64,
}

/// Voice credentials forwarded to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// Player object returned by GET /v4/sessions/{sessionId}/players.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePlayer {
    pub guild_id: GuildId,
    pub track: Option<Track>,
    pub volume: u16,
    pub paused: bool,
    pub state: PlayerState,
    pub voice: VoiceState,
    #[serde(default)]
    pub filters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TrackEncoded {
    Clear,       // JSON: null
    Set(String), // JSON: string
}

/// Track field in a player update request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerTrack {
    /// Base64-encoded track. Null to stop. Omit to keep current.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded: Option<TrackEncoded>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

impl UpdatePlayerTrack {
    pub fn encoded(track: &Track) -> Self {
        Self {
            encoded: Some(TrackEncoded::Set(track.encoded().to_string())),
            identifier: None,
            user_data: match &track.user_data {
                serde_json::Value::Object(map) if map.is_empty() => None,
                other => Some(other.clone()),
            },
        }
    }

    pub fn stop() -> Self {
        Self {
            encoded: Some(TrackEncoded::Clear),
            ..Default::default()
        }
    }
}

/// Request body for PATCH /v4/sessions/{sessionId}/players/{guildId}.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdatePlayerTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}
