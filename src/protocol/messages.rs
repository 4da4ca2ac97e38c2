use serde::Deserialize;

use crate::{
    common::types::{GuildId, SessionId},
    protocol::{events::NodeEvent, models::PlayerState, stats::NodeStats},
};

/// Messages sent from a node to the client over the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Ready {
        resumed: bool,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    #[serde(rename = "playerUpdate")]
    PlayerUpdate {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        state: PlayerState,
    },
    Stats(NodeStats),
    Event(NodeEvent),
    #[serde(other)]
    Unknown,
}

impl IncomingMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
