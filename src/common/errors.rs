use serde::{Deserialize, Serialize};

use crate::{
    node::NodeError, player::PlayerError, protocol::tracks::CodecError, rest::RestError,
    transport::TransportError, voice::VoiceError,
};

/// Exception severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
    #[serde(other)]
    Unknown,
}

impl Severity {
    /// Whether a track failing with this severity should be skipped at once.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Fault)
    }
}

/// Error body returned by a node's REST API on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeErrorBody {
    /// Unix timestamp in milliseconds.
    #[serde(default)]
    pub timestamp: u64,
    /// HTTP status code.
    pub status: u16,
    /// HTTP status reason phrase (e.g. "Bad Request").
    #[serde(default)]
    pub error: String,
    /// Human-readable error message.
    #[serde(default)]
    pub message: String,
    /// The request path that caused the error.
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Crate-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Voice(#[from] VoiceError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Player(#[from] PlayerError),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
