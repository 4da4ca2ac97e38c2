use std::collections::HashSet;

use crate::protocol::NodeInfo;

/// Connection lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    /// Connecting while offering a stored session id.
    Resuming,
    /// Socket is open, waiting for `ready`.
    Connected,
    Ready,
    /// Terminal.
    Destroyed,
}

impl NodeState {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    pub fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting | Self::Resuming)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Destroyed
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Resuming => "resuming",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// What a node can do, as reported by `/v4/info`.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub sources: HashSet<String>,
    pub filters: HashSet<String>,
    pub info: Option<NodeInfo>,
}

impl Capabilities {
    pub fn from_info(info: NodeInfo) -> Self {
        Self {
            sources: info.source_managers.iter().map(|s| s.to_lowercase()).collect(),
            filters: info.filters.iter().map(|s| s.to_lowercase()).collect(),
            info: Some(info),
        }
    }

    pub fn supports_source(&self, name: &str) -> bool {
        self.sources.contains(&name.to_lowercase())
    }

    pub fn supports_filter(&self, name: &str) -> bool {
        self.filters.contains(&name.to_lowercase())
    }
}
