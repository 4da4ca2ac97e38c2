use serde::{Deserialize, Serialize};

/// Strategy used to pick a node for a new player or a failover target.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeSelection {
    /// Fewest playing players.
    #[default]
    LeastPlayers,
    /// Lowest load penalty computed from the last stats frame.
    LeastLoad,
    Random,
    /// First usable node in registration order.
    Priority,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClientConfig {
    /// Bot user id sent in the `User-Id` handshake header.
    #[serde(default)]
    pub user_id: u64,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default)]
    pub node_selection: NodeSelection,
    /// Move players off a node that went away.
    #[serde(default = "default_true")]
    pub auto_move_players: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: 0,
            client_name: default_client_name(),
            node_selection: NodeSelection::default(),
            auto_move_players: true,
        }
    }
}

fn default_client_name() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn default_true() -> bool {
    true
}
