use std::sync::Arc;

use tracing::info;

use crate::{
    common::Result,
    configs::Config,
    events::{ClientEvent, EventSender},
    node::manager::NodeManager,
    player::{PlayerError, manager::PlayerManager},
    protocol::tracks::LoadResult,
    storage::Store,
    voice::VoiceRelay,
};

/// Entry point for a host application: owns the node registry, the player
/// registry and the receiving end of the event stream.
pub struct Client {
    nodes: Arc<NodeManager>,
    players: Arc<PlayerManager>,
    events: flume::Receiver<ClientEvent>,
}

impl Client {
    /// Registers every configured node. Nothing connects until
    /// [`Client::connect`].
    pub fn new(config: &Config, relay: Arc<dyn VoiceRelay>, store: Arc<dyn Store>) -> Result<Self> {
        let (events, rx) = EventSender::channel();
        let nodes = NodeManager::new(config.client.clone(), Arc::clone(&store), events.clone());
        let players = PlayerManager::new(
            Arc::clone(&nodes),
            relay,
            config.player.clone(),
            config.client.user_id,
            store,
            events,
        );
        for node in &config.nodes {
            nodes.add(node.clone())?;
        }
        Ok(Self {
            nodes,
            players,
            events: rx,
        })
    }

    pub fn nodes(&self) -> &Arc<NodeManager> {
        &self.nodes
    }

    pub fn players(&self) -> &Arc<PlayerManager> {
        &self.players
    }

    /// Host event stream. Receivers share one queue.
    pub fn events(&self) -> flume::Receiver<ClientEvent> {
        self.events.clone()
    }

    pub async fn connect(&self) {
        info!("Connecting {} node(s)", self.nodes.len());
        self.nodes.connect_all().await;
    }

    /// Resolves `identifier` on the best ready node.
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let node = self.nodes.select().ok_or(PlayerError::NoNodeAvailable)?;
        Ok(node.rest().load_tracks(identifier).await?)
    }

    /// Closes node sockets. Sessions and player snapshots stay in the store
    /// for the next start.
    pub fn shutdown(&self) {
        info!("Shutting down");
        self.nodes.shutdown();
    }
}
