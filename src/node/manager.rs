//! Node registry, selection and failover.

use std::sync::{Arc, OnceLock, Weak};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::{
    configs::{ClientConfig, NodeConfig, NodeSelection},
    events::{ClientEvent, DestroyReason, EventSender},
    node::{Node, NodeError},
    player::manager::PlayerManager,
    storage::Store,
};

pub struct NodeManager {
    nodes: DashMap<String, Arc<Node>>,
    /// Registration order, used by priority selection and listing.
    order: RwLock<Vec<String>>,
    client: ClientConfig,
    store: Arc<dyn Store>,
    events: EventSender,
    players: OnceLock<Weak<PlayerManager>>,
    self_ref: Weak<NodeManager>,
}

impl NodeManager {
    pub fn new(client: ClientConfig, store: Arc<dyn Store>, events: EventSender) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            nodes: DashMap::new(),
            order: RwLock::new(Vec::new()),
            client,
            store,
            events,
            players: OnceLock::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub(crate) fn bind_players(&self, players: &Arc<PlayerManager>) {
        let _ = self.players.set(Arc::downgrade(players));
    }

    pub(crate) fn players(&self) -> Option<Arc<PlayerManager>> {
        self.players.get()?.upgrade()
    }

    /// Registers a node without connecting it.
    pub fn add(&self, config: NodeConfig) -> Result<Arc<Node>, NodeError> {
        let id = config.id();
        let node = match self.nodes.entry(id.clone()) {
            Entry::Occupied(_) => return Err(NodeError::DuplicateNode(id)),
            Entry::Vacant(slot) => {
                let node = Arc::new(Node::new(
                    config,
                    &self.client,
                    Arc::clone(&self.store),
                    self.events.clone(),
                    self.self_ref.clone(),
                )?);
                slot.insert(Arc::clone(&node));
                node
            }
        };
        self.order.write().push(id.clone());
        info!("Registered node {}", id);
        self.events.emit(ClientEvent::NodeCreate { node: id });
        Ok(node)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.get(id).map(|n| Arc::clone(n.value()))
    }

    /// All registered nodes in registration order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.order.read().iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub async fn connect_all(&self) {
        for node in self.nodes() {
            if let Err(e) = node.connect().await {
                warn!("[{}] Failed to start connection: {}", node.id(), e);
            }
        }
    }

    /// Best ready node under the configured strategy.
    pub fn select(&self) -> Option<Arc<Node>> {
        self.select_excluding(None)
    }

    pub fn select_excluding(&self, exclude: Option<&str>) -> Option<Arc<Node>> {
        let ready: Vec<Arc<Node>> = self
            .nodes()
            .into_iter()
            .filter(|n| n.is_ready() && Some(n.id()) != exclude)
            .collect();

        match self.client.node_selection {
            NodeSelection::Priority => ready.into_iter().next(),
            NodeSelection::Random => ready.choose(&mut rand::thread_rng()).cloned(),
            // `min_by_key` keeps the first of equal minimums.
            NodeSelection::LeastPlayers => ready.into_iter().min_by_key(|n| n.playing_players()),
            NodeSelection::LeastLoad => ready
                .into_iter()
                .min_by(|a, b| a.penalty().total_cmp(&b.penalty())),
        }
    }

    /// Destroys a node and moves or destroys its players.
    pub async fn remove(&self, id: &str) -> Result<(), NodeError> {
        let node = self
            .get(id)
            .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
        node.destroy("removed").await;
        self.failover(&node, true).await;
        Ok(())
    }

    pub(crate) fn unregister(&self, id: &str) {
        if self.nodes.remove(id).is_some() {
            self.order.write().retain(|n| n != id);
        }
    }

    /// Moves players off `node`. With `terminal`, players that cannot move
    /// are destroyed; otherwise they wait for the node to come back.
    pub(crate) async fn failover(&self, node: &Arc<Node>, terminal: bool) {
        let Some(players) = self.players() else {
            return;
        };

        for player in players.players_on(node.id()) {
            let target = if self.client.auto_move_players {
                self.select_excluding(Some(node.id()))
            } else {
                None
            };

            match target {
                Some(target) => {
                    if let Err(e) = player.transfer_node(Arc::clone(&target)).await {
                        warn!(
                            "[{}] Failed to move to node {}: {}",
                            player.guild_id(),
                            target.id(),
                            e
                        );
                        if terminal {
                            player.destroy(DestroyReason::NodeDestroyed).await;
                        }
                    }
                }
                None if terminal => player.destroy(DestroyReason::NodeDestroyed).await,
                None => {}
            }
        }
    }

    /// Closes every node socket, keeping sessions for a later resume.
    pub fn shutdown(&self) {
        for node in self.nodes() {
            node.close();
        }
    }
}
