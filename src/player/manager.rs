//! Guild-keyed player registry and the host's voice gateway entry points.

use std::sync::{Arc, Weak};

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, info, warn};

use crate::{
    common::types::{ChannelId, GuildId},
    configs::PlayerConfig,
    events::{ClientEvent, DestroyReason, EventSender},
    node::manager::NodeManager,
    player::{Player, PlayerError, PlayerSnapshot},
    storage::{PLAYER_KEY_PATTERN, Store},
    voice::VoiceRelay,
};

/// Arguments for [`PlayerManager::create`].
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub guild_id: GuildId,
    pub voice_channel: Option<ChannelId>,
    pub text_channel: Option<ChannelId>,
    /// Pin the player to this node instead of using the selection strategy.
    pub node: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub volume: Option<u16>,
}

impl PlayerOptions {
    pub fn new(guild_id: impl Into<GuildId>) -> Self {
        Self {
            guild_id: guild_id.into(),
            voice_channel: None,
            text_channel: None,
            node: None,
            self_mute: false,
            self_deaf: true,
            volume: None,
        }
    }

    pub fn voice_channel(mut self, channel: impl Into<ChannelId>) -> Self {
        self.voice_channel = Some(channel.into());
        self
    }

    pub fn text_channel(mut self, channel: impl Into<ChannelId>) -> Self {
        self.text_channel = Some(channel.into());
        self
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn self_mute(mut self, mute: bool) -> Self {
        self.self_mute = mute;
        self
    }

    pub fn self_deaf(mut self, deaf: bool) -> Self {
        self.self_deaf = deaf;
        self
    }

    pub fn volume(mut self, volume: u16) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// Voice state update for a guild member, as seen by the host gateway.
#[derive(Debug, Clone)]
pub struct VoiceStateUpdate {
    pub guild_id: GuildId,
    pub user_id: u64,
    pub channel_id: Option<ChannelId>,
    pub session_id: String,
}

/// Voice server update for a guild, as seen by the host gateway.
#[derive(Debug, Clone)]
pub struct VoiceServerUpdate {
    pub guild_id: GuildId,
    pub token: String,
    /// `None` while the voice server is being allocated.
    pub endpoint: Option<String>,
}

pub struct PlayerManager {
    players: DashMap<GuildId, Arc<Player>>,
    nodes: Arc<NodeManager>,
    relay: Arc<dyn VoiceRelay>,
    config: Arc<PlayerConfig>,
    user_id: u64,
    store: Arc<dyn Store>,
    events: EventSender,
    self_ref: Weak<PlayerManager>,
}

impl PlayerManager {
    pub fn new(
        nodes: Arc<NodeManager>,
        relay: Arc<dyn VoiceRelay>,
        config: PlayerConfig,
        user_id: u64,
        store: Arc<dyn Store>,
        events: EventSender,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|self_ref| Self {
            players: DashMap::new(),
            nodes: Arc::clone(&nodes),
            relay,
            config: Arc::new(config),
            user_id,
            store,
            events,
            self_ref: self_ref.clone(),
        });
        nodes.bind_players(&manager);
        manager
    }

    /// Returns the guild's player, creating it on the requested or selected
    /// node if there is none.
    pub fn create(&self, options: PlayerOptions) -> Result<Arc<Player>, PlayerError> {
        if let Some(existing) = self.get(&options.guild_id) {
            return Ok(existing);
        }

        let node = match &options.node {
            Some(id) => self
                .nodes
                .get(id)
                .ok_or_else(|| PlayerError::UnknownNode(id.clone()))?,
            None => self.nodes.select().ok_or(PlayerError::NoNodeAvailable)?,
        };

        match self.players.entry(options.guild_id.clone()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(slot) => {
                let player = Arc::new(Player::new(
                    options.guild_id.clone(),
                    Arc::clone(&node),
                    Arc::clone(&self.relay),
                    Arc::clone(&self.config),
                    self.self_ref.clone(),
                    self.events.clone(),
                    Arc::clone(&self.store),
                    options.volume,
                ));
                player.set_voice_options(
                    options.voice_channel,
                    options.text_channel,
                    options.self_mute,
                    options.self_deaf,
                );
                slot.insert(Arc::clone(&player));
                info!("[{}] Created player on node {}", options.guild_id, node.id());
                self.events.emit(ClientEvent::PlayerCreate {
                    guild_id: options.guild_id,
                    node: node.id().to_string(),
                });
                Ok(player)
            }
        }
    }

    pub fn get(&self, guild_id: &GuildId) -> Option<Arc<Player>> {
        self.players.get(guild_id).map(|p| Arc::clone(p.value()))
    }

    pub async fn destroy(&self, guild_id: &GuildId) {
        if let Some(player) = self.get(guild_id) {
            player.destroy(DestroyReason::Requested).await;
        }
    }

    pub fn players_on(&self, node_id: &str) -> Vec<Arc<Player>> {
        self.players
            .iter()
            .filter(|p| p.node().id() == node_id)
            .map(|p| Arc::clone(p.value()))
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Player>> {
        self.players.iter().map(|p| Arc::clone(p.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub(crate) fn unregister(&self, guild_id: &GuildId) {
        self.players.remove(guild_id);
    }

    /// Feeds a gateway voice state update. Updates for other users are
    /// ignored.
    pub async fn handle_voice_state_update(&self, update: VoiceStateUpdate) {
        if update.user_id != self.user_id {
            return;
        }
        let Some(player) = self.get(&update.guild_id) else {
            debug!("[{}] Voice state for unknown player", update.guild_id);
            return;
        };
        player
            .on_voice_state_update(update.channel_id, update.session_id)
            .await;
    }

    pub async fn handle_voice_server_update(&self, update: VoiceServerUpdate) {
        let Some(player) = self.get(&update.guild_id) else {
            debug!("[{}] Voice server for unknown player", update.guild_id);
            return;
        };
        player
            .on_voice_server_update(update.token, update.endpoint)
            .await;
    }

    /// Rebuilds players from stored snapshots and restarts them. Returns
    /// how many were restored.
    pub async fn restore(&self) -> usize {
        let keys = match self.store.keys(Some(PLAYER_KEY_PATTERN)).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list stored players: {}", e);
                return 0;
            }
        };

        let mut restored = 0;
        for key in keys {
            let snapshot = match self.store.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<PlayerSnapshot>(&raw) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("Dropping unreadable snapshot {}: {}", key, e);
                        continue;
                    }
                },
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read snapshot {}: {}", key, e);
                    continue;
                }
            };

            let node = self
                .nodes
                .get(&snapshot.node_id)
                .filter(|n| n.is_ready())
                .or_else(|| self.nodes.select());
            let Some(node) = node else {
                warn!("[{}] No node available to restore on", snapshot.guild_id);
                continue;
            };

            let mut options = PlayerOptions::new(snapshot.guild_id.clone()).node(node.id());
            options.voice_channel = snapshot.voice_channel;
            options.text_channel = snapshot.text_channel;
            let player = match self.create(options) {
                Ok(player) => player,
                Err(e) => {
                    warn!("[{}] Failed to restore player: {}", snapshot.guild_id, e);
                    continue;
                }
            };
            if let Err(e) = player.apply_snapshot(&snapshot) {
                warn!("[{}] Snapshot holds a bad track: {}", snapshot.guild_id, e);
                player.destroy(DestroyReason::Requested).await;
                continue;
            }
            player.refresh_current().await;
            if let Err(e) = player.restart().await {
                warn!("[{}] Restored player failed to restart: {}", snapshot.guild_id, e);
            }
            restored += 1;
        }
        restored
    }
}
