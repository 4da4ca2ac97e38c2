//! Voice session rendezvous.
//!
//! Playback needs two pieces of information from the host's voice gateway:
//! the voice state (session id and channel) and the voice server (token and
//! endpoint). They arrive independently and in any order. [`Voice`] collects
//! both, then forwards them to the owning node.

pub mod health;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::{
    common::types::{AnyResult, ChannelId, GuildId},
    node::Node,
    protocol::models::{PlayerUpdate, VoiceState},
};

/// Gateway opcode for a voice state update.
const OP_VOICE_STATE_UPDATE: u8 = 4;

/// Delivers payloads to the host's chat gateway.
#[async_trait]
pub trait VoiceRelay: Send + Sync {
    async fn send(&self, guild_id: &GuildId, payload: serde_json::Value) -> AnyResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    #[error("voice handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("voice connection was destroyed")]
    Destroyed,
    #[error("no voice channel to join")]
    NoChannel,
    #[error("relay failed: {0}")]
    Relay(String),
    #[error("failed to forward voice state to node: {0}")]
    Forward(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Destroyed,
}

/// What a voice state update meant for an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceChange {
    Unchanged,
    Moved {
        from: Option<ChannelId>,
        to: ChannelId,
    },
    Left,
}

#[derive(Debug, Default, Clone)]
struct Halves {
    session_id: Option<String>,
    channel_id: Option<ChannelId>,
    token: Option<String>,
    endpoint: Option<String>,
}

impl Halves {
    fn voice_state(&self) -> Option<VoiceState> {
        Some(VoiceState {
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
            session_id: self.session_id.clone()?,
            channel_id: Some(self.channel_id?.to_string()),
        })
    }
}

type PendingConnect = Shared<BoxFuture<'static, Result<(), VoiceError>>>;

pub struct Voice {
    guild_id: GuildId,
    relay: Arc<dyn VoiceRelay>,
    timeout: Duration,
    state: Mutex<VoiceConnectionState>,
    halves: Mutex<Halves>,
    arrived: Notify,
    pending: Mutex<Option<PendingConnect>>,
    moving: AtomicBool,
}

impl Voice {
    pub fn new(guild_id: GuildId, relay: Arc<dyn VoiceRelay>, timeout: Duration) -> Self {
        Self {
            guild_id,
            relay,
            timeout,
            state: Mutex::new(VoiceConnectionState::Disconnected),
            halves: Mutex::new(Halves::default()),
            arrived: Notify::new(),
            pending: Mutex::new(None),
            moving: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> VoiceConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == VoiceConnectionState::Connected
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.halves.lock().channel_id
    }

    /// Both halves, if both have arrived.
    pub fn voice_state(&self) -> Option<VoiceState> {
        self.halves.lock().voice_state()
    }

    pub fn is_moving(&self) -> bool {
        self.moving.load(Ordering::Acquire)
    }

    pub fn set_moving(&self, moving: bool) {
        self.moving.store(moving, Ordering::Release);
    }

    fn set_state(&self, next: VoiceConnectionState) {
        let mut state = self.state.lock();
        if *state != VoiceConnectionState::Destroyed {
            *state = next;
        }
    }

    /// Joins `channel` and completes the handshake through `node`.
    ///
    /// Concurrent callers share a single in-flight attempt.
    pub async fn connect(
        self: &Arc<Self>,
        node: Arc<Node>,
        channel: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), VoiceError> {
        if self.state() == VoiceConnectionState::Destroyed {
            return Err(VoiceError::Destroyed);
        }

        let attempt = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let this = Arc::clone(self);
                    let attempt = async move {
                        let result = this.handshake(node, channel, self_mute, self_deaf).await;
                        this.pending.lock().take();
                        result
                    }
                    .boxed()
                    .shared();
                    *pending = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    async fn handshake(
        &self,
        node: Arc<Node>,
        channel: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), VoiceError> {
        self.set_state(VoiceConnectionState::Connecting);
        *self.halves.lock() = Halves::default();

        debug!("[{}] Joining voice channel {}", self.guild_id, channel);
        let payload = join_payload(&self.guild_id, Some(channel), self_mute, self_deaf);
        if let Err(e) = self.relay.send(&self.guild_id, payload).await {
            self.set_state(VoiceConnectionState::Disconnected);
            return Err(VoiceError::Relay(e.to_string()));
        }

        if tokio::time::timeout(self.timeout, self.wait_for_halves())
            .await
            .is_err()
        {
            warn!(
                "[{}] Voice handshake timed out after {:?}",
                self.guild_id, self.timeout
            );
            self.set_state(VoiceConnectionState::Disconnected);
            return Err(VoiceError::Timeout(self.timeout));
        }

        if let Err(e) = self.forward(&node).await {
            self.set_state(VoiceConnectionState::Disconnected);
            return Err(e);
        }
        self.set_state(VoiceConnectionState::Connected);
        debug!("[{}] Voice connected through node {}", self.guild_id, node.id());
        Ok(())
    }

    async fn wait_for_halves(&self) {
        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();
            if self.halves.lock().voice_state().is_some() {
                return;
            }
            arrived.await;
        }
    }

    /// Sends both halves to `node`.
    pub async fn forward(&self, node: &Node) -> Result<(), VoiceError> {
        let voice = self
            .voice_state()
            .ok_or_else(|| VoiceError::Forward("voice halves incomplete".into()))?;
        let update = PlayerUpdate {
            voice: Some(voice),
            ..Default::default()
        };
        node.rest()
            .update_player(&self.guild_id, &update, true)
            .await
            .map_err(|e| VoiceError::Forward(e.to_string()))
    }

    /// Records a voice state update for the bot user.
    pub fn on_session_update(&self, channel: Option<ChannelId>, session_id: String) -> VoiceChange {
        let previous = {
            let mut halves = self.halves.lock();
            let previous = halves.channel_id;
            halves.session_id = Some(session_id);
            halves.channel_id = channel;
            previous
        };
        self.arrived.notify_waiters();

        if !self.is_connected() {
            return VoiceChange::Unchanged;
        }
        match channel {
            None => VoiceChange::Left,
            Some(to) if Some(to) != previous => VoiceChange::Moved { from: previous, to },
            Some(_) => VoiceChange::Unchanged,
        }
    }

    /// Records a voice server update. A null endpoint means the server is
    /// still being allocated and is ignored.
    pub async fn on_server_update(&self, token: String, endpoint: Option<String>, node: &Node) {
        let Some(endpoint) = endpoint else {
            debug!("[{}] Voice server allocating, waiting for endpoint", self.guild_id);
            return;
        };
        {
            let mut halves = self.halves.lock();
            halves.token = Some(token);
            halves.endpoint = Some(endpoint);
        }
        self.arrived.notify_waiters();

        if self.is_connected() {
            debug!("[{}] Voice endpoint changed, forwarding", self.guild_id);
            if let Err(e) = self.forward(node).await {
                warn!("[{}] {}", self.guild_id, e);
            }
        }
    }

    /// Re-forwards known halves to `node`, or runs a full connect when they
    /// are incomplete.
    pub async fn reestablish(
        self: &Arc<Self>,
        node: Arc<Node>,
        channel: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), VoiceError> {
        if self.voice_state().is_some() {
            self.forward(&node).await?;
            self.set_state(VoiceConnectionState::Connected);
            return Ok(());
        }
        match channel.or_else(|| self.channel_id()) {
            Some(channel) => self.connect(node, channel, self_mute, self_deaf).await,
            None => Err(VoiceError::NoChannel),
        }
    }

    /// Leaves the voice channel and forgets both halves.
    pub async fn disconnect(&self) {
        let payload = join_payload(&self.guild_id, None, false, false);
        if let Err(e) = self.relay.send(&self.guild_id, payload).await {
            warn!("[{}] Failed to relay voice leave: {}", self.guild_id, e);
        }
        *self.halves.lock() = Halves::default();
        self.set_state(VoiceConnectionState::Disconnected);
    }

    pub async fn destroy(&self) {
        if self.state() == VoiceConnectionState::Destroyed {
            return;
        }
        self.disconnect().await;
        *self.state.lock() = VoiceConnectionState::Destroyed;
        self.arrived.notify_waiters();
    }
}

fn join_payload(
    guild_id: &GuildId,
    channel: Option<ChannelId>,
    self_mute: bool,
    self_deaf: bool,
) -> serde_json::Value {
    json!({
        "op": OP_VOICE_STATE_UPDATE,
        "d": {
            "guild_id": guild_id.to_string(),
            "channel_id": channel.map(|c| c.to_string()),
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        }
    })
}
