//! Per-guild playback: queue, optimistic updates and recovery.

pub mod manager;
pub mod queue;
pub mod state;

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    common::types::{ChannelId, GuildId, now_ms},
    configs::PlayerConfig,
    events::{ClientEvent, DestroyReason, EventSender, QueueChange},
    node::{Node, autoplay},
    protocol::{
        PlayerState, RemotePlayer,
        models::{PlayerUpdate, UpdatePlayerTrack},
        tracks::{CodecError, Track},
    },
    rest::RestError,
    storage::{Store, player_key},
    voice::{Voice, VoiceChange, VoiceError, VoiceRelay, health::HealthMonitor},
};

use self::manager::PlayerManager;
pub use self::{
    queue::Queue,
    state::{Counters, LoopMode, PlaybackState, PlayerSnapshot},
};

pub const MAX_VOLUME: u16 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("player is destroyed")]
    Destroyed,
    #[error("queue is empty")]
    QueueEmpty,
    #[error("nothing is playing")]
    NoTrack,
    #[error("current track is not seekable")]
    NotSeekable,
    #[error("position {position}ms is beyond track length {length}ms")]
    SeekOutOfRange { position: u64, length: u64 },
    #[error("index {index} is out of range for queue of {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("volume {0} is out of range (0..=1000)")]
    InvalidVolume(u16),
    #[error("no previous track")]
    NoPreviousTrack,
    #[error("no voice channel set")]
    NoVoiceChannel,
    #[error("no node available")]
    NoNodeAvailable,
    #[error("node '{0}' is not registered")]
    UnknownNode(String),
    #[error("node '{0}' is not ready")]
    NodeNotReady(String),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Voice(#[from] VoiceError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Arguments for [`Player::play`].
#[derive(Debug, Clone, Default)]
pub struct PlayOptions {
    pub track: Option<Track>,
    /// Base64 track, decoded locally when `track` is not given.
    pub encoded: Option<String>,
    pub position: Option<u64>,
    pub end_time: Option<u64>,
    pub no_replace: bool,
    /// Playing a track again (loop or back); history is left alone.
    pub(crate) replay: bool,
}

impl PlayOptions {
    pub fn track(track: Track) -> Self {
        Self {
            track: Some(track),
            ..Default::default()
        }
    }

    pub fn encoded(encoded: impl Into<String>) -> Self {
        Self {
            encoded: Some(encoded.into()),
            ..Default::default()
        }
    }

    pub fn position(mut self, position: u64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn end_time(mut self, end_time: u64) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn no_replace(mut self, no_replace: bool) -> Self {
        self.no_replace = no_replace;
        self
    }
}

pub struct Player {
    guild_id: GuildId,
    node: RwLock<Arc<Node>>,
    voice: Arc<Voice>,
    queue: Queue,
    state: Mutex<PlaybackState>,
    config: Arc<PlayerConfig>,
    manager: Weak<PlayerManager>,
    events: EventSender,
    store: Arc<dyn Store>,
    destroyed: AtomicBool,
    health: HealthMonitor,
    voice_timer: Mutex<Option<JoinHandle<()>>>,
    seek_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        guild_id: GuildId,
        node: Arc<Node>,
        relay: Arc<dyn VoiceRelay>,
        config: Arc<PlayerConfig>,
        manager: Weak<PlayerManager>,
        events: EventSender,
        store: Arc<dyn Store>,
        volume: Option<u16>,
    ) -> Self {
        let voice = Arc::new(Voice::new(
            guild_id.clone(),
            relay,
            config.voice_connect_timeout(),
        ));
        let state = PlaybackState::new(
            volume.unwrap_or(config.default_volume).min(MAX_VOLUME),
            config.history_size,
        );
        Self {
            health: HealthMonitor::new(config.health_grace()),
            guild_id,
            node: RwLock::new(node),
            voice,
            queue: Queue::new(),
            state: Mutex::new(state),
            config,
            manager,
            events,
            store,
            destroyed: AtomicBool::new(false),
            voice_timer: Mutex::new(None),
            seek_timer: Mutex::new(None),
        }
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    pub fn node(&self) -> Arc<Node> {
        Arc::clone(&self.node.read())
    }

    pub fn voice(&self) -> &Arc<Voice> {
        &self.voice
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Copy of the local state.
    pub fn state(&self) -> PlaybackState {
        self.state.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.state.lock().loop_mode
    }

    pub fn estimated_position(&self) -> u64 {
        self.state.lock().estimated_position()
    }

    pub(crate) fn is_resuming(&self) -> bool {
        self.state.lock().resuming
    }

    fn ensure_alive(&self) -> Result<(), PlayerError> {
        if self.is_destroyed() {
            Err(PlayerError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn ready_node(&self) -> Result<Arc<Node>, PlayerError> {
        let node = self.node();
        if node.is_ready() {
            Ok(node)
        } else {
            Err(PlayerError::NodeNotReady(node.id().to_string()))
        }
    }

    async fn send(&self, update: &PlayerUpdate, no_replace: bool) -> Result<(), PlayerError> {
        let node = self.ready_node()?;
        node.rest()
            .update_player(&self.guild_id, update, no_replace)
            .await?;
        Ok(())
    }

    /// Plays the supplied track, or the queue head.
    ///
    /// The local state flips before the request goes out and is rolled back
    /// exactly if the node rejects it. On success the replaced track goes to
    /// history, even when it is played again.
    pub async fn play(&self, options: PlayOptions) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        let supplied = match (options.track, options.encoded) {
            (Some(track), _) => Some(track),
            (None, Some(encoded)) => Some(Track::decode(&encoded)?),
            (None, None) => None,
        };
        if let Some(track) = supplied {
            self.queue.push_front(track);
        }
        let track = self.queue.pop_front().ok_or(PlayerError::QueueEmpty)?;

        let (previous, was_playing, was_paused, old_position, old_update) = {
            let mut state = self.state.lock();
            let snapshot = (
                state.current.replace(track.clone()),
                state.playing,
                state.paused,
                state.position,
                state.last_update,
            );
            state.playing = true;
            state.paused = false;
            state.set_position(options.position.unwrap_or(0));
            snapshot
        };

        let update = PlayerUpdate {
            track: Some(UpdatePlayerTrack::encoded(&track)),
            position: options.position,
            end_time: options.end_time,
            paused: Some(false),
            ..Default::default()
        };
        if let Err(e) = self.send(&update, options.no_replace).await {
            warn!(
                "[{}] Failed to play '{}': {}",
                self.guild_id, track.info.title, e
            );
            {
                let mut state = self.state.lock();
                state.current = previous;
                state.playing = was_playing;
                state.paused = was_paused;
                state.position = old_position;
                state.last_update = old_update;
            }
            self.queue.push_front(track);
            return Err(e);
        }

        debug!("[{}] Playing '{}'", self.guild_id, track.info.title);
        if !options.replay {
            if let Some(previous) = previous {
                self.state.lock().push_history(previous);
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Plays `track` again from the start without touching history.
    pub(crate) async fn replay(&self, track: &Track) -> Result<(), PlayerError> {
        self.play(PlayOptions {
            track: Some(track.clone()),
            replay: true,
            ..Default::default()
        })
        .await
    }

    pub async fn pause(&self) -> Result<(), PlayerError> {
        self.set_paused(true).await
    }

    pub async fn resume(&self) -> Result<(), PlayerError> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        if self.state.lock().paused == paused {
            return Ok(());
        }
        let update = PlayerUpdate {
            paused: Some(paused),
            ..Default::default()
        };
        self.send(&update, false).await?;
        let mut state = self.state.lock();
        // Freeze or restart the position clock at the flip.
        let position = state.estimated_position();
        state.paused = paused;
        state.set_position(position);
        Ok(())
    }

    /// Moves on. `index` plays that queue entry right away; otherwise the
    /// queue head plays, autoplay kicks in, or playback stops.
    pub async fn skip(self: &Arc<Self>, index: Option<usize>) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        if let Some(index) = index {
            let len = self.queue.len();
            let track = self
                .queue
                .remove(index)
                .ok_or(PlayerError::IndexOutOfRange { index, len })?;
            return self.play(PlayOptions::track(track)).await;
        }

        if !self.queue.is_empty() {
            return self.play(PlayOptions::default()).await;
        }

        let current = self.state.lock().current.clone();
        if let Some(seed) = current.filter(|_| self.config.autoplay) {
            let node = self.ready_node()?;
            if autoplay::run(&node, self, &seed).await? {
                return Ok(());
            }
        }
        self.stop().await
    }

    pub async fn stop(&self) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        let update = PlayerUpdate {
            track: Some(UpdatePlayerTrack::stop()),
            ..Default::default()
        };
        self.send(&update, false).await?;
        self.mark_stopped();
        self.persist().await;
        Ok(())
    }

    pub async fn seek(&self, position: u64) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        let (seekable, length, is_stream) = {
            let state = self.state.lock();
            let track = state.current.as_ref().ok_or(PlayerError::NoTrack)?;
            (track.info.is_seekable, track.info.length, track.info.is_stream)
        };
        if !seekable {
            return Err(PlayerError::NotSeekable);
        }
        if !is_stream && length > 0 && position > length {
            return Err(PlayerError::SeekOutOfRange { position, length });
        }

        let update = PlayerUpdate {
            position: Some(position),
            ..Default::default()
        };
        self.send(&update, false).await?;
        self.state.lock().set_position(position);
        Ok(())
    }

    /// Replays the last history entry, putting the current track back at
    /// the head of the queue.
    pub async fn back(&self) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        let (previous, current) = {
            let mut state = self.state.lock();
            let previous = state
                .history
                .pop_back()
                .ok_or(PlayerError::NoPreviousTrack)?;
            (previous, state.current.clone())
        };
        if let Some(current) = &current {
            self.queue.push_front(current.clone());
        }

        let result = self
            .play(PlayOptions {
                track: Some(previous.clone()),
                replay: true,
                ..Default::default()
            })
            .await;

        if result.is_err() {
            // Undo both pushes; play already put `previous` back at the head.
            self.queue.pop_front();
            if current.is_some() {
                self.queue.pop_front();
            }
            self.state.lock().history.push_back(previous);
        }
        result
    }

    pub async fn set_volume(&self, volume: u16) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        if volume > MAX_VOLUME {
            return Err(PlayerError::InvalidVolume(volume));
        }
        let update = PlayerUpdate {
            volume: Some(volume),
            ..Default::default()
        };
        self.send(&update, false).await?;
        self.state.lock().volume = volume;
        Ok(())
    }

    /// `repeat` bounds track looping; other modes ignore it.
    pub fn set_loop(&self, mode: LoopMode, repeat: Option<u32>) {
        let mut state = self.state.lock();
        state.loop_mode = mode;
        state.repeat = if mode == LoopMode::Track { repeat } else { None };
    }

    /// Forwards an opaque filter object to the node.
    pub async fn set_filters(&self, filters: serde_json::Value) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        let node = self.ready_node()?;
        if let Some(map) = filters.as_object() {
            for name in map.keys().filter(|name| !node.supports_filter(name)) {
                warn!("[{}] Node {} does not advertise filter '{}'", self.guild_id, node.id(), name);
            }
        }
        let update = PlayerUpdate {
            filters: Some(filters.clone()),
            ..Default::default()
        };
        self.send(&update, false).await?;
        self.state.lock().filters = Some(filters);
        Ok(())
    }

    pub fn set_text_channel(&self, channel: Option<ChannelId>) {
        self.state.lock().text_channel = channel;
    }

    pub fn set_data(&self, key: impl Into<String>, value: serde_json::Value) {
        self.state.lock().data.insert(key.into(), value);
    }

    pub fn get_data(&self, key: &str) -> Option<serde_json::Value> {
        self.state.lock().data.get(key).cloned()
    }

    pub fn enqueue(&self, tracks: Vec<Track>) {
        let count = tracks.len();
        self.queue.extend(tracks);
        self.queue_changed(QueueChange::Added(count));
    }

    pub fn remove_track(&self, index: usize) -> Result<Track, PlayerError> {
        let len = self.queue.len();
        let track = self
            .queue
            .remove(index)
            .ok_or(PlayerError::IndexOutOfRange { index, len })?;
        self.queue_changed(QueueChange::Removed(1));
        Ok(track)
    }

    pub fn clear_queue(&self) {
        let removed = self.queue.clear();
        if removed > 0 {
            self.queue_changed(QueueChange::Cleared);
        }
    }

    pub fn shuffle(&self) {
        self.queue.shuffle();
        self.queue_changed(QueueChange::Shuffled);
    }

    fn queue_changed(&self, change: QueueChange) {
        self.events.emit(ClientEvent::QueueUpdate {
            guild_id: self.guild_id.clone(),
            change,
        });
    }

    /// Joins `channel`, or the last known channel.
    pub async fn connect(self: &Arc<Self>, channel: Option<ChannelId>) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        let (channel, mute, deaf) = {
            let mut state = self.state.lock();
            let channel = channel
                .or(state.voice_channel)
                .ok_or(PlayerError::NoVoiceChannel)?;
            state.voice_channel = Some(channel);
            (channel, state.self_mute, state.self_deaf)
        };
        let node = self.ready_node()?;
        self.voice.connect(node, channel, mute, deaf).await?;
        self.state.lock().counters.voice_reconnects = 0;
        self.persist().await;
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.voice.disconnect().await;
        let mut state = self.state.lock();
        state.voice_channel = None;
        state.connected = false;
    }

    pub(crate) fn set_voice_options(
        &self,
        voice_channel: Option<ChannelId>,
        text_channel: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) {
        let mut state = self.state.lock();
        state.voice_channel = voice_channel;
        state.text_channel = text_channel;
        state.self_mute = self_mute;
        state.self_deaf = self_deaf;
    }

    /// Re-establishes voice and sends the current track again, or plays the
    /// queue head when nothing was playing.
    pub async fn restart(self: &Arc<Self>) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        let node = self.ready_node()?;
        let (channel, mute, deaf) = {
            let state = self.state.lock();
            (state.voice_channel, state.self_mute, state.self_deaf)
        };
        if channel.is_some() || self.voice.voice_state().is_some() {
            self.voice.reestablish(node, channel, mute, deaf).await?;
        }
        self.resume_playback().await
    }

    async fn resume_playback(self: &Arc<Self>) -> Result<(), PlayerError> {
        let (current, position, paused, volume, filters) = {
            let mut state = self.state.lock();
            state.resuming = true;
            (
                state.current.clone(),
                state.estimated_position(),
                state.paused,
                state.volume,
                state.filters.clone(),
            )
        };

        let Some(track) = current else {
            self.state.lock().resuming = false;
            if self.queue.is_empty() {
                return Ok(());
            }
            return self.play(PlayOptions::default()).await;
        };

        debug!(
            "[{}] Resuming '{}' at {}ms",
            self.guild_id, track.info.title, position
        );
        let update = PlayerUpdate {
            track: Some(UpdatePlayerTrack::encoded(&track)),
            position: (position > 0).then_some(position),
            paused: Some(paused),
            volume: Some(volume),
            filters,
            ..Default::default()
        };
        let result = self.send(&update, false).await;
        {
            let mut state = self.state.lock();
            state.resuming = false;
            if result.is_ok() {
                state.playing = true;
                state.set_position(position);
            }
        }
        result?;

        let delay = Duration::from_millis(self.config.restart_seek_delay_ms);
        if track.info.is_seekable && position > 0 && !delay.is_zero() {
            self.schedule_seek(delay, position);
        }
        Ok(())
    }

    /// Some nodes drop the start position of a freshly sent track; a late
    /// seek puts it back.
    fn schedule_seek(self: &Arc<Self>, delay: Duration, position: u64) {
        let player = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            player.seek_timer.lock().take();
            if let Err(e) = player.seek(position).await {
                debug!("[{}] Delayed seek failed: {}", player.guild_id, e);
            }
        });
        if let Some(stale) = self.seek_timer.lock().replace(timer) {
            stale.abort();
        }
    }

    /// Rebinds the player to `target` and restarts playback there.
    pub async fn transfer_node(self: &Arc<Self>, target: Arc<Node>) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        let from = self.node();
        if from.id() == target.id() {
            return Ok(());
        }
        if let Err(e) = from.rest().destroy_player(&self.guild_id).await {
            debug!(
                "[{}] Could not release player on {}: {}",
                self.guild_id,
                from.id(),
                e
            );
        }
        *self.node.write() = Arc::clone(&target);
        info!(
            "[{}] Moved from node {} to {}",
            self.guild_id,
            from.id(),
            target.id()
        );
        self.events.emit(ClientEvent::PlayerSwitchedNode {
            guild_id: self.guild_id.clone(),
            from: from.id().to_string(),
            to: target.id().to_string(),
        });
        self.restart().await
    }

    /// Idempotent. Leaves voice, releases the remote player and forgets the
    /// stored snapshot.
    pub async fn destroy(&self, reason: DestroyReason) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[{}] Destroying player: {}", self.guild_id, reason);

        self.health.cancel();
        for timer in [&self.voice_timer, &self.seek_timer] {
            if let Some(timer) = timer.lock().take() {
                timer.abort();
            }
        }
        self.voice.destroy().await;
        self.queue.clear();
        self.mark_stopped();

        let node = self.node();
        if let Err(e) = node.rest().destroy_player(&self.guild_id).await {
            debug!("[{}] Remote destroy failed: {}", self.guild_id, e);
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(&self.guild_id);
        }
        if let Err(e) = self.store.remove(&player_key(&self.guild_id)).await {
            warn!("[{}] Failed to drop snapshot: {}", self.guild_id, e);
        }
        self.events.emit(ClientEvent::PlayerDestroy {
            guild_id: self.guild_id.clone(),
            reason,
        });
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        let encode = |t: &Track| t.encoded().to_string();
        let state = self.state.lock();
        PlayerSnapshot {
            guild_id: self.guild_id.to_string(),
            node_id: self.node().id().to_string(),
            voice_channel: state.voice_channel,
            text_channel: state.text_channel,
            current: state.current.as_ref().map(encode),
            queue: self.queue.tracks().iter().map(encode).collect(),
            history: state.history.iter().map(encode).collect(),
            position: state.estimated_position(),
            volume: state.volume,
            paused: state.paused,
            loop_mode: state.loop_mode,
            repeat: state.repeat,
            filters: state.filters.clone(),
            data: state.data.clone(),
            timestamp: now_ms(),
        }
    }

    /// Loads a stored snapshot into a fresh player.
    pub(crate) fn apply_snapshot(&self, snapshot: &PlayerSnapshot) -> Result<(), CodecError> {
        let decode = |encoded: &String| Track::decode(encoded);
        let current = snapshot.current.as_ref().map(decode).transpose()?;
        let queue = snapshot.queue.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        let history = snapshot.history.iter().map(decode).collect::<Result<Vec<_>, _>>()?;

        self.queue.extend(queue);
        let mut state = self.state.lock();
        state.current = current;
        for track in history {
            state.push_history(track);
        }
        state.voice_channel = snapshot.voice_channel;
        state.text_channel = snapshot.text_channel;
        state.position = snapshot.position;
        state.volume = snapshot.volume.min(MAX_VOLUME);
        state.paused = snapshot.paused;
        state.loop_mode = snapshot.loop_mode;
        state.repeat = snapshot.repeat;
        state.filters = snapshot.filters.clone();
        state.data = snapshot.data.clone();
        Ok(())
    }

    /// Swaps the current track for the node's decoding of it, which carries
    /// plugin info a local decode cannot recover.
    pub(crate) async fn refresh_current(&self) {
        let Some(current) = self.state.lock().current.clone() else {
            return;
        };
        let node = self.node();
        match current.refresh(node.rest()).await {
            Ok(fresh) => {
                let mut state = self.state.lock();
                if state.current.as_ref() == Some(&current) {
                    state.current = Some(fresh);
                }
            }
            Err(e) => debug!(
                "[{}] Keeping local metadata for '{}': {}",
                self.guild_id, current.info.title, e
            ),
        }
    }

    async fn persist(&self) {
        if self.is_destroyed() {
            return;
        }
        let snapshot = self.snapshot();
        self.state.lock().last_persist = snapshot.timestamp;
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = self.store.set(&player_key(&self.guild_id), json).await {
                    warn!("[{}] Failed to persist snapshot: {}", self.guild_id, e);
                }
            }
            Err(e) => warn!("[{}] Failed to serialize snapshot: {}", self.guild_id, e),
        }
    }

    /// Takes over what a resumed session still holds for this guild.
    pub(crate) fn adopt_remote(&self, remote: &RemotePlayer) {
        let mut state = self.state.lock();
        state.current = remote.track.clone();
        state.playing = remote.track.is_some();
        state.paused = remote.paused;
        state.volume = remote.volume;
        state.connected = remote.state.connected;
        state.ping = remote.state.ping;
        state.set_position(remote.state.position);
        if !remote.filters.is_null() && remote.filters != serde_json::json!({}) {
            state.filters = Some(remote.filters.clone());
        }
    }

    pub(crate) async fn on_player_update(self: &Arc<Self>, update: PlayerState) {
        let (playing, persist) = {
            let mut state = self.state.lock();
            state.position = update.position;
            state.last_update = now_ms();
            state.ping = update.ping;
            state.connected = update.connected;
            if update.connected {
                state.counters.health_strikes = 0;
            }
            let interval = self.config.position_persist_interval_ms;
            let persist = state.playing && state.last_update.saturating_sub(state.last_persist) >= interval;
            (state.playing && !state.paused, persist)
        };
        self.health.observe(self, update.connected, playing);
        if persist {
            self.persist().await;
        }
    }

    /// Escalates after the node kept reporting a dead voice connection:
    /// re-forward, then full restart, then give up.
    pub(crate) async fn recover_voice(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let strikes = {
            let mut state = self.state.lock();
            state.counters.health_strikes += 1;
            state.counters.health_strikes
        };
        warn!("[{}] Voice unhealthy (strike {})", self.guild_id, strikes);

        let result = match strikes {
            1 => {
                let (channel, mute, deaf) = {
                    let state = self.state.lock();
                    (state.voice_channel, state.self_mute, state.self_deaf)
                };
                match self.ready_node() {
                    Ok(node) => self
                        .voice
                        .reestablish(node, channel, mute, deaf)
                        .await
                        .map_err(PlayerError::from),
                    Err(e) => Err(e),
                }
            }
            2 => self.restart().await,
            _ => {
                self.destroy(DestroyReason::VoiceUnhealthy).await;
                return;
            }
        };
        if let Err(e) = result {
            warn!("[{}] Voice recovery failed: {}", self.guild_id, e);
        }
    }

    pub(crate) fn schedule_voice_reconnect(self: &Arc<Self>, delay: Duration) {
        debug!("[{}] Reconnecting voice in {:?}", self.guild_id, delay);
        let player = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            player.voice_timer.lock().take();
            if let Err(e) = player.reconnect_voice().await {
                warn!("[{}] Voice reconnect failed: {}", player.guild_id, e);
            }
        });
        if let Some(stale) = self.voice_timer.lock().replace(timer) {
            stale.abort();
        }
    }

    async fn reconnect_voice(self: &Arc<Self>) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        let (channel, mute, deaf) = {
            let state = self.state.lock();
            (state.voice_channel, state.self_mute, state.self_deaf)
        };
        let channel = channel
            .or_else(|| self.voice.channel_id())
            .ok_or(PlayerError::NoVoiceChannel)?;
        let node = self.ready_node()?;
        self.voice.connect(node, channel, mute, deaf).await?;
        self.state.lock().counters.voice_reconnects = 0;
        self.resume_playback().await
    }

    pub(crate) async fn on_voice_state_update(
        self: &Arc<Self>,
        channel: Option<ChannelId>,
        session_id: String,
    ) {
        match self.voice.on_session_update(channel, session_id) {
            VoiceChange::Unchanged => {}
            VoiceChange::Left => {
                info!("[{}] Removed from voice channel", self.guild_id);
                self.destroy(DestroyReason::VoiceLeft).await;
            }
            VoiceChange::Moved { from, to } => {
                info!("[{}] Moved to voice channel {}", self.guild_id, to);
                self.state.lock().voice_channel = Some(to);
                self.voice.set_moving(true);
                let result = self.restart().await;
                self.voice.set_moving(false);
                if let Err(e) = result {
                    warn!("[{}] Restart after move failed: {}", self.guild_id, e);
                }
                self.events.emit(ClientEvent::PlayerMove {
                    guild_id: self.guild_id.clone(),
                    from,
                    to: Some(to),
                });
            }
        }
    }

    pub(crate) async fn on_voice_server_update(&self, token: String, endpoint: Option<String>) {
        let node = self.node();
        self.voice.on_server_update(token, endpoint, &node).await;
    }

    pub(crate) fn mark_started(&self) {
        let mut state = self.state.lock();
        state.playing = true;
        state.resuming = false;
        state.counters.stuck = 0;
        state.counters.exceptions = 0;
        state.counters.load_retries = 0;
        state.counters.voice_reconnects = 0;
    }

    pub(crate) fn mark_stopped(&self) {
        let mut state = self.state.lock();
        state.current = None;
        state.playing = false;
        state.paused = false;
        state.position = 0;
    }

    /// Claims a load retry if the budget allows one.
    pub(crate) fn take_load_retry(&self) -> bool {
        if !self.config.retry_on_failure {
            return false;
        }
        let mut state = self.state.lock();
        if state.counters.load_retries >= self.config.max_load_retries {
            return false;
        }
        state.counters.load_retries += 1;
        true
    }

    /// Whether track looping should replay once more. A bounded repeat that
    /// runs out switches looping off.
    pub(crate) fn consume_repeat(&self) -> bool {
        let mut state = self.state.lock();
        match state.repeat {
            None => true,
            Some(0) => {
                state.loop_mode = LoopMode::Off;
                state.repeat = None;
                false
            }
            Some(n) => {
                state.repeat = Some(n - 1);
                if n == 1 {
                    state.loop_mode = LoopMode::Off;
                    state.repeat = None;
                }
                true
            }
        }
    }

    pub(crate) fn bump_stuck(&self) -> u32 {
        let mut state = self.state.lock();
        state.counters.stuck += 1;
        state.counters.stuck
    }

    pub(crate) fn reset_stuck(&self) {
        self.state.lock().counters.stuck = 0;
    }

    pub(crate) fn bump_exceptions(&self) -> u32 {
        let mut state = self.state.lock();
        state.counters.exceptions += 1;
        state.counters.exceptions
    }

    pub(crate) fn reset_exceptions(&self) {
        self.state.lock().counters.exceptions = 0;
    }

    pub(crate) fn bump_voice_reconnects(&self) -> u32 {
        let mut state = self.state.lock();
        state.counters.voice_reconnects += 1;
        state.counters.voice_reconnects
    }

    /// Queue ran dry with nothing left to pick.
    pub(crate) async fn finish_queue(&self) {
        {
            let mut state = self.state.lock();
            if let Some(last) = state.current.take() {
                state.push_history(last);
            }
            state.playing = false;
            state.position = 0;
        }
        self.events.emit(ClientEvent::QueueEnd {
            guild_id: self.guild_id.clone(),
        });
        if self.config.auto_leave {
            self.destroy(DestroyReason::QueueEnded).await;
        } else {
            self.persist().await;
        }
    }
}
