//! A single audio node: socket lifecycle, session handling and message dispatch.

pub mod autoplay;
pub(crate) mod backoff;
pub(crate) mod handler;
pub mod manager;
pub mod state;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Weak,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    common::types::{GuildId, SessionId},
    configs::{ClientConfig, NodeConfig},
    events::{ClientEvent, EventSender},
    player::manager::PlayerManager,
    protocol::{IncomingMessage, NodeStats, PlayerState, session::SessionUpdate},
    rest::{RestClient, RestError},
    storage::{Store, node_session_key},
    transport::{CLOSE_NORMAL, TransportEvent, TransportHandle, WebSocket, WsConfig},
};

use self::{
    backoff::Backoff,
    manager::NodeManager,
    state::{Capabilities, NodeState},
};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node '{0}' is already registered")]
    DuplicateNode(String),
    #[error("node '{0}' not found")]
    NotFound(String),
    #[error("node '{0}' is destroyed")]
    Destroyed(String),
    #[error("node '{0}' is not ready")]
    NotReady(String),
    #[error(transparent)]
    Rest(#[from] RestError),
}

pub struct Node {
    id: String,
    config: NodeConfig,
    user_id: u64,
    client_name: String,
    rest: RestClient,
    state: RwLock<NodeState>,
    capabilities: RwLock<Capabilities>,
    stats: RwLock<Option<NodeStats>>,
    /// Heartbeat round trip in ms, -1 until measured.
    ping: AtomicI64,
    backoff: Mutex<Backoff>,
    /// Bumped per connection so events from a replaced socket are ignored.
    generation: AtomicU64,
    transport: Mutex<Option<TransportHandle>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    store: Arc<dyn Store>,
    events: EventSender,
    manager: Weak<NodeManager>,
}

impl Node {
    pub(crate) fn new(
        config: NodeConfig,
        client: &ClientConfig,
        store: Arc<dyn Store>,
        events: EventSender,
        manager: Weak<NodeManager>,
    ) -> Result<Self, NodeError> {
        let rest = RestClient::new(config.rest_url(), &config.password, config.request_timeout())?;
        let backoff = Backoff::new(
            config.reconnect_base_ms,
            config.reconnect_max_ms,
            config.max_reconnect_attempts,
        );
        Ok(Self {
            id: config.id(),
            user_id: client.user_id,
            client_name: client.client_name.clone(),
            rest,
            state: RwLock::new(NodeState::Disconnected),
            capabilities: RwLock::new(Capabilities::default()),
            stats: RwLock::new(None),
            ping: AtomicI64::new(-1),
            backoff: Mutex::new(backoff),
            generation: AtomicU64::new(0),
            transport: Mutex::new(None),
            reconnect_timer: Mutex::new(None),
            store,
            events,
            manager,
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.rest.session_id()
    }

    pub fn stats(&self) -> Option<NodeStats> {
        self.stats.read().clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.read().clone()
    }

    pub fn supports_source(&self, name: &str) -> bool {
        self.capabilities.read().supports_source(name)
    }

    pub fn supports_filter(&self, name: &str) -> bool {
        self.capabilities.read().supports_filter(name)
    }

    pub fn ping(&self) -> Option<Duration> {
        u64::try_from(self.ping.load(Ordering::Relaxed))
            .ok()
            .map(Duration::from_millis)
    }

    /// Load penalty from the latest stats; 0 until stats arrive.
    pub fn penalty(&self) -> f64 {
        self.stats.read().as_ref().map_or(0.0, NodeStats::penalty)
    }

    pub fn playing_players(&self) -> u32 {
        self.stats.read().as_ref().map_or(0, |s| s.playing_players)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.lock().attempt()
    }

    pub(crate) fn events(&self) -> &EventSender {
        &self.events
    }

    pub(crate) fn players(&self) -> Option<Arc<PlayerManager>> {
        self.manager.upgrade()?.players()
    }

    fn set_state(&self, next: NodeState) {
        let mut state = self.state.write();
        if !state.is_terminal() {
            *state = next;
        }
    }

    /// Opens the socket. Returns once the connection task is started; the
    /// outcome is reported through node events.
    pub async fn connect(self: &Arc<Self>) -> Result<(), NodeError> {
        if self.state().is_terminal() {
            return Err(NodeError::Destroyed(self.id.clone()));
        }
        // Taken, not aborted: this may be running inside the timer task.
        self.reconnect_timer.lock().take();

        let session = if self.config.resume {
            match self.store.get(&node_session_key(&self.id)).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("[{}] Failed to read stored session: {}", self.id, e);
                    None
                }
            }
        } else {
            None
        };

        let mut ws = WsConfig::new(self.config.websocket_url())
            .header("Authorization", &self.config.password)
            .header("User-Id", self.user_id.to_string())
            .header("Client-Name", &self.client_name);
        ws.heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        ws.heartbeat_timeout = Duration::from_millis(self.config.heartbeat_timeout_ms);
        ws.connect_timeout = self.config.request_timeout();

        if let Some(session) = &session {
            ws = ws.header("Session-Id", session.as_str());
            self.set_state(NodeState::Resuming);
        } else {
            self.set_state(NodeState::Connecting);
        }

        info!(
            "[{}] Connecting to {} (resume: {})",
            self.id,
            ws.url,
            session.is_some()
        );

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (handle, events) = WebSocket::open(ws);
        if let Some(previous) = self.transport.lock().replace(handle) {
            previous.close(CLOSE_NORMAL, "reconnecting");
        }

        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                if node.generation.load(Ordering::Acquire) != generation {
                    break;
                }
                node.handle_transport_event(event).await;
            }
        });
        Ok(())
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Open { headers } => self.on_open(&headers).await,
            TransportEvent::Text(text) => self.handle_message(&text).await,
            TransportEvent::Binary(data) => {
                debug!("[{}] Ignoring {} byte binary message", self.id, data.len());
            }
            TransportEvent::Latency(latency) => {
                self.ping
                    .store(latency.as_millis() as i64, Ordering::Relaxed);
            }
            TransportEvent::Error(e) => {
                warn!("[{}] Transport error: {}", self.id, e);
                self.events.emit(ClientEvent::NodeError {
                    node: self.id.clone(),
                    error: e.to_string(),
                });
            }
            TransportEvent::Close { code, reason } => self.on_transport_closed(code, reason).await,
        }
    }

    async fn on_open(&self, headers: &HashMap<String, String>) {
        if let Some(timer) = self.reconnect_timer.lock().take() {
            timer.abort();
        }
        self.backoff.lock().reset();
        self.set_state(NodeState::Connected);
        debug!(
            "[{}] Socket open (session resumed header: {})",
            self.id,
            headers.get("session-resumed").map_or("absent", String::as_str)
        );

        match self.rest.info().await {
            Ok(info) => {
                debug!(
                    "[{}] Node v{} with {} sources, {} filters",
                    self.id,
                    info.version.semver,
                    info.source_managers.len(),
                    info.filters.len()
                );
                *self.capabilities.write() = Capabilities::from_info(info);
            }
            Err(e) => warn!("[{}] Failed to fetch node info: {}", self.id, e),
        }
    }

    /// Interprets one JSON message from the node. Malformed input is logged
    /// and dropped.
    pub(crate) async fn handle_message(self: &Arc<Self>, text: &str) {
        let message = match IncomingMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] Dropping malformed message: {}", self.id, e);
                return;
            }
        };

        match message {
            IncomingMessage::Ready {
                resumed,
                session_id,
            } => self.on_ready(resumed, session_id).await,
            IncomingMessage::Stats(stats) => self.on_stats(stats),
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                self.on_player_update(&guild_id, state).await
            }
            IncomingMessage::Event(event) => handler::dispatch(self, event).await,
            IncomingMessage::Unknown => debug!("[{}] Ignoring unknown op: {}", self.id, text),
        }
    }

    async fn on_ready(self: &Arc<Self>, resumed: bool, session_id: SessionId) {
        info!(
            "[{}] Ready with session {} (resumed: {})",
            self.id, session_id, resumed
        );
        self.rest.set_session_id(Some(session_id.clone()));
        if let Err(e) = self
            .store
            .set(&node_session_key(&self.id), session_id.to_string())
            .await
        {
            warn!("[{}] Failed to persist session id: {}", self.id, e);
        }
        self.set_state(NodeState::Ready);

        if self.config.resume {
            let update = SessionUpdate {
                resuming: Some(true),
                timeout: Some(self.config.resume_timeout_secs),
            };
            if let Err(e) = self.rest.update_session(&update).await {
                warn!("[{}] Failed to enable resuming: {}", self.id, e);
            }
        }

        if resumed {
            self.reconcile().await;
        } else {
            self.restart_players(None);
        }
        self.events.emit(ClientEvent::NodeReady {
            node: self.id.clone(),
            resumed,
        });
    }

    /// Brings local players in line with what a resumed session still holds.
    async fn reconcile(self: &Arc<Self>) {
        let Some(players) = self.players() else {
            return;
        };
        let remote = match self.rest.get_players().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("[{}] Failed to list players after resume: {}", self.id, e);
                self.restart_players(None);
                return;
            }
        };

        let local = players.players_on(&self.id);
        let local_ids: HashSet<&GuildId> = local.iter().map(|p| p.guild_id()).collect();
        let mut missing = Vec::new();

        for player in &local {
            match remote.iter().find(|r| &r.guild_id == player.guild_id()) {
                Some(state) => player.adopt_remote(state),
                None => missing.push(player.guild_id().clone()),
            }
        }

        for orphan in remote.iter().filter(|r| !local_ids.contains(&r.guild_id)) {
            debug!("[{}] Destroying orphaned player {}", self.id, orphan.guild_id);
            if let Err(e) = self.rest.destroy_player(&orphan.guild_id).await {
                warn!(
                    "[{}] Failed to destroy orphan {}: {}",
                    self.id, orphan.guild_id, e
                );
            }
        }

        self.events.debug(format!(
            "[{}] Resumed: {} adopted, {} restarted",
            self.id,
            local.len() - missing.len(),
            missing.len()
        ));
        self.restart_players(Some(&missing));
    }

    /// Restarts local players on this node, all of them or only `only`.
    fn restart_players(&self, only: Option<&[GuildId]>) {
        let Some(players) = self.players() else {
            return;
        };
        for player in players.players_on(&self.id) {
            if only.is_some_and(|ids| !ids.contains(player.guild_id())) {
                continue;
            }
            tokio::spawn(async move {
                if let Err(e) = player.restart().await {
                    warn!("[{}] Restart failed: {}", player.guild_id(), e);
                }
            });
        }
    }

    fn on_stats(&self, stats: NodeStats) {
        let changed = {
            let mut current = self.stats.write();
            let changed = current.as_ref().is_none_or(|prev| {
                prev.players != stats.players || prev.playing_players != stats.playing_players
            });
            *current = Some(stats.clone());
            changed
        };
        if changed {
            self.events.debug(format!(
                "[{}] Stats: {} players, {} playing",
                self.id, stats.players, stats.playing_players
            ));
        }
    }

    async fn on_player_update(&self, guild_id: &GuildId, state: PlayerState) {
        let Some(player) = self.players().and_then(|p| p.get(guild_id)) else {
            return;
        };
        if player.node().id() != self.id {
            return;
        }
        player.on_player_update(state).await;
    }

    pub(crate) async fn on_transport_closed(self: &Arc<Self>, code: u16, reason: String) {
        if self.state().is_terminal() {
            return;
        }
        // Anything still queued from this socket is stale now.
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.transport.lock().take();
        self.set_state(NodeState::Disconnected);
        warn!("[{}] Disconnected ({}): {}", self.id, code, reason);
        self.events.emit(ClientEvent::NodeDisconnect {
            node: self.id.clone(),
            code,
            reason,
        });

        let next = {
            let mut backoff = self.backoff.lock();
            if backoff.is_exhausted() {
                None
            } else {
                Some((backoff.next(), backoff.attempt()))
            }
        };

        if let Some(manager) = self.manager.upgrade() {
            manager.failover(self, next.is_none()).await;
        }

        match next {
            None => {
                error!(
                    "[{}] Giving up after {} reconnect attempts",
                    self.id, self.config.max_reconnect_attempts
                );
                self.destroy("reconnect attempts exhausted").await;
            }
            Some((delay, attempt)) => self.schedule_reconnect(delay, attempt),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, delay: Duration, attempt: u32) {
        info!(
            "[{}] Reconnecting in {:?} (attempt {})",
            self.id, delay, attempt
        );
        self.events.emit(ClientEvent::NodeReconnecting {
            node: self.id.clone(),
            attempt,
            delay,
        });

        let node = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = node.connect().await {
                debug!("[{}] Reconnect skipped: {}", node.id, e);
            }
        });
        if let Some(stale) = self.reconnect_timer.lock().replace(timer) {
            stale.abort();
        }
    }

    /// Terminal. Closes the socket, cancels timers and leaves the registry.
    /// Players are not touched; see [`NodeManager::remove`].
    pub async fn destroy(&self, reason: &str) {
        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return;
            }
            *state = NodeState::Destroyed;
        }
        info!("[{}] Destroyed: {}", self.id, reason);

        if let Some(timer) = self.reconnect_timer.lock().take() {
            timer.abort();
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.close(CLOSE_NORMAL, reason);
        }
        if let Err(e) = self.store.remove(&node_session_key(&self.id)).await {
            warn!("[{}] Failed to drop stored session: {}", self.id, e);
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(&self.id);
        }
        self.events.emit(ClientEvent::NodeDestroy {
            node: self.id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Closes the socket without reconnecting or forgetting the session, so
    /// a later [`Node::connect`] can resume it.
    pub fn close(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(timer) = self.reconnect_timer.lock().take() {
            timer.abort();
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.close(CLOSE_NORMAL, "client shutdown");
        }
        self.set_state(NodeState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::PlayerConfig,
        player::manager::PlayerOptions,
        test_support::{MockNode, drain_events, ready_client, ready_client_with, remote_player_json, sample_track},
    };

    #[tokio::test]
    async fn test_ready_enables_resume_and_loads_capabilities() {
        let mock = MockNode::start().await;
        let (client, node) = ready_client(&mock).await;

        assert!(node.is_ready());
        assert_eq!(node.session_id().unwrap().0, "test-session");
        assert!(node.supports_source("YouTube"));
        assert!(node.supports_filter("timescale"));
        assert_eq!(
            client.store.get(&node_session_key(node.id())).await.unwrap().as_deref(),
            Some("test-session")
        );

        let session = mock.bodies("PATCH", "/v4/sessions/test-session");
        assert_eq!(session, vec![serde_json::json!({"resuming": true, "timeout": 60})]);
        assert!(mock.handshakes()[0].contains("User-Id: 1234\r\n"));
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_are_dropped() {
        let mock = MockNode::start().await;
        let (_client, node) = ready_client(&mock).await;

        node.handle_message("{not json").await;
        node.handle_message(r#"{"op":"somethingNew"}"#).await;
        node.handle_message(r#"{"op":"event","type":"FutureEvent","guildId":"1"}"#)
            .await;
        assert!(node.is_ready());
    }

    #[tokio::test]
    async fn test_stats_signal_only_on_count_change() {
        let mock = MockNode::start().await;
        let (client, node) = ready_client(&mock).await;
        drain_events(&client.events);

        let stats = |players: u32, uptime: u64| {
            serde_json::json!({
                "op": "stats", "players": players, "playingPlayers": players, "uptime": uptime,
                "memory": {"free": 1, "used": 1, "allocated": 1, "reservable": 1},
                "cpu": {"cores": 2, "systemLoad": 0.1, "lavalinkLoad": 0.05}
            })
            .to_string()
        };
        node.handle_message(&stats(2, 1)).await;
        node.handle_message(&stats(2, 2)).await;
        node.handle_message(&stats(3, 3)).await;

        let debug_lines = drain_events(&client.events)
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::Debug { message } if message.contains("Stats")))
            .count();
        assert_eq!(debug_lines, 2);
        assert_eq!(node.stats().unwrap().uptime, 3);
        assert_eq!(node.playing_players(), 3);
    }

    #[tokio::test]
    async fn test_resume_reconciles_players() {
        let mock = MockNode::start().await;
        let (client, node) = ready_client(&mock).await;
        let players = client.client.players();

        let kept = players.create(PlayerOptions::new("1")).unwrap();
        let track = sample_track("kept", 200_000);
        mock.respond(
            "GET",
            "/v4/sessions/test-session/players",
            serde_json::json!([
                remote_player_json("1", Some(&track), true, 55_000),
                remote_player_json("99", None, false, 0),
            ]),
        );

        node.handle_message(r#"{"op":"ready","resumed":true,"sessionId":"test-session"}"#)
            .await;

        assert_eq!(mock.count("DELETE", "/v4/sessions/test-session/players/99"), 1);
        assert_eq!(mock.count("DELETE", "/v4/sessions/test-session/players/1"), 0);
        let state = kept.state();
        assert_eq!(state.current.as_ref(), Some(&track));
        assert!(state.paused);
        assert_eq!(state.position, 55_000);
    }

    #[tokio::test]
    async fn test_close_with_budget_schedules_reconnect() {
        let mock = MockNode::start().await;
        let mut config = mock.node_config();
        config.reconnect_base_ms = 60_000;
        let (client, node) = ready_client_with(&mock, config, PlayerConfig::default()).await;
        drain_events(&client.events);

        node.on_transport_closed(4000, "test".into()).await;

        assert_eq!(node.state(), NodeState::Disconnected);
        assert_eq!(node.reconnect_attempts(), 1);
        let events = drain_events(&client.events);
        assert!(events.iter().any(|e| matches!(e, ClientEvent::NodeDisconnect { code: 4000, .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::NodeReconnecting { attempt: 1, delay, .. } if *delay == Duration::from_secs(60)
        )));

        node.destroy("test over").await;
        assert!(client.client.nodes().get(node.id()).is_none());
    }

    #[tokio::test]
    async fn test_close_without_budget_destroys_node_and_players() {
        let mock = MockNode::start().await;
        let mut config = mock.node_config();
        config.max_reconnect_attempts = 0;
        let (client, node) = ready_client_with(&mock, config, PlayerConfig::default()).await;
        let players = client.client.players();
        players.create(PlayerOptions::new("5")).unwrap();
        drain_events(&client.events);

        node.on_transport_closed(1006, "gone".into()).await;

        assert_eq!(node.state(), NodeState::Destroyed);
        assert!(client.client.nodes().get(node.id()).is_none());
        assert!(players.get(&GuildId::from("5")).is_none());
        let events = drain_events(&client.events);
        assert!(events.iter().any(|e| matches!(e, ClientEvent::NodeDestroy { .. })));
        assert!(events.iter().any(|e| matches!(e, ClientEvent::PlayerDestroy { .. })));
    }
}
