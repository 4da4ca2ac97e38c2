//! Shared fixtures: a mock node speaking just enough HTTP and WebSocket,
//! a recording voice relay and a client wired to them.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::JoinHandle,
};

use crate::{
    client::Client,
    common::types::{AnyResult, GuildId},
    configs::{Config, NodeConfig, PlayerConfig},
    events::ClientEvent,
    node::Node,
    protocol::tracks::{Track, TrackInfo},
    storage::MemoryStore,
    transport::{frame::OpCode, handshake::accept_key},
    voice::VoiceRelay,
};

const WAIT: Duration = Duration::from_secs(5);

/// Reads an HTTP head up to and including the blank line.
pub async fn read_http_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match socket.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// A valid 101 answer to the upgrade request in `head`.
pub fn upgrade_response(head: &str, extra: &[(&str, &str)]) -> String {
    let key = header_value(head, "sec-websocket-key").unwrap_or_default();
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
        accept_key(key)
    );
    for (name, value) in extra {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Request target, query included.
    pub path: String,
    pub body: Option<Value>,
    pub authorization: Option<String>,
}

impl RecordedRequest {
    fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }
}

#[derive(Default)]
struct MockState {
    requests: Mutex<Vec<RecordedRequest>>,
    handshakes: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, String)>>,
    responses: Mutex<HashMap<(String, String), Value>>,
}

/// Node stand-in on a local port. Every HTTP request is recorded; the
/// WebSocket endpoint sends `ready` for session `test-session`.
pub struct MockNode {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockNode {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, Arc::clone(&shared)));
            }
        });
        Self { addr, state, task }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig::new("127.0.0.1", self.addr.port(), "youshallnotpass")
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.requests.lock().last().cloned()
    }

    /// Answers 500 to `method` requests whose target starts with `prefix`.
    pub fn fail(&self, method: &str, prefix: &str) {
        self.state
            .failures
            .lock()
            .push((method.to_string(), prefix.to_string()));
    }

    /// Serves `body` for `method` on `path` (query ignored).
    pub fn respond(&self, method: &str, path: &str, body: Value) {
        self.state
            .responses
            .lock()
            .insert((method.to_string(), path.to_string()), body);
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.route() == path)
            .count()
    }

    /// JSON bodies sent with `method` to `path` (query ignored), oldest first.
    pub fn bodies(&self, method: &str, path: &str) -> Vec<Value> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.route() == path)
            .filter_map(|r| r.body.clone())
            .collect()
    }

    /// Raw heads of WebSocket upgrade requests.
    pub fn handshakes(&self) -> Vec<String> {
        self.state.handshakes.lock().clone()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream, state: Arc<MockState>) {
    let head = read_http_head(&mut socket).await;
    if head.is_empty() {
        return;
    }
    if header_value(&head, "upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket")) {
        serve_websocket(socket, head, state).await;
        return;
    }

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let length: usize = header_value(&head, "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    if length > 0 && socket.read_exact(&mut body).await.is_err() {
        return;
    }

    let request = RecordedRequest {
        method,
        path,
        body: serde_json::from_slice(&body).ok(),
        authorization: header_value(&head, "authorization").map(String::from),
    };
    let response = respond(&state, &request);
    state.requests.lock().push(request);

    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

fn respond(state: &MockState, request: &RecordedRequest) -> String {
    let route = request.route();
    let failing = state
        .failures
        .lock()
        .iter()
        .any(|(method, prefix)| *method == request.method && request.path.starts_with(prefix.as_str()));
    if failing {
        let body = json!({
            "timestamp": 0,
            "status": 500,
            "error": "Internal Server Error",
            "message": "mock failure",
            "path": route,
        });
        return http_response("500 Internal Server Error", "application/json", &body.to_string());
    }

    let key = (request.method.clone(), route.to_string());
    if let Some(body) = state.responses.lock().get(&key) {
        return http_response("200 OK", "application/json", &body.to_string());
    }

    let body = match (request.method.as_str(), route) {
        ("DELETE", _) => return "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_string(),
        ("GET", "/version") => return http_response("200 OK", "text/plain", "4.0.0"),
        ("GET", "/v4/info") => info_json(),
        ("GET", "/v4/stats") => json!({
            "players": 0, "playingPlayers": 0, "uptime": 1,
            "memory": {"free": 1, "used": 1, "allocated": 1, "reservable": 1},
            "cpu": {"cores": 1, "systemLoad": 0.0, "lavalinkLoad": 0.0}
        }),
        ("GET", "/v4/loadtracks") => json!({"loadType": "empty", "data": {}}),
        ("GET", route) if route.ends_with("/players") => json!([]),
        ("PATCH", route) if !route.contains("/players") => json!({"resuming": true, "timeout": 60}),
        _ => json!({}),
    };
    http_response("200 OK", "application/json", &body.to_string())
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn info_json() -> Value {
    json!({
        "version": {"semver": "4.0.0", "major": 4, "minor": 0, "patch": 0, "preRelease": null, "build": null},
        "buildTime": 0,
        "git": null,
        "jvm": "",
        "lavaplayer": "",
        "sourceManagers": ["youtube", "soundcloud", "http"],
        "filters": ["volume", "timescale", "equalizer"],
        "plugins": []
    })
}

async fn serve_websocket(mut socket: TcpStream, head: String, state: Arc<MockState>) {
    let response = upgrade_response(&head, &[("Session-Resumed", "false")]);
    state.handshakes.lock().push(head);
    if socket.write_all(response.as_bytes()).await.is_err() {
        return;
    }

    let ready = br#"{"op":"ready","resumed":false,"sessionId":"test-session"}"#;
    let mut frame = vec![0x80 | OpCode::Text.as_u8(), ready.len() as u8];
    frame.extend_from_slice(ready);
    if socket.write_all(&frame).await.is_err() {
        return;
    }

    let mut sink = [0u8; 1024];
    while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
}

/// Relay that records payloads instead of sending them.
#[derive(Default)]
pub struct RecordingRelay {
    sent: Mutex<Vec<(GuildId, Value)>>,
    notify: Notify,
}

impl RecordingRelay {
    pub fn sent(&self) -> Vec<(GuildId, Value)> {
        self.sent.lock().clone()
    }

    /// Waits until at least `count` payloads were relayed.
    pub async fn wait_for(&self, count: usize) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.sent.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .expect("relay payload never arrived");
    }
}

#[async_trait]
impl VoiceRelay for RecordingRelay {
    async fn send(&self, guild_id: &GuildId, payload: Value) -> AnyResult<()> {
        self.sent.lock().push((guild_id.clone(), payload));
        self.notify.notify_waiters();
        Ok(())
    }
}

pub struct TestClient {
    pub client: Client,
    pub relay: Arc<RecordingRelay>,
    pub store: Arc<MemoryStore>,
    pub events: flume::Receiver<ClientEvent>,
}

pub async fn ready_client(mock: &MockNode) -> (TestClient, Arc<Node>) {
    ready_client_with(mock, mock.node_config(), PlayerConfig::default()).await
}

/// Client with user id 1234 and a single node that has finished its ready
/// handling.
pub async fn ready_client_with(
    _mock: &MockNode,
    node: NodeConfig,
    player: PlayerConfig,
) -> (TestClient, Arc<Node>) {
    let mut config = Config::default();
    config.client.user_id = 1234;
    config.nodes.push(node);
    config.player = player;

    let relay = Arc::new(RecordingRelay::default());
    let store = Arc::new(MemoryStore::new());
    let client = Client::new(&config, relay.clone(), store.clone()).unwrap();
    let events = client.events();
    let node = client.nodes().nodes().remove(0);
    node.connect().await.unwrap();

    let ready = async {
        loop {
            if let ClientEvent::NodeReady { .. } = events.recv_async().await.unwrap() {
                return;
            }
        }
    };
    tokio::time::timeout(WAIT, ready)
        .await
        .expect("node never became ready");

    (
        TestClient {
            client,
            relay,
            store,
            events,
        },
        node,
    )
}

/// Polls until `node` reports ready.
pub async fn wait_ready(node: &Node) {
    let poll = async {
        while !node.is_ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT, poll)
        .await
        .expect("node never became ready");
}

/// Polls `check` until it holds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let poll = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT, poll)
        .await
        .expect("condition never held");
}

pub fn drain_events(events: &flume::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    events.try_iter().collect()
}

/// Seekable YouTube-style track.
pub fn sample_track(id: &str, length: u64) -> Track {
    Track::new(TrackInfo {
        identifier: id.to_string(),
        is_seekable: true,
        author: "Tester".into(),
        length,
        is_stream: false,
        position: 0,
        title: format!("Track {id}"),
        uri: Some(format!("https://www.youtube.com/watch?v={id}")),
        artwork_url: None,
        isrc: None,
        source_name: "youtube".into(),
    })
    .unwrap()
}

/// Player object as served by GET /v4/sessions/{session}/players.
pub fn remote_player_json(guild: &str, track: Option<&Track>, paused: bool, position: u64) -> Value {
    json!({
        "guildId": guild,
        "track": track,
        "volume": 100,
        "paused": paused,
        "state": {"time": 1, "position": position, "connected": true, "ping": 10},
        "voice": {"token": "t", "endpoint": "e", "sessionId": "s"},
        "filters": {}
    })
}

/// An `event` message of `kind` for `guild`, with `extra` fields merged in.
pub fn event_json(kind: &str, guild: &str, track: &Track, extra: Value) -> String {
    let mut event = json!({"op": "event", "type": kind, "guildId": guild, "track": track});
    if let (Some(event), Value::Object(extra)) = (event.as_object_mut(), extra) {
        event.extend(extra);
    }
    event.to_string()
}
