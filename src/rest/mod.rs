//! HTTP client for a node's v4 REST API.
//!
//! Routes:
//! - `GET /v4/info`, `GET /v4/stats`, `GET /version`
//! - `GET /v4/loadtracks`, `GET /v4/decodetrack`, `POST /v4/decodetracks`
//! - `GET|PATCH|DELETE /v4/sessions/{session}/players[/{guild}]`
//! - `PATCH /v4/sessions/{session}`

use std::{sync::Arc, time::Duration};

use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::{
    common::{NodeErrorBody, types::{GuildId, SessionId}},
    protocol::{
        NodeInfo, NodeStats, RemotePlayer,
        models::PlayerUpdate,
        session::{SessionInfo, SessionUpdate},
        tracks::{LoadResult, Track},
    },
};

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("node answered {status}: {message}")]
    Status {
        status: u16,
        message: String,
        body: Option<NodeErrorBody>,
    },
    #[error("no session established with the node")]
    NoSession,
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl RestError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }
}

#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    password: String,
    session_id: Arc<RwLock<Option<SessionId>>>,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RestError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            password: password.into(),
            session_id: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().clone()
    }

    pub fn set_session_id(&self, session_id: Option<SessionId>) {
        *self.session_id.write() = session_id;
    }

    fn session(&self) -> Result<SessionId, RestError> {
        self.session_id().ok_or(RestError::NoSession)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        trace!("{} {}{}", method, self.base_url, path);
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", &self.password)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<String, RestError> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            return Ok(text);
        }

        let body = serde_json::from_str::<NodeErrorBody>(&text).ok();
        let message = match &body {
            Some(body) if !body.message.is_empty() => body.message.clone(),
            _ => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        Err(RestError::Status {
            status: status.as_u16(),
            message,
            body,
        })
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RestError> {
        let text = self.execute(request).await?;
        serde_json::from_str(&text).map_err(|e| RestError::Decode(e.to_string()))
    }

    pub async fn info(&self) -> Result<NodeInfo, RestError> {
        self.json(self.request(Method::GET, "/v4/info")).await
    }

    pub async fn stats(&self) -> Result<NodeStats, RestError> {
        self.json(self.request(Method::GET, "/v4/stats")).await
    }

    pub async fn version(&self) -> Result<String, RestError> {
        self.execute(self.request(Method::GET, "/version"))
            .await
            .map(|v| v.trim().to_string())
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, RestError> {
        let request = self
            .request(Method::GET, "/v4/loadtracks")
            .query(&[("identifier", identifier)]);
        self.json(request).await
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Track, RestError> {
        let request = self
            .request(Method::GET, "/v4/decodetrack")
            .query(&[("encodedTrack", encoded)]);
        self.json(request).await
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>, RestError> {
        let request = self.request(Method::POST, "/v4/decodetracks").json(encoded);
        self.json(request).await
    }

    pub async fn get_players(&self) -> Result<Vec<RemotePlayer>, RestError> {
        let session = self.session()?;
        self.json(self.request(Method::GET, &format!("/v4/sessions/{session}/players")))
            .await
    }

    pub async fn get_player(&self, guild_id: &GuildId) -> Result<RemotePlayer, RestError> {
        let session = self.session()?;
        self.json(self.request(
            Method::GET,
            &format!("/v4/sessions/{session}/players/{guild_id}"),
        ))
        .await
    }

    /// PATCH a player. With `no_replace`, a track already playing is kept.
    pub async fn update_player(
        &self,
        guild_id: &GuildId,
        update: &PlayerUpdate,
        no_replace: bool,
    ) -> Result<(), RestError> {
        let session = self.session()?;
        let request = self
            .request(
                Method::PATCH,
                &format!("/v4/sessions/{session}/players/{guild_id}"),
            )
            .query(&[("noReplace", no_replace)]);
        self.execute(request.json(update)).await.map(drop)
    }

    pub async fn destroy_player(&self, guild_id: &GuildId) -> Result<(), RestError> {
        let session = self.session()?;
        self.execute(self.request(
            Method::DELETE,
            &format!("/v4/sessions/{session}/players/{guild_id}"),
        ))
        .await
        .map(drop)
    }

    pub async fn update_session(&self, update: &SessionUpdate) -> Result<SessionInfo, RestError> {
        let session = self.session()?;
        let request = self.request(Method::PATCH, &format!("/v4/sessions/{session}"));
        self.json(request.json(update)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockNode;

    fn client(node: &MockNode) -> RestClient {
        let rest = RestClient::new(node.http_url(), "youshallnotpass", Duration::from_secs(5)).unwrap();
        rest.set_session_id(Some(SessionId::from("abc")));
        rest
    }

    #[tokio::test]
    async fn test_info_and_version() {
        let node = MockNode::start().await;
        let rest = client(&node);

        let info = rest.info().await.unwrap();
        assert!(info.source_managers.iter().any(|s| s == "youtube"));
        assert_eq!(rest.version().await.unwrap(), "4.0.0");

        let requests = node.requests();
        assert_eq!(requests[0].path, "/v4/info");
        assert_eq!(requests[0].authorization.as_deref(), Some("youshallnotpass"));
    }

    #[tokio::test]
    async fn test_update_player_sends_no_replace_and_body() {
        let node = MockNode::start().await;
        let rest = client(&node);

        let update = PlayerUpdate {
            paused: Some(true),
            ..Default::default()
        };
        rest.update_player(&GuildId::from("42"), &update, true)
            .await
            .unwrap();

        let request = node.last_request().unwrap();
        assert_eq!(request.method, "PATCH");
        assert_eq!(request.path, "/v4/sessions/abc/players/42?noReplace=true");
        assert_eq!(request.body, Some(serde_json::json!({ "paused": true })));
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let node = MockNode::start().await;
        node.fail("DELETE", "/v4/sessions/abc/players/");
        let rest = client(&node);

        let err = rest.destroy_player(&GuildId::from("1")).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        match err {
            RestError::Status { message, body, .. } => {
                assert_eq!(message, "mock failure");
                assert_eq!(body.map(|b| b.path), Some("/v4/sessions/abc/players/1".to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_routes_require_session() {
        let node = MockNode::start().await;
        let rest = RestClient::new(node.http_url(), "pw", Duration::from_secs(5)).unwrap();
        assert!(matches!(rest.get_players().await, Err(RestError::NoSession)));
        assert!(node.requests().is_empty());
    }

    #[tokio::test]
    async fn test_load_tracks_encodes_identifier() {
        let node = MockNode::start().await;
        let rest = client(&node);

        let result = rest.load_tracks("ytsearch:never gonna").await.unwrap();
        assert!(result.into_tracks().is_empty());
        let request = node.last_request().unwrap();
        assert!(request.path.starts_with("/v4/loadtracks?identifier=ytsearch%3Anever"));
    }
}
