//! HTTP/1.1 upgrade handshake (RFC 6455 section 4).

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::BytesMut;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;
use url::Url;

use super::TransportError;

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const MAX_REDIRECTS: usize = 3;
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Random 16-byte nonce, base64 encoded.
pub fn generate_key() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill(&mut raw);
    STANDARD.encode(raw)
}

/// Expected `Sec-WebSocket-Accept` for a given key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Where a handshake is sent.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: Url,
    pub host: String,
    pub port: u16,
    /// Path plus query, as written on the request line.
    pub resource: String,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let url = Url::parse(raw).map_err(|e| TransportError::InvalidUrl(format!("{raw}: {e}")))?;
        Self::from_url(url)
    }

    fn from_url(url: Url) -> Result<Self, TransportError> {
        if url.scheme() != "ws" {
            return Err(TransportError::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{url}: missing host")))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let mut resource = url.path().to_string();
        if resource.is_empty() {
            resource.push('/');
        }
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }
        Ok(Self {
            url,
            host,
            port,
            resource,
        })
    }

    /// Resolves a `Location` header, absolute or relative to this target.
    pub fn redirect(&self, location: &str) -> Result<Self, TransportError> {
        let next = self
            .url
            .join(location)
            .map_err(|e| TransportError::InvalidUrl(format!("{location}: {e}")))?;
        Self::from_url(next)
    }

    fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub fn build_request(target: &Target, key: &str, headers: &[(String, String)]) -> String {
    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        target.resource,
        target.host_header(),
        key
    );
    for (name, value) in headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// Parsed response head. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

pub fn parse_response(head: &[u8]) -> Result<Response, TransportError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| TransportError::MalformedResponse("non UTF-8 response head".into()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| TransportError::MalformedResponse("empty response".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(TransportError::MalformedResponse(format!(
            "bad status line: {status_line}"
        )));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| TransportError::MalformedResponse(format!("bad status line: {status_line}")))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(TransportError::MalformedResponse(format!("bad header: {line}")));
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok(Response {
        status,
        reason,
        headers,
    })
}

fn verify_upgrade(response: &Response, key: &str) -> Result<(), TransportError> {
    let upgrade_ok = response
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection_ok = response
        .header("connection")
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    if !upgrade_ok || !connection_ok {
        return Err(TransportError::MissingUpgrade);
    }
    match response.header("sec-websocket-accept") {
        Some(accept) if accept == accept_key(key) => Ok(()),
        _ => Err(TransportError::InvalidAccept),
    }
}

/// Reads until the end of the response head. Returns its length; any bytes
/// past it stay in `buf`.
async fn read_head(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<usize, TransportError> {
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok(pos + 4);
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(TransportError::MalformedResponse(
                "response head too large".into(),
            ));
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(TransportError::MalformedResponse(
                "connection closed during handshake".into(),
            ));
        }
    }
}

/// An upgraded connection.
pub struct Established {
    pub stream: TcpStream,
    pub response: Response,
    /// Frame bytes that arrived together with the response head.
    pub leftover: BytesMut,
    pub url: Url,
}

/// Performs the upgrade, following up to [`MAX_REDIRECTS`] redirects.
pub async fn connect(url: &str, headers: &[(String, String)]) -> Result<Established, TransportError> {
    let mut target = Target::parse(url)?;
    let mut redirects = 0;

    loop {
        let mut stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        stream.set_nodelay(true)?;

        let key = generate_key();
        stream
            .write_all(build_request(&target, &key, headers).as_bytes())
            .await?;

        let mut buf = BytesMut::with_capacity(1024);
        let head_len = read_head(&mut stream, &mut buf).await?;
        let head = buf.split_to(head_len);
        let response = parse_response(&head)?;

        match response.status {
            101 => {
                verify_upgrade(&response, &key)?;
                return Ok(Established {
                    stream,
                    response,
                    leftover: buf,
                    url: target.url,
                });
            }
            301 | 302 | 303 | 307 | 308 => {
                let location = response
                    .header("location")
                    .ok_or(TransportError::HandshakeStatus(response.status))?;
                if redirects >= MAX_REDIRECTS {
                    return Err(TransportError::TooManyRedirects);
                }
                redirects += 1;
                let next = target.redirect(location)?;
                debug!(
                    "Handshake redirected ({}) from {} to {}",
                    response.status, target.url, next.url
                );
                target = next;
            }
            status => return Err(TransportError::HandshakeStatus(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{read_http_head, upgrade_response};
    use tokio::net::TcpListener;

    #[test]
    fn test_accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generated_key_is_16_random_bytes() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_target_parsing() {
        let target = Target::parse("ws://localhost:2333/v4/websocket").unwrap();
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, 2333);
        assert_eq!(target.resource, "/v4/websocket");

        let target = Target::parse("ws://example.com?x=1").unwrap();
        assert_eq!(target.port, 80);
        assert_eq!(target.resource, "/?x=1");

        assert!(matches!(
            Target::parse("wss://example.com/"),
            Err(TransportError::UnsupportedScheme(s)) if s == "wss"
        ));
        assert!(matches!(
            Target::parse("not a url"),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_redirect_resolution() {
        let target = Target::parse("ws://a.local:2333/v4/websocket").unwrap();
        let relative = target.redirect("/v5/websocket").unwrap();
        assert_eq!(relative.host, "a.local");
        assert_eq!(relative.resource, "/v5/websocket");

        let absolute = target.redirect("ws://b.local:9000/ws").unwrap();
        assert_eq!(absolute.host, "b.local");
        assert_eq!(absolute.port, 9000);
    }

    #[test]
    fn test_request_carries_caller_headers() {
        let target = Target::parse("ws://localhost:2333/v4/websocket").unwrap();
        let headers = vec![("Authorization".to_string(), "secret".to_string())];
        let request = build_request(&target, "abc", &headers);
        assert!(request.starts_with("GET /v4/websocket HTTP/1.1\r\n"));
        assert!(request.contains("Host: localhost:2333\r\n"));
        assert!(request.contains("Sec-WebSocket-Key: abc\r\n"));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(request.contains("Authorization: secret\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_response_parsing_lowercases_headers() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSession-Resumed: true\r\n\r\n";
        let response = parse_response(head).unwrap();
        assert_eq!(response.status, 101);
        assert_eq!(response.header("Session-Resumed"), Some("true"));
        assert!(response.headers.contains_key("session-resumed"));

        assert!(parse_response(b"SSH-2.0\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_connect_follows_relative_redirect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            let head = read_http_head(&mut first).await;
            assert!(head.starts_with("GET /old "));
            first
                .write_all(b"HTTP/1.1 307 Temporary Redirect\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();

            let (mut second, _) = listener.accept().await.unwrap();
            let head = read_http_head(&mut second).await;
            assert!(head.starts_with("GET /new "));
            second
                .write_all(upgrade_response(&head, &[("Session-Resumed", "false")]).as_bytes())
                .await
                .unwrap();
            second
        });

        let established = connect(&format!("ws://{addr}/old"), &[]).await.unwrap();
        assert_eq!(established.url.path(), "/new");
        assert_eq!(established.response.header("session-resumed"), Some("false"));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_max_redirects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for _ in 0..=MAX_REDIRECTS {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_http_head(&mut socket).await;
                socket
                    .write_all(b"HTTP/1.1 302 Found\r\nLocation: /loop\r\n\r\n")
                    .await
                    .unwrap();
            }
        });

        let result = connect(&format!("ws://{addr}/loop"), &[]).await;
        assert!(matches!(result, Err(TransportError::TooManyRedirects)));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_accept_and_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_http_head(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: bogus\r\n\r\n")
                .await
                .unwrap();

            let (mut socket, _) = listener.accept().await.unwrap();
            read_http_head(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let url = format!("ws://{addr}/v4/websocket");
        assert!(matches!(
            connect(&url, &[]).await,
            Err(TransportError::InvalidAccept)
        ));
        assert!(matches!(
            connect(&url, &[]).await,
            Err(TransportError::HandshakeStatus(401))
        ));
    }
}
