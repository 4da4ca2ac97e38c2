//! WebSocket client transport over a raw TCP socket.
//!
//! [`WebSocket::open`] spawns one task per connection. The task performs the
//! handshake, then multiplexes socket reads, outgoing commands and the
//! heartbeat. Everything it observes is reported on an event channel, which
//! always ends with exactly one [`TransportEvent::Close`]. The transport never
//! reconnects on its own.

pub mod frame;
pub mod handshake;

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::OwnedWriteHalf,
    time::Instant,
};
use tracing::{debug, trace, warn};

use crate::common::types::now_ms;

use self::frame::{
    DEFAULT_MAX_PAYLOAD, FrameDecoder, Message, MessageAssembler, OpCode, close_payload,
    encode_frame, parse_close,
};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Reported locally for abnormal closure. Never sent on the wire.
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
pub const CLOSE_TOO_BIG: u16 = 1009;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("reserved bits set")]
    ReservedBits,
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload exceeds 125 bytes")]
    ControlTooLarge,
    #[error("continuation frame without a started message")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is in progress")]
    InterleavedDataFrame,
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,
    #[error("payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(u64),
    #[error("invalid close frame payload")]
    InvalidClosePayload,
}

impl ProtocolError {
    /// Close code to send when failing the connection for this violation.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::InvalidUtf8 => CLOSE_INVALID_PAYLOAD,
            Self::PayloadTooLarge(_) => CLOSE_TOO_BIG,
            _ => CLOSE_PROTOCOL_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unsupported scheme '{0}', only ws:// is supported")]
    UnsupportedScheme(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake rejected with HTTP status {0}")]
    HandshakeStatus(u16),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("malformed handshake response: {0}")]
    MalformedResponse(String),
    #[error("server did not agree to the upgrade")]
    MissingUpgrade,
    #[error("Sec-WebSocket-Accept mismatch")]
    InvalidAccept,
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no pong received within the heartbeat timeout")]
    HeartbeatTimeout,
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_payload: usize,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    /// Handshake completed. Header names are lowercased.
    Open { headers: HashMap<String, String> },
    Text(String),
    Binary(Bytes),
    /// Round trip of a heartbeat ping.
    Latency(Duration),
    Error(TransportError),
    Close { code: u16, reason: String },
}

enum Command {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// Cheap handle used to drive a running connection.
///
/// Dropping every handle closes the connection with 1000.
#[derive(Clone)]
pub struct TransportHandle {
    commands: flume::Sender<Command>,
}

impl TransportHandle {
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.commands
            .send(Command::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Sends an extra heartbeat ping right away.
    pub fn ping(&self) -> Result<(), TransportError> {
        self.commands
            .send(Command::Ping)
            .map_err(|_| TransportError::Closed)
    }

    /// Starts the closing handshake. A no-op once the connection is gone.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.commands.send(Command::Close {
            code,
            reason: reason.into(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_disconnected()
    }
}

pub struct WebSocket;

impl WebSocket {
    /// Spawns the connection task. Must be called within a Tokio runtime.
    pub fn open(config: WsConfig) -> (TransportHandle, flume::Receiver<TransportEvent>) {
        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        tokio::spawn(run(config, command_rx, event_tx));
        (
            TransportHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }
}

async fn run(
    config: WsConfig,
    commands: flume::Receiver<Command>,
    events: flume::Sender<TransportEvent>,
) {
    let established = match tokio::time::timeout(
        config.connect_timeout,
        handshake::connect(&config.url, &config.headers),
    )
    .await
    {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            debug!("Handshake with {} failed: {}", config.url, e);
            let _ = events.send(TransportEvent::Error(e));
            let _ = events.send(TransportEvent::Close {
                code: CLOSE_ABNORMAL,
                reason: "handshake failed".into(),
            });
            return;
        }
        Err(_) => {
            let _ = events.send(TransportEvent::Error(TransportError::HandshakeTimeout));
            let _ = events.send(TransportEvent::Close {
                code: CLOSE_ABNORMAL,
                reason: "handshake timed out".into(),
            });
            return;
        }
    };

    let _ = events.send(TransportEvent::Open {
        headers: established.response.headers.clone(),
    });

    let (mut reader, writer) = established.stream.into_split();
    let mut conn = Connection {
        writer,
        decoder: FrameDecoder::new(config.max_payload),
        assembler: MessageAssembler::new(config.max_payload),
        events: events.clone(),
        outstanding_ping: None,
        pong_deadline: None,
        heartbeat_timeout: config.heartbeat_timeout,
    };
    conn.decoder.extend(&established.leftover);

    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let (code, reason) = loop {
        match conn.drain_frames().await {
            Ok(Some(closed)) => break closed,
            Ok(None) => {}
            Err(e) => break conn.fail(e).await,
        }

        let deadline = conn.pong_deadline;
        tokio::select! {
            read = reader.read_buf(conn.decoder.buffer_mut()) => match read {
                Ok(0) => {
                    let _ = events.send(TransportEvent::Error(TransportError::Io(
                        std::io::ErrorKind::UnexpectedEof.into(),
                    )));
                    break (CLOSE_ABNORMAL, "connection reset by peer".into());
                }
                Ok(n) => trace!("Read {} bytes from {}", n, config.url),
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(TransportError::Io(e)));
                    break (CLOSE_ABNORMAL, "read failed".into());
                }
            },
            command = commands.recv_async() => {
                let result = match command {
                    Ok(Command::Text(text)) => conn.write(OpCode::Text, text.as_bytes()).await,
                    Ok(Command::Ping) => conn.send_ping().await,
                    Ok(Command::Close { code, reason }) => {
                        conn.send_close(code, &reason).await;
                        break (code, reason);
                    }
                    Err(_) => {
                        conn.send_close(CLOSE_NORMAL, "").await;
                        break (CLOSE_NORMAL, String::new());
                    }
                };
                if let Err(e) = result {
                    let _ = events.send(TransportEvent::Error(e));
                    break (CLOSE_ABNORMAL, "write failed".into());
                }
            }
            _ = heartbeat.tick() => {
                if conn.pong_deadline.is_none() {
                    if let Err(e) = conn.send_ping().await {
                        let _ = events.send(TransportEvent::Error(e));
                        break (CLOSE_ABNORMAL, "write failed".into());
                    }
                }
            }
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                warn!("No pong from {} within {:?}", config.url, config.heartbeat_timeout);
                let _ = events.send(TransportEvent::Error(TransportError::HeartbeatTimeout));
                break (CLOSE_ABNORMAL, "heartbeat timeout".into());
            }
        }
    };

    let _ = conn.writer.shutdown().await;
    let _ = events.send(TransportEvent::Close { code, reason });
}

struct Connection {
    writer: OwnedWriteHalf,
    decoder: FrameDecoder,
    assembler: MessageAssembler,
    events: flume::Sender<TransportEvent>,
    outstanding_ping: Option<u64>,
    pong_deadline: Option<Instant>,
    heartbeat_timeout: Duration,
}

impl Connection {
    async fn write(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), TransportError> {
        self.writer
            .write_all(&encode_frame(opcode, payload, true))
            .await?;
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        let sent = now_ms();
        self.write(OpCode::Ping, &sent.to_be_bytes()).await?;
        self.outstanding_ping = Some(sent);
        self.pong_deadline = Some(Instant::now() + self.heartbeat_timeout);
        Ok(())
    }

    async fn send_close(&mut self, code: u16, reason: &str) {
        let payload = match code {
            CLOSE_NO_STATUS | CLOSE_ABNORMAL => Vec::new(),
            _ => close_payload(code, reason),
        };
        let _ = self.write(OpCode::Close, &payload).await;
    }

    /// Closes for a protocol violation and returns the code reported locally.
    async fn fail(&mut self, error: ProtocolError) -> (u16, String) {
        let code = error.close_code();
        let reason = error.to_string();
        warn!("Failing connection: {}", reason);
        self.send_close(code, &reason).await;
        let _ = self.events.send(TransportEvent::Error(error.into()));
        (code, reason)
    }

    /// Handles every complete frame in the buffer. Returns the close code and
    /// reason once the peer closed.
    async fn drain_frames(&mut self) -> Result<Option<(u16, String)>, ProtocolError> {
        while let Some(frame) = self.decoder.next_frame()? {
            match frame.opcode {
                OpCode::Ping => {
                    if let Err(e) = self.write(OpCode::Pong, &frame.payload).await {
                        let _ = self.events.send(TransportEvent::Error(e));
                        return Ok(Some((CLOSE_ABNORMAL, "write failed".into())));
                    }
                }
                OpCode::Pong => {
                    self.pong_deadline = None;
                    if frame.payload.len() == 8 {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&frame.payload);
                        let sent = u64::from_be_bytes(raw);
                        if self.outstanding_ping == Some(sent) {
                            self.outstanding_ping = None;
                            let latency = Duration::from_millis(now_ms().saturating_sub(sent));
                            let _ = self.events.send(TransportEvent::Latency(latency));
                        }
                    }
                }
                OpCode::Close => {
                    let (code, reason) = parse_close(&frame.payload)?;
                    self.send_close(code, "").await;
                    return Ok(Some((code, reason)));
                }
                _ => match self.assembler.push(frame)? {
                    Some(Message::Text(text)) => {
                        let _ = self.events.send(TransportEvent::Text(text));
                    }
                    Some(Message::Binary(data)) => {
                        let _ = self.events.send(TransportEvent::Binary(data));
                    }
                    None => {}
                },
            }
        }
        Ok(None)
    }
}
