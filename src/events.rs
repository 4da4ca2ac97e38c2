//! Events surfaced to the host application.

use std::time::Duration;

use tracing::debug;

use crate::{
    common::types::{ChannelId, GuildId},
    protocol::{TrackEndReason, TrackException, tracks::Track},
};

/// Why a player went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyReason {
    Requested,
    QueueEnded,
    VoiceLeft,
    VoiceClosed(u16),
    VoiceUnhealthy,
    NodeDestroyed,
    NoNodeAvailable,
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::QueueEnded => write!(f, "queue ended"),
            Self::VoiceLeft => write!(f, "left voice channel"),
            Self::VoiceClosed(code) => write!(f, "voice connection closed ({code})"),
            Self::VoiceUnhealthy => write!(f, "voice connection unhealthy"),
            Self::NodeDestroyed => write!(f, "node destroyed"),
            Self::NoNodeAvailable => write!(f, "no node available"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueChange {
    Added(usize),
    Removed(usize),
    Cleared,
    Shuffled,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    NodeCreate {
        node: String,
    },
    NodeReady {
        node: String,
        resumed: bool,
    },
    NodeDisconnect {
        node: String,
        code: u16,
        reason: String,
    },
    NodeReconnecting {
        node: String,
        attempt: u32,
        delay: Duration,
    },
    NodeDestroy {
        node: String,
        reason: String,
    },
    NodeError {
        node: String,
        error: String,
    },
    PlayerCreate {
        guild_id: GuildId,
        node: String,
    },
    PlayerDestroy {
        guild_id: GuildId,
        reason: DestroyReason,
    },
    PlayerSwitchedNode {
        guild_id: GuildId,
        from: String,
        to: String,
    },
    PlayerMove {
        guild_id: GuildId,
        from: Option<ChannelId>,
        to: Option<ChannelId>,
    },
    TrackStart {
        guild_id: GuildId,
        track: Track,
    },
    TrackEnd {
        guild_id: GuildId,
        track: Track,
        reason: TrackEndReason,
    },
    TrackStuck {
        guild_id: GuildId,
        track: Track,
        threshold_ms: u64,
    },
    TrackException {
        guild_id: GuildId,
        track: Track,
        exception: TrackException,
    },
    QueueEnd {
        guild_id: GuildId,
    },
    QueueUpdate {
        guild_id: GuildId,
        change: QueueChange,
    },
    SocketClosed {
        guild_id: GuildId,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    Debug {
        message: String,
    },
}

/// Sending half of the host event stream.
///
/// Sends never block and never fail loudly; a host that dropped its
/// receiver simply stops getting events.
#[derive(Clone)]
pub struct EventSender {
    tx: flume::Sender<ClientEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, flume::Receiver<ClientEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    /// Logs at debug level and mirrors the line onto the host stream.
    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        self.emit(ClientEvent::Debug { message });
    }
}
