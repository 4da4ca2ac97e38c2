//! Track and voice event policies.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
    events::{ClientEvent, DestroyReason},
    node::{Node, autoplay},
    player::{LoopMode, Player},
    protocol::{NodeEvent, TrackEndReason, TrackException, is_fatal_voice_close, tracks::Track},
};

pub(crate) async fn dispatch(node: &Arc<Node>, event: NodeEvent) {
    let Some(guild_id) = event.guild_id().cloned() else {
        debug!("[{}] Ignoring unknown event type", node.id());
        return;
    };
    let Some(player) = node.players().and_then(|p| p.get(&guild_id)) else {
        debug!("[{}] Event for unknown player {}", node.id(), guild_id);
        return;
    };
    if player.node().id() != node.id() {
        debug!(
            "[{}] Event for player {} that moved to {}",
            node.id(),
            guild_id,
            player.node().id()
        );
        return;
    }

    match event {
        NodeEvent::TrackStart { track, .. } => on_track_start(node, &player, track),
        NodeEvent::TrackEnd { track, reason, .. } => {
            on_track_end(node, &player, track, reason).await
        }
        NodeEvent::TrackStuck {
            track,
            threshold_ms,
            ..
        } => on_track_stuck(node, &player, track, threshold_ms).await,
        NodeEvent::TrackException {
            track, exception, ..
        } => on_track_exception(node, &player, track, exception).await,
        NodeEvent::WebSocketClosed {
            code,
            reason,
            by_remote,
            ..
        } => on_socket_closed(node, &player, code, reason, by_remote).await,
        NodeEvent::Unknown => {}
    }
}

fn on_track_start(node: &Node, player: &Player, track: Track) {
    player.mark_started();
    node.events().emit(ClientEvent::TrackStart {
        guild_id: player.guild_id().clone(),
        track,
    });
}

/// Whether `track` is still what the player plays. Events for anything
/// else arrive after the player already moved on.
fn is_current(player: &Player, track: &Track) -> bool {
    let current = player.state().current;
    let matches = current.as_ref().is_some_and(|c| c.encoded() == track.encoded());
    if !matches {
        debug!(
            "[{}] Ignoring event for '{}', no longer current",
            player.guild_id(),
            track.info.title
        );
    }
    matches
}

async fn on_track_end(node: &Node, player: &Arc<Player>, track: Track, reason: TrackEndReason) {
    node.events().emit(ClientEvent::TrackEnd {
        guild_id: player.guild_id().clone(),
        track: track.clone(),
        reason,
    });
    if reason == TrackEndReason::Replaced || !is_current(player, &track) {
        return;
    }

    match reason {
        TrackEndReason::Replaced => return,
        TrackEndReason::LoadFailed if player.take_load_retry() => {
            debug!(
                "[{}] Retrying '{}' after load failure",
                player.guild_id(),
                track.info.title
            );
            if let Err(e) = player.replay(&track).await {
                warn!("[{}] Retry failed: {}", player.guild_id(), e);
            }
            return;
        }
        TrackEndReason::Stopped | TrackEndReason::Cleanup => {
            player.mark_stopped();
            return;
        }
        TrackEndReason::Finished | TrackEndReason::LoadFailed => {}
    }

    if reason != TrackEndReason::LoadFailed {
        match player.loop_mode() {
            LoopMode::Track if player.consume_repeat() => {
                if let Err(e) = player.replay(&track).await {
                    warn!("[{}] Failed to loop track: {}", player.guild_id(), e);
                }
                return;
            }
            LoopMode::Queue => player.queue().push_back(track.clone()),
            _ => {}
        }
    }

    if !player.queue().is_empty() {
        if let Err(e) = player.play(Default::default()).await {
            warn!("[{}] Failed to play next track: {}", player.guild_id(), e);
        }
        return;
    }

    if player.config().autoplay {
        match autoplay::run(node, player, &track).await {
            Ok(true) => return,
            Ok(false) => debug!("[{}] Autoplay found nothing", player.guild_id()),
            Err(e) => warn!("[{}] Autoplay failed: {}", player.guild_id(), e),
        }
    }

    player.finish_queue().await;
}

async fn skip_or_stop(player: &Player) {
    let result = if player.queue().is_empty() {
        player.stop().await
    } else {
        player.play(Default::default()).await
    };
    if let Err(e) = result {
        warn!("[{}] Failed to move past track: {}", player.guild_id(), e);
    }
}

async fn on_track_stuck(node: &Node, player: &Player, track: Track, threshold_ms: u64) {
    node.events().emit(ClientEvent::TrackStuck {
        guild_id: player.guild_id().clone(),
        track: track.clone(),
        threshold_ms,
    });
    if !is_current(player, &track) {
        return;
    }

    let config = player.config();
    if config.skip_stuck_tracks {
        skip_or_stop(player).await;
        return;
    }

    let attempts = player.bump_stuck();
    if attempts < config.max_stuck_attempts {
        let target = player.estimated_position() + config.stuck_seek_ms;
        debug!(
            "[{}] Track stuck ({}/{}), seeking to {}ms",
            player.guild_id(),
            attempts,
            config.max_stuck_attempts,
            target
        );
        if player.seek(target).await.is_ok() {
            return;
        }
    }

    debug!("[{}] Track stuck {} times, moving on", player.guild_id(), attempts);
    player.reset_stuck();
    skip_or_stop(player).await;
}

async fn on_track_exception(node: &Node, player: &Player, track: Track, exception: TrackException) {
    warn!(
        "[{}] Track '{}' failed ({:?}): {}",
        player.guild_id(),
        track.info.title,
        exception.severity,
        exception.message.as_deref().unwrap_or(&exception.cause)
    );
    let severity = exception.severity;
    node.events().emit(ClientEvent::TrackException {
        guild_id: player.guild_id().clone(),
        track: track.clone(),
        exception,
    });
    if !is_current(player, &track) {
        return;
    }

    let config = player.config();
    if config.auto_skip_on_error || severity.is_fatal() {
        skip_or_stop(player).await;
        return;
    }

    if player.bump_exceptions() >= config.exception_threshold {
        player.reset_exceptions();
        skip_or_stop(player).await;
    }
}

async fn on_socket_closed(
    node: &Node,
    player: &Arc<Player>,
    code: u16,
    reason: String,
    by_remote: bool,
) {
    node.events().emit(ClientEvent::SocketClosed {
        guild_id: player.guild_id().clone(),
        code,
        reason: reason.clone(),
        by_remote,
    });

    if player.voice().is_moving() || player.is_resuming() {
        debug!(
            "[{}] Ignoring voice close {} during move/resume",
            player.guild_id(),
            code
        );
        return;
    }

    if is_fatal_voice_close(code) {
        warn!("[{}] Fatal voice close {}: {}", player.guild_id(), code, reason);
        player.destroy(DestroyReason::VoiceClosed(code)).await;
        return;
    }

    let attempt = player.bump_voice_reconnects();
    let config = player.config();
    if attempt > config.voice_reconnect_attempts {
        warn!(
            "[{}] Voice closed {} after {} reconnects, giving up",
            player.guild_id(),
            code,
            config.voice_reconnect_attempts
        );
        player.destroy(DestroyReason::VoiceClosed(code)).await;
        return;
    }

    player.schedule_voice_reconnect(Duration::from_millis(config.voice_reconnect_delay_ms));
}
