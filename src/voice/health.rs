//! Passive voice health check driven by the node's `playerUpdate` messages.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::player::Player;

/// Watches the `connected` flag of player updates while a track plays.
///
/// A disconnected report starts a grace timer; a connected report cancels
/// it. If the timer fires, the player escalates its recovery.
pub struct HealthMonitor {
    grace: Duration,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl HealthMonitor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            timer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer.lock().is_some()
    }

    pub fn observe(&self, player: &Arc<Player>, connected: bool, playing: bool) {
        if connected || !playing {
            self.cancel();
            return;
        }

        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }

        debug!(
            "[{}] Node reports voice disconnected, waiting {:?}",
            player.guild_id(),
            self.grace
        );
        let grace = self.grace;
        let slot = Arc::clone(&self.timer);
        let player = Arc::clone(player);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // Detached first: recovery may end in a destroy, which cancels the monitor.
            slot.lock().take();
            player.recover_voice().await;
        }));
    }

    pub fn cancel(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}
