//! Coalesced fan-out of configuration changes to connected data planes.
//!
//! One push loop per process. Change notifications land on a coalescing
//! signal (`Notify` stores at most one pending permit), so any burst of
//! triggers during an in-flight push collapses to exactly one follow-up
//! push. After a push the loop sits out a quiet period before it looks at
//! the signal again.

use super::control_plane::PeerRegistry;
use super::snapshot::{ConfigSource, SnapshotCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Cheap, cloneable trigger half. Store-change observers call
/// [`BroadcastHandle::notify_change`]; the push loop does the rest.
#[derive(Clone)]
pub struct BroadcastHandle {
    trigger: Arc<Notify>,
}

impl BroadcastHandle {
    pub fn notify_change(&self) {
        self.trigger.notify_one();
    }
}

pub struct Broadcaster {
    trigger: Arc<Notify>,
    registry: PeerRegistry,
    snapshot: Arc<SnapshotCache>,
    source: Arc<dyn ConfigSource>,
    update_frequency: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Broadcaster {
    pub fn new(
        registry: PeerRegistry,
        snapshot: Arc<SnapshotCache>,
        source: Arc<dyn ConfigSource>,
        update_frequency: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            trigger: Arc::new(Notify::new()),
            registry,
            snapshot,
            source,
            update_frequency,
            shutdown,
        }
    }

    pub fn handle(&self) -> BroadcastHandle {
        BroadcastHandle { trigger: self.trigger.clone() }
    }

    /// Push loop. At most one push is ever in flight; a failed rebuild
    /// skips the tick and the next trigger retries.
    pub async fn run(mut self) {
        loop {
            if !self.wait_for_trigger().await {
                return;
            }
            match self.snapshot.rebuild(self.source.as_ref()).await {
                Ok(prepared) => {
                    let sent = self.registry.broadcast(prepared.payload);
                    info!("broadcast config to {sent} data planes");
                }
                Err(e) => error!("snapshot rebuild failed, skipping broadcast: {e}"),
            }
            if !self.quiet_period().await {
                return;
            }
        }
    }

    /// Wait on the trigger with a 1-second poll, watching for shutdown each
    /// tick. Returns false on shutdown.
    async fn wait_for_trigger(&mut self) -> bool {
        loop {
            tokio::select! {
                _ = self.trigger.notified() => {
                    debug!("config change signal received");
                    return true;
                }
                _ = sleep(Duration::from_secs(1)) => {
                    if *self.shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Post-push quiet period, interruptible only by shutdown. Triggers
    /// arriving during the sleep are held by the coalescing signal.
    async fn quiet_period(&mut self) -> bool {
        let mut remaining = self.update_frequency.as_secs();
        while remaining > 0 {
            sleep(Duration::from_secs(1)).await;
            if *self.shutdown.borrow() {
                return false;
            }
            remaining -= 1;
        }
        true
    }
}
