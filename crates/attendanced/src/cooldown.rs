//! Per-identity rate limiting after a clock action.

use kiosk_core::IdentityRef;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const COOLDOWN_WINDOW: Duration = Duration::from_secs(30);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Identities that recently clocked in or out. Cloning shares the map.
#[derive(Clone, Default)]
pub struct CooldownRegistry {
    entries: Arc<Mutex<HashMap<IdentityRef, Instant>>>,
}

impl CooldownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IdentityRef, Instant>> {
        // A poisoned map only ever holds timestamps; keep using it.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True while `identity` is inside the window, swept or not.
    pub fn has(&self, identity: &IdentityRef) -> bool {
        self.lock()
            .get(identity)
            .is_some_and(|at| at.elapsed() < COOLDOWN_WINDOW)
    }

    pub fn mark(&self, identity: IdentityRef) {
        tracing::debug!(%identity, "cooldown started");
        self.lock().insert(identity, Instant::now());
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, at| at.elapsed() < COOLDOWN_WINDOW);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Sweep every [`SWEEP_INTERVAL`] until `token` is cancelled.
    pub fn spawn_sweeper(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = registry.len(), "expired cooldowns swept");
                        }
                    }
                }
            }
        })
    }
}
