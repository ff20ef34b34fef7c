//! # Session Reaper and Trip List Ticker
//!
//! Two independent timers over the registry:
//! - the reaper evicts trips that have been silent longer than the inactivity
//!   timeout (this governs trip activity, not device liveness, so its timeout is
//!   much longer than the device timeout);
//! - the ticker periodically tells viewers which trips are active.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::broadcast_hub::BroadcastHub;
use crate::core::events::BroadcastEvent;
use crate::core::registry::TripRegistry;

/// Periodic sweep of inactive trip sessions.
pub struct SessionReaper {
    registry: Arc<TripRegistry>,
    hub: Arc<BroadcastHub>,
    inactivity_timeout: Duration,
    tick: Duration,
}

impl SessionReaper {
    /// Creates a reaper sweeping every `tick`.
    pub fn new(
        registry: Arc<TripRegistry>,
        hub: Arc<BroadcastHub>,
        inactivity_timeout: Duration,
        tick: Duration,
    ) -> Self {
        Self {
            registry,
            hub,
            inactivity_timeout,
            tick,
        }
    }

    /// # Sweep
    ///
    /// Evicts every session idle for more than the inactivity timeout at `now`
    /// and returns the evicted ids as one batch. When anything was evicted the
    /// remaining trip list is published.
    pub fn sweep(&self, now: Instant) -> Vec<String> {
        let evicted = self.registry.reap_inactive(now, self.inactivity_timeout);
        if evicted.is_empty() {
            debug!("reaper sweep found no stale trips");
            return evicted;
        }

        info!(trips = ?evicted, "cleaning up stale trips");
        let active = self.registry.list_active_trip_ids();
        self.hub.publish_event(BroadcastEvent::trip_list_update(&active));
        evicted
    }

    /// Sweeps every tick until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("session reaper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }
    }
}

/// Publishes `trip-list-update` every `every` until `shutdown` is cancelled.
pub async fn run_trip_list_ticker(
    registry: Arc<TripRegistry>,
    hub: Arc<BroadcastHub>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let active = registry.list_active_trip_ids();
                hub.publish_event(BroadcastEvent::trip_list_update(&active));
            }
        }
    }
}
