//! # Connectivity Monitor
//!
//! Derives a process-wide device status from the time of the last accepted
//! sample and announces transitions only.
//!
//! The monitor starts in `Unknown`, which is never broadcast. Each tick
//! classifies `now - last_message_at` against the device timeout; a
//! `status-update` goes out only when the result differs from the last value the
//! monitor emitted.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::broadcast_hub::BroadcastHub;
use crate::core::events::BroadcastEvent;
use crate::core::registry::TripRegistry;

/// Device connectivity as last announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Before the first evaluation.
    Unknown,
    /// A sample arrived within the device timeout.
    Connected,
    /// No sample within the device timeout.
    Disconnected,
}

impl ConnectivityState {
    /// Viewer-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectivityState::Unknown => "Unknown",
            ConnectivityState::Connected => "Device Connected",
            ConnectivityState::Disconnected => "Device Disconnected",
        }
    }

    /// Classifies elapsed silence. Never seeing a sample counts as disconnected.
    pub fn classify(last_message_at: Option<Instant>, now: Instant, device_timeout: Duration) -> Self {
        match last_message_at {
            Some(at) if now.saturating_duration_since(at) <= device_timeout => ConnectivityState::Connected,
            _ => ConnectivityState::Disconnected,
        }
    }
}

/// # Connectivity Monitor
pub struct ConnectivityMonitor {
    registry: Arc<TripRegistry>,
    hub: Arc<BroadcastHub>,
    device_timeout: Duration,
    tick: Duration,
    state: Mutex<ConnectivityState>,
}

impl ConnectivityMonitor {
    /// Creates a monitor in the `Unknown` state.
    pub fn new(registry: Arc<TripRegistry>, hub: Arc<BroadcastHub>, device_timeout: Duration, tick: Duration) -> Self {
        Self {
            registry,
            hub,
            device_timeout,
            tick,
            state: Mutex::new(ConnectivityState::Unknown),
        }
    }

    /// Last emitted state.
    pub fn current(&self) -> ConnectivityState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Status a viewer joining at `now` should be shown, computed fresh.
    pub fn status_at(&self, now: Instant) -> ConnectivityState {
        ConnectivityState::classify(self.registry.last_message_at(), now, self.device_timeout)
    }

    /// # Evaluate
    ///
    /// One monitor tick. Returns the new state and publishes a `status-update`
    /// when it differs from the previously emitted one.
    pub fn evaluate(&self, now: Instant) -> Option<ConnectivityState> {
        let derived = self.status_at(now);
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == derived {
                return None;
            }
            info!(from = state.label(), to = derived.label(), "device status change");
            *state = derived;
        }
        self.hub.publish_event(BroadcastEvent::status_update(derived.label()));
        Some(derived)
    }

    /// Ticks until `shutdown` is cancelled. The first evaluation happens one tick
    /// after start.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("connectivity monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.evaluate(Instant::now());
                }
            }
        }
    }
}
