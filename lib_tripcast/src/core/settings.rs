//! Engine tunables, resolved from configuration before anything starts.

use std::time::Duration;

/// Every timer, window and limit the engine runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Samples kept per trip window.
    pub window_capacity: usize,
    /// Silence after which the device counts as disconnected.
    pub device_timeout: Duration,
    /// Silence after which a trip session is evicted.
    pub trip_inactivity_timeout: Duration,
    /// Connectivity monitor tick.
    pub monitor_interval: Duration,
    /// Session reaper tick.
    pub reaper_interval: Duration,
    /// Trip list broadcast period.
    pub trip_list_interval: Duration,
    /// Minimum spacing of road lookups per trip.
    pub enrichment_interval: Duration,
    /// Delay between broker resubscription attempts.
    pub reconnect_delay: Duration,
    /// Events buffered per viewer before it is disconnected.
    pub subscriber_buffer: usize,
    /// km/h tolerated above a speed limit before alerting.
    pub speeding_tolerance_kmh: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            window_capacity: 40,
            device_timeout: Duration::from_secs(5),
            trip_inactivity_timeout: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(2),
            reaper_interval: Duration::from_secs(30),
            trip_list_interval: Duration::from_secs(3),
            enrichment_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            subscriber_buffer: 256,
            speeding_tolerance_kmh: 5.0,
        }
    }
}
