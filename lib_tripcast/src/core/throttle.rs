//! # Enrichment Throttle
//!
//! Paces road-attribute lookups per trip and keeps them off the ingestion path.
//!
//! `maybe_enrich` never waits on the network. When a lookup is due it claims the
//! trip's in-flight slot inside the registry lock, spawns the lookup as its own
//! task and immediately returns the value cached before the claim. The spawned
//! task writes its result back when it completes; if the session was reaped in
//! the meantime the result is discarded. A lookup still running after one
//! interval counts as failed, and so does one that panics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::collaborators::resolver::RoadResolver;
use crate::core::registry::{EnrichmentDecision, EnrichmentResult, TripRegistry};
use crate::core::sample::Position;

/// Per-trip rate limiter in front of a [`RoadResolver`].
pub struct EnrichmentThrottle {
    registry: Arc<TripRegistry>,
    resolver: Arc<dyn RoadResolver>,
    interval: Duration,
    lookups_started: AtomicU64,
}

impl EnrichmentThrottle {
    /// Allows at most one lookup per trip every `interval`.
    pub fn new(registry: Arc<TripRegistry>, resolver: Arc<dyn RoadResolver>, interval: Duration) -> Self {
        Self {
            registry,
            resolver,
            interval,
            lookups_started: AtomicU64::new(0),
        }
    }

    /// # Maybe Enrich
    ///
    /// Returns the trip's cached enrichment, starting a background lookup first
    /// when one is due and `position` is known. Must be called from within a
    /// Tokio runtime.
    pub fn maybe_enrich(&self, trip_id: &str, position: Option<Position>, now: Instant) -> EnrichmentResult {
        let Some(position) = position else {
            return self
                .registry
                .get(trip_id)
                .map(|view| EnrichmentResult {
                    snapped: None,
                    ..view.enrichment
                })
                .unwrap_or_default();
        };

        match self.registry.begin_enrichment(trip_id, now, self.interval) {
            None => EnrichmentResult::default(),
            Some(EnrichmentDecision::Cached(cached)) => cached,
            Some(EnrichmentDecision::Started { generation, previous }) => {
                self.lookups_started.fetch_add(1, Ordering::Relaxed);
                self.spawn_lookup(trip_id.to_string(), generation, position);
                previous
            }
        }
    }

    fn spawn_lookup(&self, trip_id: String, generation: u64, position: Position) {
        let pending = PendingLookup {
            registry: Arc::clone(&self.registry),
            trip_id,
            generation,
            settled: false,
        };
        let resolver = Arc::clone(&self.resolver);
        let deadline = self.interval;

        tokio::spawn(async move {
            let resolved = match tokio::time::timeout(deadline, resolver.lookup(position)).await {
                Ok(Ok(attribute)) => Some((attribute.speed_limit, attribute.snapped)),
                Ok(Err(e)) => {
                    warn!(trip_id = %pending.trip_id, error = %e, "road lookup failed");
                    None
                }
                Err(_) => {
                    warn!(trip_id = %pending.trip_id, timeout = ?deadline, "road lookup timed out");
                    None
                }
            };
            pending.finish(resolved);
        });
    }

    /// Total lookups started since creation.
    pub fn lookups_started(&self) -> u64 {
        self.lookups_started.load(Ordering::Relaxed)
    }
}

/// Claim on a trip's in-flight slot, held by the lookup task.
///
/// Dropping it without [`PendingLookup::finish`] (the resolver panicked or the
/// task was aborted) releases the slot with an "unknown" result, so the trip
/// gets a fresh lookup after the next interval.
struct PendingLookup {
    registry: Arc<TripRegistry>,
    trip_id: String,
    generation: u64,
    settled: bool,
}

impl PendingLookup {
    fn finish(mut self, resolved: Option<(Option<u32>, Position)>) {
        self.settled = true;
        if !self
            .registry
            .finish_enrichment(&self.trip_id, self.generation, resolved, Instant::now())
        {
            debug!(trip_id = %self.trip_id, "road lookup finished after session was reaped, dropped");
        }
    }
}

impl Drop for PendingLookup {
    fn drop(&mut self) {
        if !self.settled {
            warn!(trip_id = %self.trip_id, "road lookup abandoned");
            self.registry
                .finish_enrichment(&self.trip_id, self.generation, None, Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::resolver::RoadAttribute;
    use crate::core::sample::TelemetrySample;
    use crate::errors::ResolveError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    const POS: Position = Position {
        latitude: 3.0,
        longitude: 101.0,
    };

    /// Answers with a fixed limit after an optional gate is opened.
    struct FakeResolver {
        calls: AtomicUsize,
        limit: Option<u32>,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    impl FakeResolver {
        fn answering(limit: u32) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                limit: Some(limit),
                fail: false,
                gate: None,
            }
        }
    }

    #[async_trait]
    impl RoadResolver for FakeResolver {
        async fn lookup(&self, position: Position) -> Result<RoadAttribute, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(ResolveError::Status(503));
            }
            Ok(RoadAttribute {
                speed_limit: self.limit,
                snapped: position,
            })
        }
    }

    fn seeded_registry(trip: &str, now: Instant) -> Arc<TripRegistry> {
        let registry = Arc::new(TripRegistry::new(4));
        let sample = TelemetrySample::from_value(&json!({ "tripId": trip })).unwrap();
        registry.record_sample(&sample, now);
        registry
    }

    async fn settle(registry: &TripRegistry, trip: &str) {
        for _ in 0..200 {
            if registry.get(trip).map_or(true, |v| v.enrichment.refreshed_at.is_some()) {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn one_lookup_per_interval_regardless_of_sample_rate() {
        let t0 = Instant::now();
        let registry = seeded_registry("t1", t0);
        let resolver = Arc::new(FakeResolver::answering(60));
        let throttle = EnrichmentThrottle::new(registry.clone(), resolver.clone(), Duration::from_secs(10));

        let first = throttle.maybe_enrich("t1", Some(POS), t0);
        assert_eq!(first.speed_limit, None, "previous (empty) value is returned immediately");
        settle(&registry, "t1").await;

        for ms in (100..10_000).step_by(100) {
            let r = throttle.maybe_enrich("t1", Some(POS), t0 + Duration::from_millis(ms));
            assert_eq!(r.speed_limit, Some(60));
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        throttle.maybe_enrich("t1", Some(POS), t0 + Duration::from_secs(10));
        assert_eq!(throttle.lookups_started(), 2);
    }

    #[tokio::test]
    async fn outstanding_lookup_suppresses_new_triggers() {
        let t0 = Instant::now();
        let registry = seeded_registry("t1", t0);
        let gate = Arc::new(Notify::new());
        let resolver = Arc::new(FakeResolver {
            gate: Some(gate.clone()),
            ..FakeResolver::answering(80)
        });
        let throttle = EnrichmentThrottle::new(registry.clone(), resolver.clone(), Duration::from_secs(10));

        throttle.maybe_enrich("t1", Some(POS), t0);
        // Far beyond the interval, but the first lookup is still outstanding.
        throttle.maybe_enrich("t1", Some(POS), t0 + Duration::from_secs(60));
        assert_eq!(throttle.lookups_started(), 1);

        gate.notify_one();
        settle(&registry, "t1").await;
        assert_eq!(registry.get("t1").unwrap().enrichment.speed_limit, Some(80));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_leaves_unknown_and_waits_for_next_interval() {
        let t0 = Instant::now();
        let registry = seeded_registry("t1", t0);
        let resolver = Arc::new(FakeResolver {
            fail: true,
            ..FakeResolver::answering(50)
        });
        let throttle = EnrichmentThrottle::new(registry.clone(), resolver.clone(), Duration::from_secs(10));

        throttle.maybe_enrich("t1", Some(POS), t0);
        settle(&registry, "t1").await;

        let cached = throttle.maybe_enrich("t1", Some(POS), t0 + Duration::from_secs(5));
        assert_eq!(cached.speed_limit, None);
        assert!(cached.refreshed_at.is_some());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        throttle.maybe_enrich("t1", Some(POS), t0 + Duration::from_secs(11));
        assert_eq!(throttle.lookups_started(), 2);
    }

    #[tokio::test]
    async fn no_position_means_no_lookup() {
        let t0 = Instant::now();
        let registry = seeded_registry("t1", t0);
        let resolver = Arc::new(FakeResolver::answering(50));
        let throttle = EnrichmentThrottle::new(registry, resolver.clone(), Duration::from_secs(10));

        let r = throttle.maybe_enrich("t1", None, t0);
        assert_eq!(r, EnrichmentResult::default());
        assert_eq!(throttle.lookups_started(), 0);
    }

    #[tokio::test]
    async fn result_for_reaped_trip_is_ignored() {
        let t0 = Instant::now();
        let registry = seeded_registry("t1", t0);
        let gate = Arc::new(Notify::new());
        let resolver = Arc::new(FakeResolver {
            gate: Some(gate.clone()),
            ..FakeResolver::answering(110)
        });
        let throttle = EnrichmentThrottle::new(registry.clone(), resolver, Duration::from_secs(10));

        throttle.maybe_enrich("t1", Some(POS), t0);
        registry.reap_inactive(t0 + Duration::from_secs(120), Duration::from_secs(60));

        gate.notify_one();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(registry.get("t1").is_none());
    }

    struct HangingResolver;

    #[async_trait]
    impl RoadResolver for HangingResolver {
        async fn lookup(&self, _position: Position) -> Result<RoadAttribute, ResolveError> {
            std::future::pending().await
        }
    }

    struct PanickingResolver;

    #[async_trait]
    impl RoadResolver for PanickingResolver {
        async fn lookup(&self, _position: Position) -> Result<RoadAttribute, ResolveError> {
            panic!("resolver bug")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_lookup_times_out_and_frees_the_slot() {
        let t0 = Instant::now();
        let registry = seeded_registry("t1", t0);
        let throttle = EnrichmentThrottle::new(registry.clone(), Arc::new(HangingResolver), Duration::from_secs(10));

        throttle.maybe_enrich("t1", Some(POS), t0);
        tokio::time::sleep(Duration::from_secs(11)).await;
        settle(&registry, "t1").await;
        assert_eq!(registry.get("t1").unwrap().enrichment.speed_limit, None);

        for minute in 1..=10 {
            throttle.maybe_enrich("t1", Some(POS), t0 + Duration::from_secs(60 * minute));
            tokio::time::sleep(Duration::from_secs(11)).await;
        }
        assert_eq!(throttle.lookups_started(), 11);
    }

    #[tokio::test]
    async fn panicking_lookup_still_releases_the_slot() {
        let t0 = Instant::now();
        let registry = seeded_registry("t1", t0);
        let throttle = EnrichmentThrottle::new(registry.clone(), Arc::new(PanickingResolver), Duration::from_secs(10));

        throttle.maybe_enrich("t1", Some(POS), t0);
        settle(&registry, "t1").await;
        assert!(registry.get("t1").unwrap().enrichment.refreshed_at.is_some());

        throttle.maybe_enrich("t1", Some(POS), t0 + Duration::from_secs(5));
        assert_eq!(throttle.lookups_started(), 1);
        throttle.maybe_enrich("t1", Some(POS), t0 + Duration::from_secs(10));
        assert_eq!(throttle.lookups_started(), 2);
    }
}
