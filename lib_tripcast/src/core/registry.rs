//! # Trip Session Registry
//!
//! Owns every live trip session keyed by trip id, together with the time of the
//! most recent accepted sample across all trips.
//!
//! ## Concurrency
//! All state sits behind a single `Mutex`. Each operation takes the lock, does
//! bounded in-memory work and releases it, so:
//! - two samples for the same trip can never interleave their window updates;
//! - a reaper sweep and a concurrent `record_sample` for the same trip are
//!   linearised: the sample either lands before the sweep (and may keep the
//!   session alive) or after it (and recreates the session as first-seen);
//! - readers only ever observe fully constructed sessions.
//!
//! No caller may hold the lock across an `.await`; the API is synchronous on
//! purpose. Enrichment lookups run outside it and report back through
//! [`TripRegistry::finish_enrichment`].
//!
//! ## Session identity
//! Every session gets a monotonically increasing `generation` when created. A
//! late enrichment result carrying the generation of an evicted session is
//! discarded instead of writing into whatever session now owns the trip id.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::core::sample::{FeatureVector, Position, TelemetrySample};

/// Cached outcome of the last road-attribute lookup for a trip.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnrichmentResult {
    /// Speed limit in km/h, or `None` when unknown.
    pub speed_limit: Option<u32>,
    /// Position as adjusted by the resolver on the last successful lookup.
    ///
    /// In values handed out by the enrichment throttle this is set only on the
    /// first read after the lookup that produced it; the stored cache keeps it.
    pub snapped: Option<Position>,
    /// When the cached value was last written by a completed lookup.
    pub refreshed_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct EnrichmentState {
    cached: EnrichmentResult,
    last_attempt: Option<Instant>,
    in_flight: bool,
    snap_unread: bool,
}

impl EnrichmentState {
    /// The cached value, carrying the snapped position only if no earlier
    /// read has taken it.
    fn read(&mut self) -> EnrichmentResult {
        let mut current = self.cached;
        if !std::mem::take(&mut self.snap_unread) {
            current.snapped = None;
        }
        current
    }
}

#[derive(Debug)]
struct TripSession {
    generation: u64,
    window: VecDeque<FeatureVector>,
    last_seen: Instant,
    enrichment: EnrichmentState,
}

/// Read-only snapshot of a session handed to downstream stages.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    /// Trip this session belongs to.
    pub trip_id: String,
    /// Identity of this incarnation of the session.
    pub generation: u64,
    /// Window contents, oldest first.
    pub window: Vec<FeatureVector>,
    /// Fixed window capacity.
    pub capacity: usize,
    /// Time of the last sample recorded for the trip.
    pub last_seen: Instant,
    /// Cached enrichment state at snapshot time.
    pub enrichment: EnrichmentResult,
}

impl SessionView {
    /// True once the window holds `capacity` samples.
    pub fn is_window_full(&self) -> bool {
        self.window.len() >= self.capacity
    }
}

/// Result of [`TripRegistry::record_sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    /// `true` when this sample created the session.
    pub first_seen: bool,
    /// Snapshot taken right after the update.
    pub view: SessionView,
}

/// Decision taken atomically by [`TripRegistry::begin_enrichment`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EnrichmentDecision {
    /// No lookup should start; use the cached value.
    Cached(EnrichmentResult),
    /// A lookup was claimed for this generation; the previous value is returned.
    Started {
        generation: u64,
        previous: EnrichmentResult,
    },
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: BTreeMap<String, TripSession>,
    last_message_at: Option<Instant>,
    next_generation: u64,
}

/// # Trip Registry
///
/// Shared through an `Arc` by the ingestion pipeline, the reaper, the connectivity
/// monitor and the enrichment throttle.
#[derive(Debug)]
pub struct TripRegistry {
    inner: Mutex<RegistryInner>,
    window_capacity: usize,
}

impl TripRegistry {
    /// Creates an empty registry whose sessions keep `window_capacity` samples.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(window_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            window_capacity: window_capacity.max(1),
        }
    }

    /// Capacity of every session window.
    pub fn window_capacity(&self) -> usize {
        self.window_capacity
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // Every critical section leaves the map consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Record Sample
    ///
    /// Creates the session if the trip is unseen, pushes the sample's feature
    /// vector into its window (evicting the oldest entry beyond capacity) and
    /// stamps both the session's and the registry's last-seen times with `now`.
    pub fn record_sample(&self, sample: &TelemetrySample, now: Instant) -> Recorded {
        let capacity = self.window_capacity;
        let mut inner = self.lock();
        let RegistryInner {
            sessions,
            last_message_at,
            next_generation,
        } = &mut *inner;
        *last_message_at = Some(now);

        let mut first_seen = false;
        let session = sessions.entry(sample.trip_id.clone()).or_insert_with(|| {
            first_seen = true;
            *next_generation += 1;
            TripSession {
                generation: *next_generation,
                window: VecDeque::with_capacity(capacity),
                last_seen: now,
                enrichment: EnrichmentState::default(),
            }
        });

        if session.window.len() == capacity {
            session.window.pop_front();
        }
        session.window.push_back(sample.features());
        session.last_seen = now;

        Recorded {
            first_seen,
            view: snapshot(&sample.trip_id, session, capacity),
        }
    }

    /// Snapshot of one session, if present.
    pub fn get(&self, trip_id: &str) -> Option<SessionView> {
        let inner = self.lock();
        inner
            .sessions
            .get(trip_id)
            .map(|s| snapshot(trip_id, s, self.window_capacity))
    }

    /// Active trip ids in ascending order.
    pub fn list_active_trip_ids(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes one session, window and enrichment cache together.
    ///
    /// Returns `true` if a session was removed.
    pub fn evict(&self, trip_id: &str) -> bool {
        self.lock().sessions.remove(trip_id).is_some()
    }

    /// # Reap Inactive
    ///
    /// Removes, in one critical section, every session whose last sample is more
    /// than `inactivity_timeout` older than `now`. Returns the evicted ids in
    /// ascending order.
    pub fn reap_inactive(&self, now: Instant, inactivity_timeout: Duration) -> Vec<String> {
        let mut inner = self.lock();
        let stale: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_seen) > inactivity_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.sessions.remove(id);
        }
        stale
    }

    /// Time of the most recent accepted sample for any trip.
    pub fn last_message_at(&self) -> Option<Instant> {
        self.lock().last_message_at
    }

    /// Atomically decides whether a lookup should start for `trip_id`.
    ///
    /// A lookup is claimed when none is in flight and the previous attempt is at
    /// least `interval` old (or there was none). Claiming stamps the attempt time
    /// and raises the in-flight flag in the same critical section.
    pub(crate) fn begin_enrichment(
        &self,
        trip_id: &str,
        now: Instant,
        interval: Duration,
    ) -> Option<EnrichmentDecision> {
        let mut inner = self.lock();
        let session = inner.sessions.get_mut(trip_id)?;
        let state = &mut session.enrichment;

        let due = state
            .last_attempt
            .map_or(true, |at| now.saturating_duration_since(at) >= interval);
        let current = state.read();
        if state.in_flight || !due {
            return Some(EnrichmentDecision::Cached(current));
        }

        state.in_flight = true;
        state.last_attempt = Some(now);
        Some(EnrichmentDecision::Started {
            generation: session.generation,
            previous: current,
        })
    }

    /// Stores the outcome of a lookup started by [`Self::begin_enrichment`].
    ///
    /// `resolved` is `None` when the lookup failed; the cache then reads
    /// "unknown". Returns `false`, writing nothing, when the session was evicted
    /// (or replaced by a newer generation) while the lookup was in flight.
    pub(crate) fn finish_enrichment(
        &self,
        trip_id: &str,
        generation: u64,
        resolved: Option<(Option<u32>, Position)>,
        now: Instant,
    ) -> bool {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get_mut(trip_id) else {
            return false;
        };
        if session.generation != generation {
            return false;
        }

        let state = &mut session.enrichment;
        state.in_flight = false;
        state.snap_unread = resolved.is_some();
        state.cached = match resolved {
            Some((speed_limit, snapped)) => EnrichmentResult {
                speed_limit,
                snapped: Some(snapped),
                refreshed_at: Some(now),
            },
            None => EnrichmentResult {
                speed_limit: None,
                snapped: None,
                refreshed_at: Some(now),
            },
        };
        true
    }
}

fn snapshot(trip_id: &str, session: &TripSession, capacity: usize) -> SessionView {
    SessionView {
        trip_id: trip_id.to_string(),
        generation: session.generation,
        window: session.window.iter().copied().collect(),
        capacity,
        last_seen: session.last_seen,
        enrichment: session.enrichment.cached,
    }
}
