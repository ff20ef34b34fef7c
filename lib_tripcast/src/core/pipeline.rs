//! # Telemetry Pipeline
//!
//! The per-message path from broker payload to viewers:
//!
//! 1.  **Normalize**: decode and shape; malformed payloads are counted and dropped.
//! 2.  **Record**: update the trip's session window and last-seen time.
//! 3.  **Classify**: label the session window.
//! 4.  **Enrich**: read the cached speed limit, possibly starting a background lookup.
//! 5.  **Persist**: append the flattened record to the sink (failures are logged).
//! 6.  **Publish**: fan the enriched `telematics-update` out to every viewer.
//!
//! None of these steps waits on the network, so a slow road lookup for one trip
//! never holds up samples for another.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collaborators::classifier::{Classifier, Prediction};
use crate::collaborators::resolver::RoadResolver;
use crate::collaborators::sink::RecordSink;
use crate::core::broadcast_hub::{BroadcastHub, PublishReport};
use crate::core::events::EventKind;
use crate::core::registry::{EnrichmentResult, TripRegistry};
use crate::core::sample::{SampleNormalizer, TelemetrySample};
use crate::core::throttle::EnrichmentThrottle;
use crate::errors::NormalizeError;

/// What happened to one accepted sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedSample {
    /// Trip the sample belongs to.
    pub trip_id: String,
    /// Whether this sample opened a new session.
    pub first_seen: bool,
    /// Classification of the session window.
    pub prediction: Prediction,
    /// Fan-out result of the `telematics-update`.
    pub report: PublishReport,
}

/// Collaborators and tunables the pipeline is built from.
pub struct PipelineParts {
    /// Shared session registry.
    pub registry: Arc<TripRegistry>,
    /// Shared broadcast hub.
    pub hub: Arc<BroadcastHub>,
    /// Window classifier.
    pub classifier: Arc<dyn Classifier>,
    /// Road-attribute resolver behind the throttle.
    pub resolver: Arc<dyn RoadResolver>,
    /// Record sink.
    pub sink: Arc<dyn RecordSink>,
    /// Minimum spacing of road lookups per trip.
    pub enrichment_interval: Duration,
    /// km/h allowed above the limit before a speeding alert.
    pub speeding_tolerance_kmh: f64,
}

/// # Telemetry Pipeline
pub struct TelemetryPipeline {
    normalizer: SampleNormalizer,
    registry: Arc<TripRegistry>,
    hub: Arc<BroadcastHub>,
    throttle: EnrichmentThrottle,
    classifier: Arc<dyn Classifier>,
    sink: Arc<dyn RecordSink>,
    speeding_tolerance_kmh: f64,
}

impl TelemetryPipeline {
    /// Assembles a pipeline from its parts.
    pub fn new(parts: PipelineParts) -> Self {
        let throttle = EnrichmentThrottle::new(
            Arc::clone(&parts.registry),
            parts.resolver,
            parts.enrichment_interval,
        );
        Self {
            normalizer: SampleNormalizer::new(),
            registry: parts.registry,
            hub: parts.hub,
            throttle,
            classifier: parts.classifier,
            sink: parts.sink,
            speeding_tolerance_kmh: parts.speeding_tolerance_kmh,
        }
    }

    /// Processes one raw broker payload at the current time.
    pub fn handle_payload(&self, bytes: &[u8]) -> Result<ProcessedSample, NormalizeError> {
        self.handle_payload_at(bytes, Instant::now())
    }

    /// Processes one raw broker payload as if received at `now`.
    pub fn handle_payload_at(&self, bytes: &[u8], now: Instant) -> Result<ProcessedSample, NormalizeError> {
        let sample = self.normalizer.normalize_bytes(bytes).map_err(|e| {
            warn!(error = %e, rejected = self.normalizer.rejected(), "dropping malformed payload");
            e
        })?;
        Ok(self.process(sample, now))
    }

    fn process(&self, sample: TelemetrySample, now: Instant) -> ProcessedSample {
        let recorded = self.registry.record_sample(&sample, now);
        if recorded.first_seen {
            info!(trip_id = %sample.trip_id, "new trip detected");
        }

        let prediction = self.classifier.predict(&recorded.view.window);
        if prediction == Prediction::Unavailable {
            warn!(trip_id = %sample.trip_id, "classifier could not label a full window");
        }

        let enrichment = self.throttle.maybe_enrich(&sample.trip_id, sample.position(), now);
        let payload = build_update(&sample, &prediction, &enrichment, self.speeding_tolerance_kmh);

        if let Err(e) = self.sink.append(&sample) {
            warn!(trip_id = %sample.trip_id, error = %e, "failed to persist record");
        }

        let report = self.hub.publish(EventKind::TelematicsUpdate, payload);
        debug!(trip_id = %sample.trip_id, delivered = report.delivered, "sample processed");

        ProcessedSample {
            trip_id: sample.trip_id,
            first_seen: recorded.first_seen,
            prediction,
            report,
        }
    }

    /// Payloads accepted so far.
    pub fn accepted(&self) -> u64 {
        self.normalizer.accepted()
    }

    /// Payloads rejected so far.
    pub fn rejected(&self) -> u64 {
        self.normalizer.rejected()
    }

    /// Road lookups started so far.
    pub fn lookups_started(&self) -> u64 {
        self.throttle.lookups_started()
    }

    /// The registry this pipeline writes to.
    pub fn registry(&self) -> &Arc<TripRegistry> {
        &self.registry
    }
}

/// Speed alert text for a sample given a (possibly unknown) limit.
pub fn speed_alert(speed_kmh: Option<f64>, speed_limit: Option<u32>, tolerance_kmh: f64) -> String {
    match (speed_limit, speed_kmh) {
        (None, _) => "Speed limit unknown.".to_string(),
        (Some(limit), Some(kmh)) if kmh > f64::from(limit) + tolerance_kmh => {
            format!("SPEEDING! {} km/h in a {} km/h zone.", kmh as i64, limit)
        }
        (Some(limit), _) => format!("OK. Limit: {} km/h", limit),
    }
}

/// Builds the `telematics-update` payload: the sample's channels plus
/// classification and enrichment fields. The snapped coordinates come from a
/// freshly completed road lookup when there is one, else from the sample.
pub fn build_update(
    sample: &TelemetrySample,
    prediction: &Prediction,
    enrichment: &EnrichmentResult,
    tolerance_kmh: f64,
) -> Value {
    let mut map = match serde_json::to_value(sample) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };

    map.insert("prediction".into(), json!(prediction.as_str()));
    map.insert("speedLimit".into(), json!(enrichment.speed_limit));
    let (snapped_latitude, snapped_longitude) = match enrichment.snapped {
        Some(snapped) => (Some(snapped.latitude), Some(snapped.longitude)),
        None => (sample.latitude, sample.longitude),
    };
    map.insert("snapped_latitude".into(), json!(snapped_latitude));
    map.insert("snapped_longitude".into(), json!(snapped_longitude));
    map.insert(
        "alert".into(),
        json!(speed_alert(sample.speed_kmh(), enrichment.speed_limit, tolerance_kmh)),
    );
    Value::Object(map)
}
