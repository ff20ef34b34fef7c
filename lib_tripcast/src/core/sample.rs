//! # Telemetry Samples and the Event Normalizer
//!
//! Raw broker payloads are untyped JSON objects produced by the phone app. This
//! module turns them into an immutable [`TelemetrySample`], rejecting anything
//! that cannot be attributed to a trip.
//!
//! ## Shaping rules
//! - `tripId` is the only required field. It must be a non-empty string (an
//!   integer id is accepted and kept in its decimal form).
//! - Every numeric channel accepts a JSON number or a numeric string. Any other
//!   shape, or a missing key, leaves the channel as `None`. Nothing is zeroed.
//! - `timestamp` accepts a string or a number and keeps its textual form.
//!
//! The [`SampleNormalizer`] counts accepted and rejected payloads so operators can
//! see malformed traffic without it ever interrupting ingestion.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::NormalizeError;

/// Names of the channels that feed the classification window, in window order.
pub const FEATURE_CHANNELS: [&str; 12] = [
    "accX", "accY", "accZ", "accMag", "gyroX", "gyroY", "gyroZ", "gyroMag", "rotVecX", "rotVecY",
    "rotVecZ", "rotVecW",
];

/// One row of the session window: the classification channels of a sample.
pub type FeatureVector = [Option<f64>; 12];

/// A geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

/// # Telemetry Sample
///
/// A validated, immutable reading from one device for one trip.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    /// Device-side timestamp, as sent.
    pub timestamp: Option<String>,
    /// Trip identifier. Never empty.
    pub trip_id: String,
    /// Optional training label attached by the collector app.
    pub label: Option<String>,
    /// Linear acceleration, x axis.
    pub acc_x: Option<f64>,
    /// Linear acceleration, y axis.
    pub acc_y: Option<f64>,
    /// Linear acceleration, z axis.
    pub acc_z: Option<f64>,
    /// Acceleration magnitude.
    pub acc_mag: Option<f64>,
    /// Angular rate, x axis.
    pub gyro_x: Option<f64>,
    /// Angular rate, y axis.
    pub gyro_y: Option<f64>,
    /// Angular rate, z axis.
    pub gyro_z: Option<f64>,
    /// Angular rate magnitude.
    pub gyro_mag: Option<f64>,
    /// Rotation vector, x component.
    pub rot_vec_x: Option<f64>,
    /// Rotation vector, y component.
    pub rot_vec_y: Option<f64>,
    /// Rotation vector, z component.
    pub rot_vec_z: Option<f64>,
    /// Rotation vector, scalar component.
    pub rot_vec_w: Option<f64>,
    /// GPS latitude.
    pub latitude: Option<f64>,
    /// GPS longitude.
    pub longitude: Option<f64>,
    /// Ground speed in m/s.
    pub speed: Option<f64>,
    /// Altitude in metres.
    pub altitude: Option<f64>,
}

impl TelemetrySample {
    /// Shapes a decoded JSON value into a sample.
    pub fn from_value(value: &Value) -> Result<Self, NormalizeError> {
        let obj = value.as_object().ok_or(NormalizeError::NotAnObject)?;
        let trip_id = trip_id_field(obj).ok_or(NormalizeError::MissingTripId)?;

        Ok(Self {
            timestamp: text_field(obj, "timestamp"),
            trip_id,
            label: obj.get("label").and_then(Value::as_str).map(str::to_string),
            acc_x: number_field(obj, "accX"),
            acc_y: number_field(obj, "accY"),
            acc_z: number_field(obj, "accZ"),
            acc_mag: number_field(obj, "accMag"),
            gyro_x: number_field(obj, "gyroX"),
            gyro_y: number_field(obj, "gyroY"),
            gyro_z: number_field(obj, "gyroZ"),
            gyro_mag: number_field(obj, "gyroMag"),
            rot_vec_x: number_field(obj, "rotVecX"),
            rot_vec_y: number_field(obj, "rotVecY"),
            rot_vec_z: number_field(obj, "rotVecZ"),
            rot_vec_w: number_field(obj, "rotVecW"),
            latitude: number_field(obj, "latitude"),
            longitude: number_field(obj, "longitude"),
            speed: number_field(obj, "speed"),
            altitude: number_field(obj, "altitude"),
        })
    }

    /// The classification channels, ordered as [`FEATURE_CHANNELS`].
    pub fn features(&self) -> FeatureVector {
        [
            self.acc_x,
            self.acc_y,
            self.acc_z,
            self.acc_mag,
            self.gyro_x,
            self.gyro_y,
            self.gyro_z,
            self.gyro_mag,
            self.rot_vec_x,
            self.rot_vec_y,
            self.rot_vec_z,
            self.rot_vec_w,
        ]
    }

    /// The GPS fix, when both coordinates are present.
    pub fn position(&self) -> Option<Position> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Position { latitude, longitude }),
            _ => None,
        }
    }

    /// Ground speed converted from m/s to km/h.
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed.map(|mps| mps * 3.6)
    }
}

fn trip_id_field(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("tripId")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    let parsed = match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// # Sample Normalizer
///
/// Stateless apart from its counters, so a single instance is shared by every
/// ingestion path.
#[derive(Debug, Default)]
pub struct SampleNormalizer {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl SampleNormalizer {
    /// Creates a normalizer with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes raw payload bytes and shapes them into a sample.
    pub fn normalize_bytes(&self, bytes: &[u8]) -> Result<TelemetrySample, NormalizeError> {
        let decoded = serde_json::from_slice::<Value>(bytes)
            .map_err(|e| NormalizeError::Undecodable(e.to_string()));
        match decoded {
            Ok(value) => self.normalize_value(&value),
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Shapes an already decoded payload into a sample.
    pub fn normalize_value(&self, value: &Value) -> Result<TelemetrySample, NormalizeError> {
        let result = TelemetrySample::from_value(value);
        let counter = if result.is_ok() { &self.accepted } else { &self.rejected };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Number of payloads accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Number of payloads rejected so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_payload_is_shaped() {
        let sample = TelemetrySample::from_value(&json!({
            "timestamp": "2025-01-01T00:00:00Z",
            "tripId": "t1",
            "label": "Normal",
            "accX": 0.5, "accY": "1.5", "accZ": -9.8, "accMag": 9.9,
            "latitude": 3.1, "longitude": 101.6, "speed": 10.0
        }))
        .unwrap();

        assert_eq!(sample.trip_id, "t1");
        assert_eq!(sample.label.as_deref(), Some("Normal"));
        assert_eq!(sample.acc_y, Some(1.5));
        assert_eq!(sample.gyro_x, None);
        assert_eq!(sample.speed_kmh(), Some(36.0));
        assert_eq!(
            sample.position(),
            Some(Position { latitude: 3.1, longitude: 101.6 })
        );
    }

    #[test]
    fn wrong_shapes_become_absent() {
        let sample = TelemetrySample::from_value(&json!({
            "tripId": "t1",
            "accX": "fast",
            "accY": [1, 2],
            "accZ": null,
            "speed": true,
            "timestamp": 1700000000
        }))
        .unwrap();

        assert_eq!(sample.acc_x, None);
        assert_eq!(sample.acc_y, None);
        assert_eq!(sample.acc_z, None);
        assert_eq!(sample.speed, None);
        assert_eq!(sample.timestamp.as_deref(), Some("1700000000"));
        assert!(sample.features().iter().all(Option::is_none));
    }

    #[test]
    fn trip_id_is_required() {
        assert_eq!(
            TelemetrySample::from_value(&json!({"accX": 1.0})),
            Err(NormalizeError::MissingTripId)
        );
        assert_eq!(
            TelemetrySample::from_value(&json!({"tripId": "  "})),
            Err(NormalizeError::MissingTripId)
        );
        assert_eq!(
            TelemetrySample::from_value(&json!({"tripId": {"id": 1}})),
            Err(NormalizeError::MissingTripId)
        );
        assert_eq!(TelemetrySample::from_value(&json!([1, 2])), Err(NormalizeError::NotAnObject));
    }

    #[test]
    fn position_needs_both_coordinates() {
        let sample = TelemetrySample::from_value(&json!({"tripId": 7, "latitude": 1.0})).unwrap();
        assert_eq!(sample.trip_id, "7");
        assert_eq!(sample.position(), None);
    }

    #[test]
    fn normalizer_counts_rejections_and_keeps_going() {
        let normalizer = SampleNormalizer::new();

        assert!(matches!(
            normalizer.normalize_bytes(b"{not json"),
            Err(NormalizeError::Undecodable(_))
        ));
        assert!(normalizer.normalize_bytes(br#"{"accX": 1}"#).is_err());
        assert!(normalizer.normalize_bytes(br#"{"tripId": "t9"}"#).is_ok());

        assert_eq!(normalizer.rejected(), 2);
        assert_eq!(normalizer.accepted(), 1);
    }

    #[test]
    fn serializes_with_wire_names() {
        let sample = TelemetrySample::from_value(&json!({"tripId": "t1", "rotVecW": 0.7})).unwrap();
        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(value["tripId"], "t1");
        assert_eq!(value["rotVecW"], 0.7);
        assert!(value["accMag"].is_null());
    }
}
