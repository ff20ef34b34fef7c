//! # Road-Attribute Resolver
//!
//! Interface to the external service that turns a position into a road speed
//! limit, plus the default implementation backed by a Nominatim-compatible
//! reverse-geocoding endpoint (`resolvers` feature).
//!
//! The resolver does no retrying of its own. Pacing is the enrichment throttle's
//! job; a failed lookup simply reports an error.

use async_trait::async_trait;
use serde_json::Value;

use crate::core::sample::Position;
use crate::errors::ResolveError;

/// What a lookup resolved for one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoadAttribute {
    /// Speed limit in km/h, `None` when the road has no usable tag.
    pub speed_limit: Option<u32>,
    /// Position snapped to the road by the service (or the query position).
    pub snapped: Position,
}

/// # Road Resolver
///
/// Implementations must be cheap to share; the throttle calls them from
/// spawned tasks.
#[async_trait]
pub trait RoadResolver: Send + Sync {
    /// Resolves the road attribute at `position`.
    async fn lookup(&self, position: Position) -> Result<RoadAttribute, ResolveError>;
}

/// Interprets a reverse-geocoding response body.
///
/// `extratags.maxspeed` counts only when it is made of ASCII digits. `lat`/`lon`
/// arrive as strings; unparsable values fall back to the query position.
pub fn parse_reverse_response(body: &Value, query: Position) -> RoadAttribute {
    let speed_limit = body
        .get("extratags")
        .and_then(|tags| tags.get("maxspeed"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse::<u32>().ok());

    let coordinate = |key: &str, fallback: f64| match body.get(key) {
        Some(Value::String(s)) => s.parse::<f64>().unwrap_or(fallback),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(fallback),
        _ => fallback,
    };

    RoadAttribute {
        speed_limit,
        snapped: Position {
            latitude: coordinate("lat", query.latitude),
            longitude: coordinate("lon", query.longitude),
        },
    }
}

#[cfg(feature = "resolvers")]
pub use nominatim::NominatimResolver;

#[cfg(feature = "resolvers")]
mod nominatim {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;
    use tracing::{debug, warn};

    use super::{parse_reverse_response, RoadAttribute, RoadResolver};
    use crate::core::sample::Position;
    use crate::errors::ResolveError;

    /// Reverse-geocoding resolver over HTTP.
    pub struct NominatimResolver {
        client: reqwest::Client,
        url: String,
    }

    impl NominatimResolver {
        /// Builds a resolver for `url` with a per-request `timeout`.
        ///
        /// Public Nominatim instances reject requests without an identifying
        /// user agent.
        pub fn new(url: &str, user_agent: &str, timeout: Duration) -> Result<Self, ResolveError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(user_agent)
                .build()
                .map_err(|e| ResolveError::Http(e.to_string()))?;
            Ok(Self {
                client,
                url: url.to_string(),
            })
        }
    }

    #[async_trait]
    impl RoadResolver for NominatimResolver {
        async fn lookup(&self, position: Position) -> Result<RoadAttribute, ResolveError> {
            let query = [
                ("format", "json".to_string()),
                ("lat", position.latitude.to_string()),
                ("lon", position.longitude.to_string()),
                ("zoom", "18".to_string()),
                ("extratags", "1".to_string()),
            ];

            let response = self
                .client
                .get(&self.url)
                .query(&query)
                .send()
                .await
                .map_err(|e| ResolveError::Http(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                warn!(status = status.as_u16(), "road lookup rejected");
                return Err(ResolveError::Status(status.as_u16()));
            }

            let body = response
                .json::<Value>()
                .await
                .map_err(|e| ResolveError::Decode(e.to_string()))?;
            let attribute = parse_reverse_response(&body, position);
            debug!(speed_limit = ?attribute.speed_limit, "road lookup resolved");
            Ok(attribute)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const QUERY: Position = Position {
        latitude: 3.0,
        longitude: 101.0,
    };

    #[test]
    fn numeric_maxspeed_and_snapped_position() {
        let body = json!({
            "lat": "3.1390", "lon": "101.6869",
            "extratags": { "maxspeed": "90" }
        });
        let attr = parse_reverse_response(&body, QUERY);
        assert_eq!(attr.speed_limit, Some(90));
        assert_eq!(attr.snapped, Position { latitude: 3.139, longitude: 101.6869 });
    }

    #[test]
    fn non_numeric_maxspeed_is_unknown() {
        for tag in ["50 mph", "", "signals", "-30"] {
            let body = json!({ "extratags": { "maxspeed": tag } });
            assert_eq!(parse_reverse_response(&body, QUERY).speed_limit, None, "{tag}");
        }
    }

    #[test]
    fn missing_fields_fall_back_to_query() {
        let attr = parse_reverse_response(&json!({ "lat": "north" }), QUERY);
        assert_eq!(attr.speed_limit, None);
        assert_eq!(attr.snapped, QUERY);
    }
}
