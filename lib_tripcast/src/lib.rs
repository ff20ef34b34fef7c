//! # lib_tripcast
//!
//! Live trip-session and broadcast engine: ingests per-device telemetry,
//! keeps a bounded window per trip, enriches samples with road attributes,
//! classifies motion and fans enriched updates out to live viewers.

// Declare the modules to re-export
pub mod collaborators;
pub mod core;
pub mod errors;

#[cfg(feature = "ingestors")]
pub mod ingestors;

// Re-export the types callers wire together
pub use crate::collaborators::classifier::{CentroidClassifier, Classifier, Prediction};
pub use crate::collaborators::resolver::{RoadAttribute, RoadResolver};
pub use crate::collaborators::sink::{DiscardSink, RecordSink};
pub use crate::core::broadcast_hub::{BroadcastHub, PublishReport, Subscription};
pub use crate::core::connectivity::{ConnectivityMonitor, ConnectivityState};
pub use crate::core::events::{BroadcastEvent, EventKind};
pub use crate::core::pipeline::{PipelineParts, TelemetryPipeline};
pub use crate::core::reaper::{run_trip_list_ticker, SessionReaper};
pub use crate::core::registry::TripRegistry;
pub use crate::core::sample::{Position, TelemetrySample};
pub use crate::core::settings::EngineSettings;
pub use crate::errors::*;

#[cfg(feature = "persistence")]
pub use crate::collaborators::sink::CsvSink;

#[cfg(feature = "resolvers")]
pub use crate::collaborators::resolver::NominatimResolver;

#[cfg(feature = "ingestors")]
pub use crate::ingestors::redis_pubsub::RedisIngestor;
