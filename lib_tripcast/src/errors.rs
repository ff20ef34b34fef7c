//! # Error Taxonomy
//!
//! Every fallible boundary of the engine reports through one of the enums below.
//! Only the startup-time variants (`ClassifierError`, a sink that cannot be
//! created) are expected to reach `main`; everything raised while the pipeline is
//! running is logged at the point of failure and absorbed there.

use thiserror::Error;

/// Reasons an inbound payload was rejected by the normalizer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// The payload bytes were not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    Undecodable(String),

    /// The payload decoded, but is not a JSON object.
    #[error("payload is not a JSON object")]
    NotAnObject,

    /// The `tripId` field is missing, empty or not a string.
    #[error("payload has no usable tripId")]
    MissingTripId,
}

/// Failures of the external road-attribute lookup.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("road lookup request failed: {0}")]
    Http(String),

    /// The service answered with a non-success status.
    #[error("road lookup returned status {0}")]
    Status(u16),

    /// The response body could not be interpreted.
    #[error("road lookup response could not be decoded: {0}")]
    Decode(String),
}

/// Failures of the durable record sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Underlying file I/O failed.
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The CSV writer rejected the record.
    #[error("sink encoding error: {0}")]
    Encode(String),
}

/// Failures while loading the classifier artifact at startup.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// The artifact file does not exist or cannot be read.
    #[error("classifier artifact {path} could not be read: {source}")]
    ArtifactMissing {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The artifact was read but its content is unusable.
    #[error("classifier artifact is invalid: {0}")]
    ArtifactInvalid(String),
}

/// Failures of the broker transport.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The broker connection or subscription failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// The broker closed the message stream.
    #[error("broker message stream ended")]
    StreamEnded,
}
