//! # Record Sink
//!
//! Append-only destination for one flattened record per processed sample.
//! The flattened record is the sample itself: its serialised field order is the
//! dataset column order (`timestamp, tripId, label, accX .. altitude`).
//!
//! `CsvSink` (`persistence` feature) appends rows to a CSV dataset file, writing
//! the header only when it creates the file.

use crate::core::sample::TelemetrySample;
use crate::errors::SinkError;

/// Column order of the flattened record.
pub const RECORD_COLUMNS: [&str; 19] = [
    "timestamp", "tripId", "label", "accX", "accY", "accZ", "accMag", "gyroX", "gyroY", "gyroZ",
    "gyroMag", "rotVecX", "rotVecY", "rotVecZ", "rotVecW", "latitude", "longitude", "speed",
    "altitude",
];

/// Durable append-only record destination.
pub trait RecordSink: Send + Sync {
    /// Appends one record.
    fn append(&self, sample: &TelemetrySample) -> Result<(), SinkError>;
}

/// Sink that drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl RecordSink for DiscardSink {
    fn append(&self, _sample: &TelemetrySample) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(feature = "persistence")]
pub use csv_sink::CsvSink;

#[cfg(feature = "persistence")]
mod csv_sink {
    use std::fs::{File, OpenOptions};
    use std::path::Path;
    use std::sync::{Mutex, PoisonError};

    use tracing::info;

    use super::RecordSink;
    use crate::core::sample::TelemetrySample;
    use crate::errors::SinkError;

    /// CSV dataset writer.
    pub struct CsvSink {
        writer: Mutex<csv::Writer<File>>,
    }

    impl CsvSink {
        /// Opens `path` for appending, creating it if absent. A header row is
        /// written first whenever the file is empty.
        pub fn open(path: &Path) -> Result<Self, SinkError> {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let empty = file.metadata()?.len() == 0;
            let writer = csv::WriterBuilder::new().has_headers(empty).from_writer(file);
            if empty {
                info!(path = %path.display(), "starting empty CSV dataset file");
            }
            Ok(Self {
                writer: Mutex::new(writer),
            })
        }
    }

    impl RecordSink for CsvSink {
        fn append(&self, sample: &TelemetrySample) -> Result<(), SinkError> {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer
                .serialize(sample)
                .map_err(|e| SinkError::Encode(e.to_string()))?;
            writer.flush()?;
            Ok(())
        }
    }

}
