//! # Motion Classifier
//!
//! The engine only needs `predict(window) -> label`. The default implementation
//! is a nearest-centroid classifier driven by a JSON artifact produced offline:
//!
//! ```json
//! {
//!   "features":  ["accX", "accY", ... 12 names],
//!   "mean":      [12 numbers],
//!   "scale":     [12 numbers],
//!   "centroids": { "Normal": [12 numbers], "Harsh Braking": [12 numbers] }
//! }
//! ```
//!
//! The window's per-channel mean is standardised with `mean`/`scale` and the
//! closest centroid (Euclidean) wins. Loading fails hard: without an artifact
//! there is nothing useful to serve.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::core::sample::{FeatureVector, FEATURE_CHANNELS};
use crate::errors::ClassifierError;

/// Outcome of classifying a session window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prediction {
    /// A class label.
    Label(String),
    /// The window is still filling up.
    Buffering,
    /// The window is full but could not be classified.
    Unavailable,
}

impl Prediction {
    /// Text shown to viewers.
    pub fn as_str(&self) -> &str {
        match self {
            Prediction::Label(label) => label,
            Prediction::Buffering => "Buffering...",
            Prediction::Unavailable => "Unknown",
        }
    }
}

/// Classifies a trip's recent motion window.
pub trait Classifier: Send + Sync {
    /// Labels `window` (oldest sample first).
    fn predict(&self, window: &[FeatureVector]) -> Prediction;
}

#[derive(Debug, Deserialize)]
struct Artifact {
    features: Vec<String>,
    mean: Vec<f64>,
    scale: Vec<f64>,
    centroids: BTreeMap<String, Vec<f64>>,
}

/// Nearest-centroid classifier over window means.
#[derive(Debug, Clone)]
pub struct CentroidClassifier {
    sequence_length: usize,
    mean: FeatureArray,
    scale: FeatureArray,
    centroids: Vec<(String, FeatureArray)>,
}

type FeatureArray = [f64; 12];

impl CentroidClassifier {
    /// Loads the artifact at `path`. Windows shorter than `sequence_length`
    /// predict [`Prediction::Buffering`].
    pub fn load(path: &Path, sequence_length: usize) -> Result<Self, ClassifierError> {
        let raw = fs::read_to_string(path).map_err(|source| ClassifierError::ArtifactMissing {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw, sequence_length)
    }

    /// Parses and validates an artifact document.
    pub fn from_json(raw: &str, sequence_length: usize) -> Result<Self, ClassifierError> {
        let artifact: Artifact =
            serde_json::from_str(raw).map_err(|e| ClassifierError::ArtifactInvalid(e.to_string()))?;

        if artifact.features != FEATURE_CHANNELS {
            return Err(ClassifierError::ArtifactInvalid(format!(
                "feature order {:?} does not match {:?}",
                artifact.features, FEATURE_CHANNELS
            )));
        }
        let mean = to_array("mean", &artifact.mean)?;
        let scale = to_array("scale", &artifact.scale)?;
        if scale.iter().any(|s| *s == 0.0) {
            return Err(ClassifierError::ArtifactInvalid("scale contains zero".into()));
        }
        if artifact.centroids.is_empty() {
            return Err(ClassifierError::ArtifactInvalid("no centroids".into()));
        }
        let centroids = artifact
            .centroids
            .iter()
            .map(|(label, values)| Ok((label.clone(), to_array(label, values)?)))
            .collect::<Result<Vec<_>, ClassifierError>>()?;

        Ok(Self {
            sequence_length: sequence_length.max(1),
            mean,
            scale,
            centroids,
        })
    }

    /// Class labels known to the artifact, sorted.
    pub fn labels(&self) -> Vec<&str> {
        self.centroids.iter().map(|(l, _)| l.as_str()).collect()
    }
}

fn to_array(name: &str, values: &[f64]) -> Result<FeatureArray, ClassifierError> {
    <FeatureArray>::try_from(values).map_err(|_| {
        ClassifierError::ArtifactInvalid(format!("{name} has {} values, expected 12", values.len()))
    })
}

impl Classifier for CentroidClassifier {
    fn predict(&self, window: &[FeatureVector]) -> Prediction {
        if window.len() < self.sequence_length {
            return Prediction::Buffering;
        }

        let mut point = [0.0; 12];
        for (i, slot) in point.iter_mut().enumerate() {
            let (sum, n) = window
                .iter()
                .filter_map(|row| row[i])
                .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
            if n == 0 {
                return Prediction::Unavailable;
            }
            *slot = (sum / n as f64 - self.mean[i]) / self.scale[i];
        }

        self.centroids
            .iter()
            .map(|(label, centroid)| {
                let distance: f64 = centroid.iter().zip(point.iter()).map(|(c, p)| (c - p).powi(2)).sum();
                (label, distance)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map_or(Prediction::Unavailable, |(label, _)| Prediction::Label(label.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn artifact() -> String {
        json!({
            "features": FEATURE_CHANNELS,
            "mean": vec![0.0; 12],
            "scale": vec![1.0; 12],
            "centroids": {
                "Normal": vec![0.0; 12],
                "Aggressive": vec![5.0; 12]
            }
        })
        .to_string()
    }

    fn row(v: f64) -> FeatureVector {
        [Some(v); 12]
    }

    #[test]
    fn short_window_is_buffering() {
        let clf = CentroidClassifier::from_json(&artifact(), 3).unwrap();
        assert_eq!(clf.predict(&[row(0.0), row(0.0)]), Prediction::Buffering);
        assert_eq!(Prediction::Buffering.as_str(), "Buffering...");
    }

    #[test]
    fn nearest_centroid_wins() {
        let clf = CentroidClassifier::from_json(&artifact(), 2).unwrap();
        assert_eq!(clf.predict(&[row(0.1), row(0.3)]), Prediction::Label("Normal".into()));
        assert_eq!(clf.predict(&[row(4.0), row(6.5)]), Prediction::Label("Aggressive".into()));
        assert_eq!(clf.labels(), vec!["Aggressive", "Normal"]);
    }

    #[test]
    fn channel_missing_everywhere_is_unavailable() {
        let clf = CentroidClassifier::from_json(&artifact(), 1).unwrap();
        let mut r = row(1.0);
        r[4] = None;
        assert_eq!(clf.predict(&[r]), Prediction::Unavailable);
        assert_eq!(Prediction::Unavailable.as_str(), "Unknown");
    }

    #[test]
    fn invalid_artifacts_are_rejected() {
        let wrong_len = json!({
            "features": FEATURE_CHANNELS, "mean": vec![0.0; 3], "scale": vec![1.0; 12],
            "centroids": { "Normal": vec![0.0; 12] }
        });
        assert!(matches!(
            CentroidClassifier::from_json(&wrong_len.to_string(), 1),
            Err(ClassifierError::ArtifactInvalid(_))
        ));

        let zero_scale = json!({
            "features": FEATURE_CHANNELS, "mean": vec![0.0; 12], "scale": vec![0.0; 12],
            "centroids": { "Normal": vec![0.0; 12] }
        });
        assert!(CentroidClassifier::from_json(&zero_scale.to_string(), 1).is_err());
        assert!(CentroidClassifier::from_json("not json", 1).is_err());
    }

    #[test]
    fn load_reads_file_and_reports_missing_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(artifact().as_bytes()).unwrap();
        assert!(CentroidClassifier::load(file.path(), 40).is_ok());

        let missing = CentroidClassifier::load(Path::new("/nonexistent/model.json"), 40);
        assert!(matches!(missing, Err(ClassifierError::ArtifactMissing { .. })));
    }
}
