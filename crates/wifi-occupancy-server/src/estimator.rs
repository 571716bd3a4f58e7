//! CSI occupancy estimators.
//!
//! An estimator maps a [`FeatureVector`] to a people count. Two
//! implementations ship with the server:
//!
//! - [`BaselineEstimator`]: rule-based, needs no training data
//! - [`LinearEstimator`]: standardised linear model trained offline on the
//!   JSONL training log and stored as JSON
//!
//! [`load_estimator`] picks the trained model when one is configured and
//! loadable, and otherwise degrades to the baseline.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wifi_occupancy_signal::{Feature, FeatureExtractor, FeatureVector, SignalError, FEATURE_COUNT};

use crate::error::EstimatorError;
use crate::protocol::CsiSample;

/// Confidence reported when a model exposes none.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Raw model output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Predicted people count (non-negative, may be fractional)
    pub count: f64,
    /// Model confidence, if the model has one
    pub confidence: Option<f64>,
}

/// Pluggable CSI → count model.
pub trait CsiEstimator: Send + Sync {
    /// Model name for logs and the health endpoint.
    fn name(&self) -> &str;

    /// Predict a count for one feature vector.
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, EstimatorError>;
}

/// One CSI estimate. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsiEstimate {
    /// Extracted features
    pub features: FeatureVector,
    /// Predicted count
    pub count: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Production time
    pub timestamp: DateTime<Utc>,
}

// ── Baseline ────────────────────────────────────────────────────────────────

/// Rule-based estimator driven by amplitude variability.
///
/// People in the Fresnel zone scatter the signal and raise the coefficient
/// of variation across subcarriers. The baseline maps the excess over an
/// empty-room level linearly to a count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineEstimator {
    /// Coefficient of variation of an empty room
    pub empty_cv: f64,
    /// Added coefficient of variation per person
    pub cv_per_person: f64,
    /// Upper bound on the predicted count
    pub max_count: f64,
}

impl Default for BaselineEstimator {
    fn default() -> Self {
        Self {
            empty_cv: 0.15,
            cv_per_person: 0.10,
            max_count: 10.0,
        }
    }
}

impl CsiEstimator for BaselineEstimator {
    fn name(&self) -> &str {
        "baseline"
    }

    fn predict(&self, features: &FeatureVector) -> Result<Prediction, EstimatorError> {
        let mean = features.get(Feature::Mean);
        let std = features.get(Feature::Std);
        let cv = if mean > f64::EPSILON { std / mean } else { 0.0 };
        let count = ((cv - self.empty_cv) / self.cv_per_person).clamp(0.0, self.max_count);
        Ok(Prediction {
            count,
            confidence: None,
        })
    }
}

// ── Trained linear model ────────────────────────────────────────────────────

/// On-disk form of a trained linear model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModelFile {
    /// Feature layout the model was trained on
    pub feature_version: u32,
    /// Per-feature training mean
    pub means: Vec<f64>,
    /// Per-feature training standard deviation
    pub stds: Vec<f64>,
    /// Per-feature weight on the standardised value
    pub weights: Vec<f64>,
    /// Intercept
    pub bias: f64,
    /// Validation-set confidence, if the trainer recorded one
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Standardised linear regression over the feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearEstimator {
    means: [f64; FEATURE_COUNT],
    scales: [f64; FEATURE_COUNT],
    weights: [f64; FEATURE_COUNT],
    bias: f64,
    confidence: Option<f64>,
}

impl LinearEstimator {
    /// Build from a parsed model file, checking it against this build's layout.
    pub fn from_model(model: LinearModelFile) -> Result<Self, EstimatorError> {
        SignalError::check_version(model.feature_version)
            .map_err(|e| EstimatorError::Incompatible(e.to_string()))?;

        let means = fixed(&model.means, "means")?;
        let stds = fixed(&model.stds, "stds")?;
        let weights = fixed(&model.weights, "weights")?;
        // Constant features were dropped by the trainer; keep them neutral.
        let scales = stds.map(|s| if s.abs() > f64::EPSILON { s } else { 1.0 });

        if !model.bias.is_finite() {
            return Err(EstimatorError::Incompatible("bias is not finite".into()));
        }
        let confidence = model.confidence.map(|c| c.clamp(0.0, 1.0));

        Ok(Self {
            means,
            scales,
            weights,
            bias: model.bias,
            confidence,
        })
    }

    /// Load a model from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, EstimatorError> {
        let load_err = |message: String| EstimatorError::ModelLoad {
            path: path.to_path_buf(),
            message,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let model: LinearModelFile =
            serde_json::from_str(&contents).map_err(|e| load_err(e.to_string()))?;
        Self::from_model(model)
    }
}

fn fixed(values: &[f64], field: &str) -> Result<[f64; FEATURE_COUNT], EstimatorError> {
    let arr: [f64; FEATURE_COUNT] = values.try_into().map_err(|_| {
        EstimatorError::Incompatible(format!(
            "{field} has {} entries, expected {FEATURE_COUNT}",
            values.len()
        ))
    })?;
    if arr.iter().any(|v| !v.is_finite()) {
        return Err(EstimatorError::Incompatible(format!("{field} contains non-finite values")));
    }
    Ok(arr)
}

impl CsiEstimator for LinearEstimator {
    fn name(&self) -> &str {
        "linear"
    }

    fn predict(&self, features: &FeatureVector) -> Result<Prediction, EstimatorError> {
        let raw = features
            .as_slice()
            .iter()
            .zip(self.means.iter().zip(self.scales.iter()))
            .zip(self.weights.iter())
            .fold(self.bias, |acc, ((x, (m, s)), w)| acc + w * (x - m) / s);

        if !raw.is_finite() {
            return Err(EstimatorError::NonFinite(raw));
        }
        Ok(Prediction {
            count: raw.max(0.0),
            confidence: self.confidence,
        })
    }
}

/// Pick the configured trained model, falling back to the baseline.
pub fn load_estimator(model_path: Option<&Path>) -> Arc<dyn CsiEstimator> {
    let Some(path) = model_path else {
        info!("No CSI model configured, using baseline estimator");
        return Arc::new(BaselineEstimator::default());
    };

    match LinearEstimator::from_file(path) {
        Ok(model) => {
            info!(path = %path.display(), "Loaded trained CSI model");
            Arc::new(model)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "CSI model unusable, falling back to baseline");
            Arc::new(BaselineEstimator::default())
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

/// Feature extraction followed by estimation.
#[derive(Clone)]
pub struct CsiPipeline {
    estimator: Arc<dyn CsiEstimator>,
}

impl CsiPipeline {
    /// Create a pipeline around `estimator`.
    pub fn new(estimator: Arc<dyn CsiEstimator>) -> Self {
        Self { estimator }
    }

    /// Name of the underlying estimator.
    pub fn estimator_name(&self) -> &str {
        self.estimator.name()
    }

    /// Extract features from `sample` and run the estimator.
    ///
    /// Deterministic for a deterministic estimator; the timestamp is taken
    /// from the sample's arrival time.
    pub fn process(&self, sample: &CsiSample) -> Result<CsiEstimate, EstimatorError> {
        let features = FeatureExtractor::new().extract(&sample.amplitudes_f64(), f64::from(sample.rssi));
        let prediction = self.estimator.predict(&features)?;
        Ok(CsiEstimate {
            features,
            count: prediction.count,
            confidence: prediction.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            timestamp: sample.received_at,
        })
    }
}

impl std::fmt::Debug for CsiPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsiPipeline")
            .field("estimator", &self.estimator.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wifi_occupancy_signal::FEATURE_VERSION;

    fn sample(amplitudes: Vec<i32>) -> CsiSample {
        CsiSample {
            device_timestamp: 1,
            rssi: -55,
            amplitudes,
            received_at: Utc::now(),
        }
    }

    fn model(weights: Vec<f64>, bias: f64) -> LinearModelFile {
        LinearModelFile {
            feature_version: FEATURE_VERSION,
            means: vec![0.0; FEATURE_COUNT],
            stds: vec![1.0; FEATURE_COUNT],
            weights,
            bias,
            confidence: None,
        }
    }

    #[test]
    fn baseline_all_zero_is_defined() {
        let pipeline = CsiPipeline::new(Arc::new(BaselineEstimator::default()));
        let est = pipeline.process(&sample(vec![0; 64])).unwrap();
        assert_eq!(est.count, 0.0);
        assert_eq!(est.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(est.features.get(Feature::EnergySum), 0.0);
        assert_eq!(est.features.get(Feature::Std), 0.0);
    }

    #[test]
    fn baseline_rises_with_variability() {
        let baseline = BaselineEstimator::default();
        let mut extractor = FeatureExtractor::new();
        let flat = extractor.extract(&[20.0; 64], -50.0);
        let busy: Vec<f64> = (0..64).map(|i| if i % 2 == 0 { 5.0 } else { 35.0 }).collect();
        let busy = extractor.extract(&busy, -50.0);

        let a = baseline.predict(&flat).unwrap().count;
        let b = baseline.predict(&busy).unwrap().count;
        assert_eq!(a, 0.0);
        assert!(b > a);
        assert!(b <= baseline.max_count);
    }

    #[test]
    fn estimate_is_deterministic() {
        let pipeline = CsiPipeline::new(Arc::new(BaselineEstimator::default()));
        let s = sample((0..64).map(|i| 10 + (i * 7) % 13).collect());
        assert_eq!(pipeline.process(&s).unwrap(), pipeline.process(&s).unwrap());
    }

    #[test]
    fn linear_model_predicts_from_subcarrier_count() {
        let mut weights = vec![0.0; FEATURE_COUNT];
        weights[Feature::SubcarrierCount.index()] = 0.05;
        let mut file = model(weights, 0.5);
        file.confidence = Some(0.9);
        let est = LinearEstimator::from_model(file).unwrap();

        let v = FeatureExtractor::new().extract(&[1.0; 40], -60.0);
        let p = est.predict(&v).unwrap();
        assert!((p.count - 2.5).abs() < 1e-12);
        assert_eq!(p.confidence, Some(0.9));
    }

    #[test]
    fn linear_model_clamps_negative_predictions() {
        let est = LinearEstimator::from_model(model(vec![0.0; FEATURE_COUNT], -3.0)).unwrap();
        let p = est.predict(&FeatureVector::zeros()).unwrap();
        assert_eq!(p.count, 0.0);
    }

    #[test]
    fn incompatible_models_rejected() {
        let short = model(vec![0.0; 5], 0.0);
        assert!(matches!(
            LinearEstimator::from_model(short),
            Err(EstimatorError::Incompatible(_))
        ));

        let mut wrong_version = model(vec![0.0; FEATURE_COUNT], 0.0);
        wrong_version.feature_version = FEATURE_VERSION + 1;
        assert!(matches!(
            LinearEstimator::from_model(wrong_version),
            Err(EstimatorError::Incompatible(_))
        ));
    }

    #[test]
    fn load_falls_back_to_baseline() {
        assert_eq!(load_estimator(None).name(), "baseline");
        assert_eq!(load_estimator(Some(Path::new("/no/such/model.json"))).name(), "baseline");

        let tmp = tempdir().unwrap();
        let path = tmp.path().join("model.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_estimator(Some(&path)).name(), "baseline");

        let good = model(vec![0.0; FEATURE_COUNT], 1.0);
        std::fs::write(&path, serde_json::to_string(&good).unwrap()).unwrap();
        assert_eq!(load_estimator(Some(&path)).name(), "linear");
    }
}
