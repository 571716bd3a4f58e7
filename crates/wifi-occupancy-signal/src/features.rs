//! Feature Extraction Module
//!
//! Turns a single CSI amplitude snapshot (one value per subcarrier) plus the
//! frame's RSSI into a fixed-length feature vector for occupancy estimation.
//!
//! The vector layout is a versioned contract: trained estimator models and
//! logged training samples both depend on the exact order and count of the
//! features below. Any change to the layout must bump [`FEATURE_VERSION`].
//!
//! | index | feature | family |
//! |-------|---------|--------|
//! | 0-5   | mean, std, min, max, median, range | central tendency / spread |
//! | 6-7   | q25, q75 | quartiles |
//! | 8-9   | skewness, excess kurtosis | shape |
//! | 10-11 | energy sum, energy mean | energy |
//! | 12-15 | segment variance 1..4 | spread per subcarrier band |
//! | 16-17 | spectrum mean, spectrum max | DFT magnitude summary |
//! | 18    | rssi | scalar |
//! | 19    | subcarrier count | normalisation |

use num_complex::Complex64;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::SignalError;

/// Version of the feature-vector layout.
pub const FEATURE_VERSION: u32 = 1;

/// Number of features in a [`FeatureVector`].
pub const FEATURE_COUNT: usize = 20;

/// Number of contiguous subcarrier segments used for segment variances.
pub const SEGMENT_COUNT: usize = 4;

/// Minimum amplitude count before the spectrum summary is computed.
pub const MIN_SPECTRUM_LEN: usize = 8;

/// One named slot of the feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Mean amplitude
    Mean,
    /// Population standard deviation
    Std,
    /// Smallest amplitude
    Min,
    /// Largest amplitude
    Max,
    /// Median amplitude
    Median,
    /// `max - min`
    Range,
    /// 25th percentile
    Q25,
    /// 75th percentile
    Q75,
    /// Sample skewness
    Skewness,
    /// Excess kurtosis
    Kurtosis,
    /// Sum of squared amplitudes
    EnergySum,
    /// Mean of squared amplitudes
    EnergyMean,
    /// Variance of the first segment
    SegmentVar1,
    /// Variance of the second segment
    SegmentVar2,
    /// Variance of the third segment
    SegmentVar3,
    /// Variance of the fourth segment
    SegmentVar4,
    /// Mean DFT magnitude over the first half of the spectrum
    SpectrumMean,
    /// Largest DFT magnitude over the first half of the spectrum
    SpectrumMax,
    /// Received signal strength, dBm
    Rssi,
    /// Number of amplitudes in the sample
    SubcarrierCount,
}

impl Feature {
    /// All features in vector order.
    pub const ALL: [Feature; FEATURE_COUNT] = [
        Feature::Mean,
        Feature::Std,
        Feature::Min,
        Feature::Max,
        Feature::Median,
        Feature::Range,
        Feature::Q25,
        Feature::Q75,
        Feature::Skewness,
        Feature::Kurtosis,
        Feature::EnergySum,
        Feature::EnergyMean,
        Feature::SegmentVar1,
        Feature::SegmentVar2,
        Feature::SegmentVar3,
        Feature::SegmentVar4,
        Feature::SpectrumMean,
        Feature::SpectrumMax,
        Feature::Rssi,
        Feature::SubcarrierCount,
    ];

    /// Position of this feature in the vector.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable name used in model files and logs.
    pub fn name(self) -> &'static str {
        match self {
            Feature::Mean => "mean",
            Feature::Std => "std",
            Feature::Min => "min",
            Feature::Max => "max",
            Feature::Median => "median",
            Feature::Range => "range",
            Feature::Q25 => "q25",
            Feature::Q75 => "q75",
            Feature::Skewness => "skew",
            Feature::Kurtosis => "kurt",
            Feature::EnergySum => "energy_sum",
            Feature::EnergyMean => "energy_mean",
            Feature::SegmentVar1 => "var_seg1",
            Feature::SegmentVar2 => "var_seg2",
            Feature::SegmentVar3 => "var_seg3",
            Feature::SegmentVar4 => "var_seg4",
            Feature::SpectrumMean => "fft_mean",
            Feature::SpectrumMax => "fft_max",
            Feature::Rssi => "rssi",
            Feature::SubcarrierCount => "n_subcarriers",
        }
    }
}

/// Description of the vector layout, exposed to model loaders and the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLayout {
    /// Layout version
    pub version: u32,
    /// Number of features
    pub count: usize,
    /// Feature names in vector order
    pub names: Vec<String>,
}

impl FeatureLayout {
    /// The layout produced by this build.
    pub fn current() -> Self {
        Self {
            version: FEATURE_VERSION,
            count: FEATURE_COUNT,
            names: Feature::ALL.iter().map(|f| f.name().to_string()).collect(),
        }
    }
}

/// Fixed-length feature vector produced by [`FeatureExtractor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: [f64; FEATURE_COUNT],
}

impl FeatureVector {
    /// All-zero vector.
    pub fn zeros() -> Self {
        Self {
            values: [0.0; FEATURE_COUNT],
        }
    }

    /// Build a vector from a slice, checking the length against the contract.
    pub fn from_slice(values: &[f64]) -> Result<Self, SignalError> {
        let values: [f64; FEATURE_COUNT] =
            values
                .try_into()
                .map_err(|_| SignalError::FeatureLength {
                    expected: FEATURE_COUNT,
                    actual: values.len(),
                })?;
        Ok(Self { values })
    }

    /// Value of a single feature.
    pub fn get(&self, feature: Feature) -> f64 {
        self.values[feature.index()]
    }

    fn set(&mut self, feature: Feature, value: f64) {
        self.values[feature.index()] = value;
    }

    /// Values in layout order.
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Number of features; always [`FEATURE_COUNT`].
    pub fn len(&self) -> usize {
        FEATURE_COUNT
    }

    /// Always `false`; present for API symmetry with slices.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `true` when no value is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::zeros()
    }
}

/// Central tendency, spread and shape of an amplitude array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AmplitudeStatistics {
    /// Arithmetic mean
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    /// Minimum value
    pub min: f64,
    /// Maximum value
    pub max: f64,
    /// 50th percentile
    pub median: f64,
    /// max - min
    pub range: f64,
    /// 25th percentile
    pub q25: f64,
    /// 75th percentile
    pub q75: f64,
    /// Third standardised moment
    pub skewness: f64,
    /// Fourth standardised moment minus 3
    pub kurtosis: f64,
}

impl AmplitudeStatistics {
    /// Compute statistics; an empty slice yields all zeros.
    pub fn from_amplitudes(amplitudes: &[f64]) -> Self {
        if amplitudes.is_empty() {
            return Self::default();
        }

        let n = amplitudes.len() as f64;
        let mean = amplitudes.iter().sum::<f64>() / n;
        let variance = amplitudes.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();

        let mut sorted = amplitudes.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];

        let (skewness, kurtosis) = if amplitudes.len() > 1 && std > 0.0 {
            let m3 = amplitudes
                .iter()
                .map(|a| ((a - mean) / std).powi(3))
                .sum::<f64>()
                / n;
            let m4 = amplitudes
                .iter()
                .map(|a| ((a - mean) / std).powi(4))
                .sum::<f64>()
                / n;
            (m3, m4 - 3.0)
        } else {
            (0.0, 0.0)
        };

        Self {
            mean,
            std,
            min,
            max,
            median: percentile(&sorted, 50.0),
            range: max - min,
            q25: percentile(&sorted, 25.0),
            q75: percentile(&sorted, 75.0),
            skewness,
            kurtosis,
        }
    }
}

/// Percentile of an ascending-sorted, non-empty slice using linear
/// interpolation between closest ranks.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let pos = (pct / 100.0).clamp(0.0, 1.0) * (len - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Sum and mean of squared amplitudes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyFeatures {
    /// Total energy
    pub sum: f64,
    /// Mean energy per subcarrier
    pub mean: f64,
}

impl EnergyFeatures {
    /// Compute energy features; an empty slice yields zeros.
    pub fn from_amplitudes(amplitudes: &[f64]) -> Self {
        if amplitudes.is_empty() {
            return Self::default();
        }
        let sum: f64 = amplitudes.iter().map(|a| a * a).sum();
        Self {
            sum,
            mean: sum / amplitudes.len() as f64,
        }
    }
}

/// Variance of each of [`SEGMENT_COUNT`] contiguous subcarrier segments.
///
/// Segments follow `array_split` semantics: the first `n % 4` segments are
/// one element longer than the rest.
pub fn segment_variances(amplitudes: &[f64]) -> [f64; SEGMENT_COUNT] {
    let mut out = [0.0; SEGMENT_COUNT];
    if amplitudes.len() < SEGMENT_COUNT {
        return out;
    }

    let base = amplitudes.len() / SEGMENT_COUNT;
    let extra = amplitudes.len() % SEGMENT_COUNT;
    let mut start = 0;
    for (i, slot) in out.iter_mut().enumerate() {
        let len = base + usize::from(i < extra);
        let segment = &amplitudes[start..start + len];
        start += len;

        let n = segment.len() as f64;
        let mean = segment.iter().sum::<f64>() / n;
        *slot = segment.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
    }
    out
}

/// Magnitude-spectrum summary over the positive half of the DFT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSummary {
    /// Mean magnitude of bins `0..n/2`
    pub mean_magnitude: f64,
    /// Peak magnitude of bins `0..n/2`
    pub peak_magnitude: f64,
}

impl SpectrumSummary {
    /// Compute the summary; fewer than [`MIN_SPECTRUM_LEN`] values yield zeros.
    pub fn from_amplitudes(amplitudes: &[f64], planner: &mut FftPlanner<f64>) -> Self {
        let n = amplitudes.len();
        if n < MIN_SPECTRUM_LEN {
            return Self::default();
        }

        let mut buffer: Vec<Complex64> = amplitudes
            .iter()
            .map(|&a| Complex64::new(a, 0.0))
            .collect();
        let fft = planner.plan_fft_forward(n);
        fft.process(&mut buffer);

        let half = &buffer[..n / 2];
        let magnitudes = half.iter().map(|c| c.norm());
        let (sum, peak) = magnitudes.fold((0.0, 0.0f64), |(s, p), m| (s + m, p.max(m)));

        Self {
            mean_magnitude: sum / half.len() as f64,
            peak_magnitude: peak,
        }
    }
}

/// Extracts [`FeatureVector`]s from CSI amplitude snapshots.
///
/// The extractor is stateless apart from the FFT planner cache, so one
/// instance per worker is enough. Extraction never fails: degenerate inputs
/// (empty, single value, constant) produce well-defined zeros instead of NaN.
pub struct FeatureExtractor {
    planner: FftPlanner<f64>,
}

impl FeatureExtractor {
    /// Create a new extractor.
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    /// The layout of vectors produced by [`FeatureExtractor::extract`].
    pub fn layout(&self) -> FeatureLayout {
        FeatureLayout::current()
    }

    /// Extract the feature vector for one amplitude snapshot.
    pub fn extract(&mut self, amplitudes: &[f64], rssi: f64) -> FeatureVector {
        let stats = AmplitudeStatistics::from_amplitudes(amplitudes);
        let energy = EnergyFeatures::from_amplitudes(amplitudes);
        let segments = segment_variances(amplitudes);
        let spectrum = SpectrumSummary::from_amplitudes(amplitudes, &mut self.planner);

        let mut v = FeatureVector::zeros();
        v.set(Feature::Mean, stats.mean);
        v.set(Feature::Std, stats.std);
        v.set(Feature::Min, stats.min);
        v.set(Feature::Max, stats.max);
        v.set(Feature::Median, stats.median);
        v.set(Feature::Range, stats.range);
        v.set(Feature::Q25, stats.q25);
        v.set(Feature::Q75, stats.q75);
        v.set(Feature::Skewness, stats.skewness);
        v.set(Feature::Kurtosis, stats.kurtosis);
        v.set(Feature::EnergySum, energy.sum);
        v.set(Feature::EnergyMean, energy.mean);
        v.set(Feature::SegmentVar1, segments[0]);
        v.set(Feature::SegmentVar2, segments[1]);
        v.set(Feature::SegmentVar3, segments[2]);
        v.set(Feature::SegmentVar4, segments[3]);
        v.set(Feature::SpectrumMean, spectrum.mean_magnitude);
        v.set(Feature::SpectrumMax, spectrum.peak_magnitude);
        v.set(Feature::Rssi, rssi);
        v.set(Feature::SubcarrierCount, amplitudes.len() as f64);
        v
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("version", &FEATURE_VERSION)
            .field("count", &FEATURE_COUNT)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_layout_matches_enum_order() {
        for (i, f) in Feature::ALL.iter().enumerate() {
            assert_eq!(f.index(), i);
        }
        let layout = FeatureLayout::current();
        assert_eq!(layout.count, FEATURE_COUNT);
        assert_eq!(layout.names.len(), FEATURE_COUNT);
        assert_eq!(layout.names[0], "mean");
        assert_eq!(layout.names[18], "rssi");
    }

    #[test]
    fn test_basic_statistics() {
        let stats = AmplitudeStatistics::from_amplitudes(&[1.0, 2.0, 3.0, 4.0]);
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.std, 1.25f64.sqrt());
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.q25, 1.75);
        assert_relative_eq!(stats.q75, 3.25);
        assert_relative_eq!(stats.range, 3.0);
        assert_relative_eq!(stats.skewness, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_input_has_zero_shape_moments() {
        let stats = AmplitudeStatistics::from_amplitudes(&[7.0; 16]);
        assert_eq!(stats.std, 0.0);
        assert_eq!(stats.skewness, 0.0);
        assert_eq!(stats.kurtosis, 0.0);
    }

    #[test]
    fn test_segment_variances_uneven_split() {
        // 6 values split as [2, 2, 1, 1]
        let v = segment_variances(&[0.0, 2.0, 4.0, 4.0, 9.0, 1.0]);
        assert_relative_eq!(v[0], 1.0);
        assert_relative_eq!(v[1], 0.0);
        assert_relative_eq!(v[2], 0.0);
        assert_relative_eq!(v[3], 0.0);
    }

    #[test]
    fn test_spectrum_dc_peak() {
        let mut planner = FftPlanner::new();
        let amps: Vec<f64> = (1..=8).map(f64::from).collect();
        let s = SpectrumSummary::from_amplitudes(&amps, &mut planner);
        assert_relative_eq!(s.peak_magnitude, 36.0, epsilon = 1e-9);
        assert!(s.mean_magnitude > 0.0);
    }

    #[test]
    fn test_short_input_skips_spectrum() {
        let mut planner = FftPlanner::new();
        let s = SpectrumSummary::from_amplitudes(&[1.0, 2.0, 3.0], &mut planner);
        assert_eq!(s, SpectrumSummary::default());
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        let err = FeatureVector::from_slice(&[0.0; 3]).unwrap_err();
        assert!(matches!(
            err,
            SignalError::FeatureLength { expected: FEATURE_COUNT, actual: 3 }
        ));
    }

    #[test]
    fn test_vector_serializes_as_plain_array() {
        let mut extractor = FeatureExtractor::new();
        let v = extractor.extract(&[1.0, 2.0, 3.0, 4.0], -50.0);
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.starts_with('['));
        let back: FeatureVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
