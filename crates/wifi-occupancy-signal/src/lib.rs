//! WiFi-Occupancy Signal Processing Library
//!
//! Feature extraction for CSI (Channel State Information) amplitude snapshots
//! reported by ESP32 sensor nodes. The output is a fixed-length, versioned
//! feature vector consumed by the occupancy estimators in the server crate
//! and by offline model training.
//!
//! ## Example
//!
//! ```rust
//! use wifi_occupancy_signal::prelude::*;
//!
//! let mut extractor = FeatureExtractor::new();
//! let amplitudes = vec![12.0, 15.5, 9.0, 22.0, 18.5, 11.0, 13.0, 17.0];
//! let features = extractor.extract(&amplitudes, -52.0);
//!
//! assert_eq!(features.len(), FEATURE_COUNT);
//! assert_eq!(features.get(Feature::SubcarrierCount), 8.0);
//! ```

#![warn(missing_docs)]

pub mod features;

pub use features::{
    percentile, segment_variances, AmplitudeStatistics, EnergyFeatures, Feature,
    FeatureExtractor, FeatureLayout, FeatureVector, SpectrumSummary, FEATURE_COUNT,
    FEATURE_VERSION, MIN_SPECTRUM_LEN, SEGMENT_COUNT,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common result type for signal processing operations
pub type Result<T> = std::result::Result<T, SignalError>;

/// Unified error type for signal processing operations
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// A feature slice did not match the layout length
    #[error("Feature length mismatch: expected {expected}, got {actual}")]
    FeatureLength {
        /// Expected number of features
        expected: usize,
        /// Actual number of features
        actual: usize,
    },

    /// A model or sample was produced for a different layout version
    #[error("Unsupported feature version: {version} (this build produces {current})")]
    UnsupportedVersion {
        /// Version found in the input
        version: u32,
        /// Version produced by this build
        current: u32,
    },
}

impl SignalError {
    /// Check a layout version against the one this build produces.
    pub fn check_version(version: u32) -> Result<()> {
        if version == FEATURE_VERSION {
            Ok(())
        } else {
            Err(SignalError::UnsupportedVersion {
                version,
                current: FEATURE_VERSION,
            })
        }
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::features::{
        Feature, FeatureExtractor, FeatureLayout, FeatureVector, FEATURE_COUNT, FEATURE_VERSION,
    };
    pub use crate::{Result, SignalError};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_check_version() {
        assert!(SignalError::check_version(FEATURE_VERSION).is_ok());
        assert!(matches!(
            SignalError::check_version(FEATURE_VERSION + 1),
            Err(SignalError::UnsupportedVersion { .. })
        ));
    }
}
