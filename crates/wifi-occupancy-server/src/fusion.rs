//! Fusion of the camera and CSI occupancy estimates.
//!
//! The two sources arrive at unrelated rates, so fusion never waits for a
//! pair: every update from either side recombines the most recent value of
//! each. The policy is a fixed linear blend
//!
//! ```text
//! fused = camera_weight * camera_count + csi_weight * csi_count
//! ```
//!
//! with `camera_weight + csi_weight == 1`. When only one source has a value
//! the weights recorded in the result are renormalised to `1.0 / 0.0` so the
//! formula still holds exactly (the absent count contributes zero). When
//! neither has a value the result carries `no_data = true` and a zero count.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Weights shared by all sessions and updatable at runtime.
pub type SharedWeights = Arc<RwLock<FusionWeights>>;

/// Camera/CSI blend weights. Always sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WeightsRepr")]
pub struct FusionWeights {
    camera_weight: f64,
    csi_weight: f64,
}

#[derive(Deserialize)]
struct WeightsRepr {
    camera_weight: f64,
}

impl TryFrom<WeightsRepr> for FusionWeights {
    type Error = String;

    fn try_from(repr: WeightsRepr) -> Result<Self, Self::Error> {
        FusionWeights::new(repr.camera_weight)
    }
}

impl FusionWeights {
    /// Build weights from the camera share; the CSI share is the remainder.
    pub fn new(camera_weight: f64) -> Result<Self, String> {
        if !camera_weight.is_finite() || !(0.0..=1.0).contains(&camera_weight) {
            return Err(format!("camera weight {camera_weight} not in [0, 1]"));
        }
        Ok(Self {
            camera_weight,
            csi_weight: 1.0 - camera_weight,
        })
    }

    /// Camera share.
    pub fn camera(&self) -> f64 {
        self.camera_weight
    }

    /// CSI share.
    pub fn csi(&self) -> f64 {
        self.csi_weight
    }

    /// Wrap for sharing across sessions.
    pub fn shared(self) -> SharedWeights {
        Arc::new(RwLock::new(self))
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            camera_weight: 0.8,
            csi_weight: 0.2,
        }
    }
}

/// Which source triggered a fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Camera person count
    Camera,
    /// CSI estimate
    Csi,
}

/// Most recent value from one source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceReading {
    /// Count estimate
    pub count: f64,
    /// Source confidence in [0, 1]
    pub confidence: f64,
    /// When the value was produced
    pub timestamp: DateTime<Utc>,
}

/// One fusion outcome. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionResult {
    /// Camera count used, if any
    pub camera_count: Option<f64>,
    /// CSI count used, if any
    pub csi_count: Option<f64>,
    /// Blended count
    pub fused_count: f64,
    /// Effective camera weight
    pub camera_weight: f64,
    /// Effective CSI weight
    pub csi_weight: f64,
    /// Neither source contributed
    pub no_data: bool,
    /// Camera confidence, if a camera value was used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_confidence: Option<f64>,
    /// CSI confidence, if a CSI value was used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csi_confidence: Option<f64>,
    /// Update that caused this fusion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Source>,
    /// Computation time
    pub timestamp: DateTime<Utc>,
}

impl FusionResult {
    /// Fused count rounded to a whole number of people.
    pub fn people_count(&self) -> u32 {
        self.fused_count.max(0.0).round() as u32
    }
}

/// Combine two optional readings under `weights`.
pub fn fuse(
    camera: Option<&SourceReading>,
    csi: Option<&SourceReading>,
    weights: FusionWeights,
    now: DateTime<Utc>,
) -> FusionResult {
    let (camera_weight, csi_weight) = match (camera, csi) {
        (Some(_), Some(_)) => (weights.camera(), weights.csi()),
        (Some(_), None) => (1.0, 0.0),
        (None, Some(_)) => (0.0, 1.0),
        (None, None) => (weights.camera(), weights.csi()),
    };

    let camera_count = camera.map(|r| r.count);
    let csi_count = csi.map(|r| r.count);
    let fused_count =
        camera_weight * camera_count.unwrap_or(0.0) + csi_weight * csi_count.unwrap_or(0.0);

    FusionResult {
        camera_count,
        csi_count,
        fused_count,
        camera_weight,
        csi_weight,
        no_data: camera.is_none() && csi.is_none(),
        camera_confidence: camera.map(|r| r.confidence),
        csi_confidence: csi.map(|r| r.confidence),
        trigger: None,
        timestamp: now,
    }
}

/// Per-session fusion state: the latest reading from each source.
#[derive(Debug)]
pub struct FusionEngine {
    weights: SharedWeights,
    max_staleness: Option<Duration>,
    camera: Option<SourceReading>,
    csi: Option<SourceReading>,
}

impl FusionEngine {
    /// Create an engine reading its weights from `weights` on every fusion.
    pub fn new(weights: SharedWeights, max_staleness: Option<Duration>) -> Self {
        Self {
            weights,
            max_staleness,
            camera: None,
            csi: None,
        }
    }

    /// Record a camera count and recompute.
    pub fn update_camera(&mut self, reading: SourceReading) -> FusionResult {
        self.camera = Some(reading);
        let mut result = self.fuse_at(reading.timestamp.max(Utc::now()));
        result.trigger = Some(Source::Camera);
        result
    }

    /// Record a CSI count and recompute.
    pub fn update_csi(&mut self, reading: SourceReading) -> FusionResult {
        self.csi = Some(reading);
        let mut result = self.fuse_at(reading.timestamp.max(Utc::now()));
        result.trigger = Some(Source::Csi);
        result
    }

    /// Recompute at `now` without a new reading.
    pub fn fuse_at(&self, now: DateTime<Utc>) -> FusionResult {
        let weights = *self.weights.read();
        fuse(
            self.fresh(self.camera.as_ref(), now),
            self.fresh(self.csi.as_ref(), now),
            weights,
            now,
        )
    }

    /// Latest camera reading regardless of staleness (training pseudo-label).
    pub fn latest_camera(&self) -> Option<&SourceReading> {
        self.camera.as_ref()
    }

    fn fresh<'a>(&self, reading: Option<&'a SourceReading>, now: DateTime<Utc>) -> Option<&'a SourceReading> {
        let reading = reading?;
        match self.max_staleness {
            Some(max) => {
                let age = (now - reading.timestamp).to_std().unwrap_or(Duration::ZERO);
                (age <= max).then_some(reading)
            }
            None => Some(reading),
        }
    }
}
