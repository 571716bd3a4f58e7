//! Server configuration.
//!
//! [`ServerConfig`] holds every tunable of the fusion server. It is
//! serializable via [`serde`] so a deployment can keep it in a JSON file;
//! missing fields fall back to [`Default`]. Command-line flags (see
//! `main.rs`) override individual fields after loading.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fusion::FusionWeights;
use crate::protocol::CameraControl;

/// Complete configuration for one server process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // ── Network ───────────────────────────────────────────────────────────
    /// Listen address for the device WebSocket and the HTTP API.
    pub bind: SocketAddr,
    /// Device id used when a device connects without `?device_id=`.
    pub default_device_id: String,

    // ── Sessions ──────────────────────────────────────────────────────────
    /// Close a session after this many seconds without a message.
    pub idle_timeout_secs: u64,
    /// Keep a disconnected device's snapshot this long before expiring it.
    pub grace_period_secs: u64,
    /// Settings sent to every device on connect.
    pub camera_settings: CameraControl,
    /// Upper bound on amplitudes per CSI sample.
    pub max_subcarriers: usize,

    // ── Detection ─────────────────────────────────────────────────────────
    /// Minimum detector confidence for a detection to be kept.
    pub confidence_threshold: f32,
    /// JPEG quality of annotated frames (1-100).
    pub jpeg_quality: u8,
    /// Optional ONNX detector model (requires the `onnx` feature).
    pub detector_model: Option<PathBuf>,
    /// Concurrent detection inferences across all sessions.
    pub detection_workers: usize,

    // ── CSI ───────────────────────────────────────────────────────────────
    /// Optional trained estimator model (JSON).
    pub csi_model: Option<PathBuf>,
    /// Concurrent CSI estimations across all sessions.
    pub csi_workers: usize,

    // ── Fusion ────────────────────────────────────────────────────────────
    /// Weight of the camera count; the CSI weight is `1 - camera_weight`.
    pub camera_weight: f64,
    /// Ignore a source whose last value is older than this.
    pub max_staleness_ms: Option<u64>,

    // ── Training log ──────────────────────────────────────────────────────
    /// Append-only JSONL training log.
    pub training_log: PathBuf,
    /// Maximum samples held in memory while the log is unwritable.
    pub training_buffer_capacity: usize,
    /// Delay between write retries.
    pub training_retry_ms: u64,
    /// Number of recent samples kept for stats and the buffer endpoint.
    pub stats_window: usize,

    // ── Backend push ──────────────────────────────────────────────────────
    /// Base URL of the backend; push is disabled when unset.
    pub backend_url: Option<String>,
    /// Minimum interval between pushes for one device.
    pub push_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            default_device_id: "esp32_cam".to_string(),
            idle_timeout_secs: 30,
            grace_period_secs: 60,
            camera_settings: CameraControl::handshake_default(),
            max_subcarriers: 1024,
            confidence_threshold: 0.25,
            jpeg_quality: 85,
            detector_model: None,
            detection_workers: 2,
            csi_model: None,
            csi_workers: 2,
            camera_weight: 0.8,
            max_staleness_ms: None,
            training_log: PathBuf::from("csi_data/training_data.jsonl"),
            training_buffer_capacity: 1000,
            training_retry_ms: 1000,
            stats_window: 1000,
            backend_url: None,
            push_interval_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Load and validate a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileRead`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON for this struct, and
    /// any error from [`ServerConfig::validate`].
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: ServerConfig = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write this configuration as pretty-printed JSON, creating parent
    /// directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_device_id.trim().is_empty() {
            return Err(ConfigError::invalid_value("default_device_id", "must not be empty"));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::invalid_value("idle_timeout_secs", "must be > 0"));
        }
        if self.grace_period_secs == 0 {
            return Err(ConfigError::invalid_value("grace_period_secs", "must be > 0"));
        }
        if self.max_subcarriers == 0 {
            return Err(ConfigError::invalid_value("max_subcarriers", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::invalid_value(
                "confidence_threshold",
                format!("{} not in [0, 1]", self.confidence_threshold),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::invalid_value(
                "jpeg_quality",
                format!("{} not in 1..=100", self.jpeg_quality),
            ));
        }
        if self.detection_workers == 0 {
            return Err(ConfigError::invalid_value("detection_workers", "must be > 0"));
        }
        if self.csi_workers == 0 {
            return Err(ConfigError::invalid_value("csi_workers", "must be > 0"));
        }
        FusionWeights::new(self.camera_weight)
            .map_err(|e| ConfigError::invalid_value("camera_weight", e))?;
        if self.max_staleness_ms == Some(0) {
            return Err(ConfigError::invalid_value("max_staleness_ms", "must be > 0 when set"));
        }
        if self.training_buffer_capacity == 0 {
            return Err(ConfigError::invalid_value("training_buffer_capacity", "must be > 0"));
        }
        if self.training_retry_ms == 0 {
            return Err(ConfigError::invalid_value("training_retry_ms", "must be > 0"));
        }
        if self.stats_window == 0 {
            return Err(ConfigError::invalid_value("stats_window", "must be > 0"));
        }
        if self.push_interval_ms == 0 {
            return Err(ConfigError::invalid_value("push_interval_ms", "must be > 0"));
        }
        if let Some(url) = &self.backend_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::invalid_value(
                    "backend_url",
                    format!("'{url}' is not an http(s) URL"),
                ));
            }
        }
        self.camera_settings
            .validate()
            .map_err(|e| ConfigError::invalid_value("camera_settings", e.to_string()))?;
        Ok(())
    }

    /// Idle window as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Disconnected-snapshot retention as a [`Duration`].
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Push rate limit as a [`Duration`].
    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }

    /// Initial fusion weights.
    pub fn fusion_weights(&self) -> Result<FusionWeights, ConfigError> {
        FusionWeights::new(self.camera_weight).map_err(|e| ConfigError::invalid_value("camera_weight", e))
    }
}
