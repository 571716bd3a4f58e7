//! Request and response types for the HTTP and live-feed endpoints.
//!
//! Field names follow the JSON the dashboard and the central backend
//! already consume (`camera_id`, `frame_base64`, `total_in_buffer`, ...).

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detection::Detection;
use crate::fusion::{FusionResult, FusionWeights};
use crate::pool::WorkerPool;
use crate::protocol::CameraControl;
use crate::session::{Session, SessionState, SessionStatsSnapshot};
use crate::snapshot::LiveSnapshot;
use crate::training_log::{TrainingFileInfo, TrainingRecord, TrainingStats};

// ============================================================================
// Live feed
// ============================================================================

/// Event carried on the internal broadcast channel.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// A device snapshot changed
    Snapshot(Arc<LiveSnapshot>),
}

impl LiveEvent {
    pub fn from_snapshot(snapshot: &Arc<LiveSnapshot>) -> Self {
        Self::Snapshot(snapshot.clone())
    }
}

/// Message sent to `/ws/live` subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    /// Device snapshot update
    Snapshot(SnapshotDto),
    /// Keep-alive
    Heartbeat { timestamp: DateTime<Utc> },
    /// Feed-level error
    Error { code: String, message: String },
}

/// Query for `/ws/live`.
#[derive(Debug, Default, Deserialize)]
pub struct LiveQuery {
    /// Only stream this device
    pub device_id: Option<String>,
    /// Embed base64 frames in updates
    #[serde(default)]
    pub frames: bool,
}

// ============================================================================
// Snapshots
// ============================================================================

/// Serialized view of a [`LiveSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDto {
    pub device_id: String,
    /// Same as `device_id`; kept for dashboard compatibility
    pub camera_id: String,
    pub connected: bool,
    pub people_count: u32,
    pub fused_count: f64,
    pub detections: Vec<Detection>,
    pub timestamp: DateTime<Utc>,
    /// Annotated JPEG, base64
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    pub fusion: FusionResult,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl SnapshotDto {
    pub fn from_snapshot(snapshot: &LiveSnapshot, include_frame: bool) -> Self {
        Self {
            device_id: snapshot.device_id.clone(),
            camera_id: snapshot.device_id.clone(),
            connected: snapshot.connected,
            people_count: snapshot.people_count(),
            fused_count: snapshot.fusion.fused_count,
            detections: snapshot.detections.clone(),
            timestamp: snapshot.updated_at,
            frame: include_frame
                .then(|| snapshot.frame.as_ref().map(|f| STANDARD.encode(f)))
                .flatten(),
            fusion: snapshot.fusion.clone(),
            version: snapshot.version,
            disconnected_at: snapshot.disconnected_at,
        }
    }
}

/// `GET /api/v1/devices/:device_id/snapshot`
#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub success: bool,
    #[serde(flatten)]
    pub snapshot: SnapshotDto,
}

/// Query selecting a device; defaults to the configured device id.
#[derive(Debug, Default, Deserialize)]
pub struct DeviceQuery {
    pub device_id: Option<String>,
}

/// `GET /api/v1/stream/frame`
#[derive(Debug, Serialize)]
pub struct StreamFrameResponse {
    pub success: bool,
    pub frame_base64: Option<String>,
    pub people_count: u32,
    pub detections: Vec<Detection>,
    pub timestamp: DateTime<Utc>,
    pub camera_id: String,
    pub connected: bool,
}

/// `GET /api/v1/count/latest`
#[derive(Debug, Serialize)]
pub struct LatestCountResponse {
    pub success: bool,
    pub people_count: u32,
    pub fused_count: f64,
    pub camera_count: Option<f64>,
    pub csi_count: Option<f64>,
    pub detections: Vec<Detection>,
    pub timestamp: DateTime<Utc>,
    pub camera_id: String,
    pub connected: bool,
}

// ============================================================================
// Devices
// ============================================================================

/// Open-session details.
#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub camera_settings: CameraControl,
    pub stats: SessionStatsSnapshot,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id(),
            state: session.state(),
            connected_at: session.connected_at(),
            last_activity: session.last_activity(),
            camera_settings: session.camera_settings(),
            stats: session.stats(),
        }
    }
}

/// One row of `GET /api/v1/devices`.
#[derive(Debug, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub connected: bool,
    pub people_count: u32,
    pub fused_count: f64,
    pub no_data: bool,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

/// `GET /api/v1/devices`
#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceSummary>,
    pub total: usize,
}

/// `POST /api/v1/devices/:device_id/camera` response.
#[derive(Debug, Serialize)]
pub struct CameraControlResponse {
    pub success: bool,
    pub message: String,
    pub device_id: String,
    /// Settings after applying the command
    pub settings: CameraControl,
}

// ============================================================================
// CSI / training data
// ============================================================================

/// Query for `GET /api/v1/csi/buffer`.
#[derive(Debug, Default, Deserialize)]
pub struct BufferQuery {
    pub limit: Option<usize>,
}

/// `GET /api/v1/csi/buffer`
#[derive(Debug, Serialize)]
pub struct BufferResponse {
    pub success: bool,
    pub data: Vec<TrainingRecord>,
    pub total_in_buffer: usize,
}

/// `DELETE /api/v1/csi/buffer`
#[derive(Debug, Serialize)]
pub struct ClearBufferResponse {
    pub success: bool,
    pub message: String,
}

/// `GET /api/v1/csi/training-data`
#[derive(Debug, Serialize)]
pub struct TrainingDataResponse {
    pub success: bool,
    #[serde(flatten)]
    pub info: TrainingFileInfo,
}

/// `GET /api/v1/csi/stats`
#[derive(Debug, Serialize)]
pub struct CsiStatsResponse {
    #[serde(flatten)]
    pub stats: TrainingStats,
    pub estimator: String,
}

// ============================================================================
// Fusion weights
// ============================================================================

/// `PUT /api/v1/fusion/weights` body.
#[derive(Debug, Deserialize)]
pub struct WeightsRequest {
    pub camera_weight: f64,
}

/// Current fusion weights.
#[derive(Debug, Serialize)]
pub struct WeightsResponse {
    pub camera_weight: f64,
    pub csi_weight: f64,
}

impl From<FusionWeights> for WeightsResponse {
    fn from(w: FusionWeights) -> Self {
        Self {
            camera_weight: w.camera(),
            csi_weight: w.csi(),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub devices_connected: usize,
    pub sessions: usize,
    pub detector: String,
    pub estimator: String,
    pub training_pending: usize,
    pub workers: Vec<PoolStatus>,
}

/// Occupancy of one inference pool.
#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub name: &'static str,
    pub size: usize,
    pub available: usize,
}

impl From<&WorkerPool> for PoolStatus {
    fn from(pool: &WorkerPool) -> Self {
        Self {
            name: pool.name(),
            size: pool.size(),
            available: pool.available(),
        }
    }
}
