//! Axum request handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::dto::*;
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::fusion::FusionWeights;
use crate::protocol::CameraControl;
use crate::snapshot::{LiveSnapshot, Lookup};

/// Default page size for `GET /api/v1/csi/buffer`.
const DEFAULT_BUFFER_LIMIT: usize = 100;

fn live_snapshot(state: &AppState, device_id: &str) -> ApiResult<Arc<LiveSnapshot>> {
    match state.cache().get(device_id) {
        Lookup::Live(snapshot) => Ok(snapshot),
        Lookup::Expired { expired_at } => Err(ApiError::DeviceExpired {
            device_id: device_id.to_string(),
            expired_at,
        }),
        Lookup::Unknown => Err(ApiError::device_unknown(device_id)),
    }
}

fn selected_device(state: &AppState, query: DeviceQuery) -> String {
    query
        .device_id
        .unwrap_or_else(|| state.config().default_device_id.clone())
}

// ============================================================================
// Health
// ============================================================================

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
        devices_connected: state.cache().connected_count(),
        sessions: state.session_count(),
        detector: state.detection().detector_name().to_string(),
        estimator: state.csi().estimator_name().to_string(),
        training_pending: state.training().pending_len(),
        workers: vec![state.detection_pool().into(), state.csi_pool().into()],
    })
}

// ============================================================================
// Devices
// ============================================================================

/// `GET /api/v1/devices`
///
/// Connected devices and devices still inside their grace window.
pub async fn list_devices(State(state): State<AppState>) -> Json<DeviceListResponse> {
    let devices: Vec<DeviceSummary> = state
        .cache()
        .list()
        .into_iter()
        .map(|snap| {
            let session = state
                .session(&snap.device_id)
                .filter(|s| s.id() == snap.session_id)
                .map(|s| SessionInfo::from(s.as_ref()));
            DeviceSummary {
                device_id: snap.device_id.clone(),
                connected: snap.connected,
                people_count: snap.people_count(),
                fused_count: snap.fusion.fused_count,
                no_data: snap.fusion.no_data,
                version: snap.version,
                updated_at: snap.updated_at,
                disconnected_at: snap.disconnected_at,
                session,
            }
        })
        .collect();
    let total = devices.len();
    Json(DeviceListResponse { devices, total })
}

/// `GET /api/v1/devices/:device_id/snapshot`
///
/// 404 for unknown devices, 410 once the grace window has elapsed.
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<SnapshotResponse>> {
    let snapshot = live_snapshot(&state, &device_id)?;
    Ok(Json(SnapshotResponse {
        success: true,
        snapshot: SnapshotDto::from_snapshot(&snapshot, true),
    }))
}

/// `POST /api/v1/devices/:device_id/camera`
///
/// Relay a camera-control command to the device's open session. The device
/// confirms asynchronously with a `status` reply.
pub async fn send_camera_control(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(control): Json<CameraControl>,
) -> ApiResult<Json<CameraControlResponse>> {
    control.validate()?;
    let session = state
        .session(&device_id)
        .ok_or_else(|| ApiError::device_not_connected(&device_id))?;
    session.send_control(control)?;
    tracing::info!(device_id = %device_id, ?control, "Relayed camera settings");

    Ok(Json(CameraControlResponse {
        success: true,
        message: "Camera parameters sent".to_string(),
        device_id,
        settings: session.camera_settings(),
    }))
}

/// `GET /api/v1/stream/frame`
pub async fn stream_frame(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<StreamFrameResponse>> {
    let device_id = selected_device(&state, query);
    let snapshot = live_snapshot(&state, &device_id)?;
    Ok(Json(StreamFrameResponse {
        success: true,
        frame_base64: snapshot.frame.as_ref().map(|f| STANDARD.encode(f)),
        people_count: snapshot.people_count(),
        detections: snapshot.detections.clone(),
        timestamp: snapshot.updated_at,
        camera_id: snapshot.device_id.clone(),
        connected: snapshot.connected,
    }))
}

/// `GET /api/v1/count/latest`
pub async fn latest_count(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<LatestCountResponse>> {
    let device_id = selected_device(&state, query);
    let snapshot = live_snapshot(&state, &device_id)?;
    Ok(Json(LatestCountResponse {
        success: true,
        people_count: snapshot.people_count(),
        fused_count: snapshot.fusion.fused_count,
        camera_count: snapshot.fusion.camera_count,
        csi_count: snapshot.fusion.csi_count,
        detections: snapshot.detections.clone(),
        timestamp: snapshot.fusion.timestamp,
        camera_id: snapshot.device_id.clone(),
        connected: snapshot.connected,
    }))
}

// ============================================================================
// CSI training data
// ============================================================================

/// `GET /api/v1/csi/stats`
pub async fn csi_stats(State(state): State<AppState>) -> Json<CsiStatsResponse> {
    Json(CsiStatsResponse {
        stats: state.training().stats(),
        estimator: state.csi().estimator_name().to_string(),
    })
}

/// `GET /api/v1/csi/buffer?limit=N`
pub async fn csi_buffer(
    State(state): State<AppState>,
    Query(query): Query<BufferQuery>,
) -> Json<BufferResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_BUFFER_LIMIT);
    let training = state.training();
    Json(BufferResponse {
        success: true,
        data: training.recent(limit),
        total_in_buffer: training.stats().buffer_size,
    })
}

/// `DELETE /api/v1/csi/buffer`
///
/// Clears the in-memory window only; the training file is untouched.
pub async fn clear_csi_buffer(State(state): State<AppState>) -> Json<ClearBufferResponse> {
    let cleared = state.training().clear_recent();
    tracing::info!(cleared, "Cleared CSI buffer");
    Json(ClearBufferResponse {
        success: true,
        message: format!("Cleared {cleared} records from buffer"),
    })
}

/// `GET /api/v1/csi/training-data`
pub async fn training_data(State(state): State<AppState>) -> ApiResult<Json<TrainingDataResponse>> {
    let training = state.training().clone();
    let info = tokio::task::spawn_blocking(move || training.file_info())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(TrainingDataResponse { success: true, info }))
}

// ============================================================================
// Fusion
// ============================================================================

/// `GET /api/v1/fusion/weights`
pub async fn get_weights(State(state): State<AppState>) -> Json<WeightsResponse> {
    let weights = *state.weights().read();
    Json(weights.into())
}

/// `PUT /api/v1/fusion/weights`
///
/// Takes effect on the next fusion of every session.
pub async fn put_weights(
    State(state): State<AppState>,
    Json(request): Json<WeightsRequest>,
) -> ApiResult<Json<WeightsResponse>> {
    let weights = FusionWeights::new(request.camera_weight)
        .map_err(|e| ApiError::validation(e, Some("camera_weight".to_string())))?;
    *state.weights().write() = weights;
    tracing::info!(camera = weights.camera(), csi = weights.csi(), "Fusion weights updated");
    Ok(Json(weights.into()))
}
