//! HTTP and WebSocket surface of the edge server.
//!
//! ## Endpoints
//!
//! ### Devices
//! - `WS /` or `WS /ws/device?device_id=...` - ESP32 ingest
//! - `GET /api/v1/devices` - Connected and recently disconnected devices
//! - `GET /api/v1/devices/{id}/snapshot` - Latest snapshot with frame
//! - `POST /api/v1/devices/{id}/camera` - Relay camera settings
//!
//! ### Dashboard
//! - `GET /api/v1/stream/frame` - Latest annotated frame
//! - `GET /api/v1/count/latest` - Latest fused count
//! - `WS /ws/live` - Snapshot stream
//!
//! ### CSI training data
//! - `GET /api/v1/csi/stats`
//! - `GET /api/v1/csi/buffer`, `DELETE /api/v1/csi/buffer`
//! - `GET /api/v1/csi/training-data`
//!
//! ### Fusion
//! - `GET /api/v1/fusion/weights`, `PUT /api/v1/fusion/weights`

pub mod dto;
pub mod error;
pub mod handlers;
pub mod state;
pub mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use dto::*;
pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// Create the router with all endpoints.
///
/// # Example
///
/// ```rust,no_run
/// use wifi_occupancy_server::api::{create_router, AppState};
/// use wifi_occupancy_server::config::ServerConfig;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = ServerConfig::default();
///     let listener = tokio::net::TcpListener::bind(config.bind).await?;
///     let app = create_router(AppState::from_config(config)?);
///     axum::serve(listener, app).await?;
///     Ok(())
/// }
/// ```
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Device ingest
        .route("/", get(websocket::device_ws_handler))
        .route("/ws/device", get(websocket::device_ws_handler))
        // Devices
        .route("/api/v1/devices", get(handlers::list_devices))
        .route("/api/v1/devices/:device_id/snapshot", get(handlers::get_snapshot))
        .route("/api/v1/devices/:device_id/camera", post(handlers::send_camera_control))
        // Dashboard
        .route("/api/v1/stream/frame", get(handlers::stream_frame))
        .route("/api/v1/count/latest", get(handlers::latest_count))
        .route("/ws/live", get(websocket::live_ws_handler))
        // CSI training data
        .route("/api/v1/csi/stats", get(handlers::csi_stats))
        .route(
            "/api/v1/csi/buffer",
            get(handlers::csi_buffer).delete(handlers::clear_csi_buffer),
        )
        .route("/api/v1/csi/training-data", get(handlers::training_data))
        // Fusion
        .route(
            "/api/v1/fusion/weights",
            get(handlers::get_weights).put(handlers::put_weights),
        )
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
