//! End-to-end tests: a real server on an ephemeral port, a device over
//! tokio-tungstenite and the HTTP API over reqwest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use wifi_occupancy_server::detection::{Detection, Detector, NullDetector};
use wifi_occupancy_server::error::{EstimatorError, InferenceError};
use wifi_occupancy_server::estimator::{CsiEstimator, Prediction};
use wifi_occupancy_server::{create_router, AppState, ServerConfig};
use wifi_occupancy_signal::FeatureVector;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

// ── Fixtures ─────────────────────────────────────────────────────────────────

/// Sees `n` people in every frame.
struct PeopleDetector(usize);

impl Detector for PeopleDetector {
    fn name(&self) -> &str {
        "people"
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
        let w = image.width() as f32;
        Ok((0..self.0)
            .map(|i| Detection {
                class_id: 0,
                class_name: "person".into(),
                confidence: 0.9,
                bbox: [i as f32 * 4.0, 4.0, (i as f32 * 4.0 + 8.0).min(w), 20.0],
            })
            .collect())
    }
}

/// Always predicts the same count.
struct FixedEstimator(f64);

impl CsiEstimator for FixedEstimator {
    fn name(&self) -> &str {
        "fixed"
    }

    fn predict(&self, _features: &FeatureVector) -> Result<Prediction, EstimatorError> {
        Ok(Prediction {
            count: self.0,
            confidence: Some(0.7),
        })
    }
}

struct Server {
    addr: SocketAddr,
    http: reqwest::Client,
    _dir: TempDir,
}

impl Server {
    async fn start(detector: Arc<dyn Detector>, csi_count: f64, tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            training_log: dir.path().join("training.jsonl"),
            ..ServerConfig::default()
        };
        tweak(&mut config);

        let state = AppState::new(config, detector, Arc::new(FixedEstimator(csi_count))).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });

        Self {
            addr,
            http: reqwest::Client::new(),
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Connect a device and consume the handshake.
    async fn device(&self, device_id: &str) -> (Ws, Value) {
        let url = format!("ws://{}/ws/device?device_id={}", self.addr, device_id);
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        let handshake = next_json(&mut ws).await;
        (ws, handshake)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.http.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    /// Poll `path` until `pred` holds for a 200 response.
    async fn poll(&self, path: &str, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let (status, body) = self.get(path).await;
            if status == 200 && pred(&body) {
                return body;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out polling {path}: {status} {body}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll `path` until it answers with `status`.
    async fn poll_status(&self, path: &str, status: u16) -> Value {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let (got, body) = self.get(path).await;
            if got == status {
                return body;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {status} on {path}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket closed")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]));
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 80).encode_image(&img).unwrap();
    out
}

fn csi_sample() -> String {
    let amplitudes: Vec<i32> = (0..64).map(|i| 10 + (i % 7)).collect();
    json!({"type": "csi", "timestamp": 1234, "rssi": -55, "amplitudes": amplitudes, "len": 64}).to_string()
}

// ── Session lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_sends_default_camera_settings() {
    let server = Server::start(Arc::new(NullDetector), 0.0, |_| {}).await;
    let (_ws, handshake) = server.device("cam1").await;
    assert_eq!(
        handshake,
        json!({"brightness": 1, "contrast": 1, "saturation": 1, "quality": 8})
    );

    let devices = server.poll("/api/v1/devices", |v| v["total"] == 1).await;
    let device = &devices["devices"][0];
    assert_eq!(device["device_id"], "cam1");
    assert_eq!(device["connected"], true);
    assert_eq!(device["no_data"], true);
    assert_eq!(device["session"]["state"], "active");
}

#[tokio::test]
async fn device_without_id_uses_default() {
    let server = Server::start(Arc::new(NullDetector), 0.0, |_| {}).await;
    let (_ws, _) = connect_async(format!("ws://{}/", server.addr).as_str()).await.unwrap();
    server
        .poll("/api/v1/devices", |v| v["devices"][0]["device_id"] == "esp32_cam")
        .await;
}

#[tokio::test]
async fn malformed_messages_are_acked_and_session_survives() {
    let server = Server::start(Arc::new(NullDetector), 0.0, |_| {}).await;
    let (mut ws, _) = server.device("cam1").await;

    ws.send(Message::Text("{oops".into())).await.unwrap();
    assert_eq!(
        next_json(&mut ws).await,
        json!({"status": "error", "message": "Invalid JSON payload"})
    );

    ws.send(Message::Text(r#"{"type":"csi","rssi":-50,"amplitudes":[]}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut ws).await["status"], "error");

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await, json!({"type": "pong"}));

    let devices = server
        .poll("/api/v1/devices", |v| v["devices"][0]["session"]["stats"]["protocol_errors"] == 2)
        .await;
    assert_eq!(devices["devices"][0]["connected"], true);
}

#[tokio::test]
async fn device_control_message_is_acked() {
    let server = Server::start(Arc::new(NullDetector), 0.0, |_| {}).await;
    let (mut ws, _) = server.device("cam1").await;

    ws.send(Message::Text(r#"{"brightness":2}"#.into())).await.unwrap();
    assert_eq!(
        next_json(&mut ws).await,
        json!({"status": "ok", "message": "Camera parameters updated"})
    );
}

#[tokio::test]
async fn disconnect_is_published_and_expires_after_grace() {
    let server = Server::start(Arc::new(NullDetector), 0.0, |c| c.grace_period_secs = 1).await;
    let (mut ws, _) = server.device("cam1").await;
    server.poll("/api/v1/devices/cam1/snapshot", |v| v["connected"] == true).await;

    ws.close(None).await.unwrap();
    let snap = server
        .poll("/api/v1/devices/cam1/snapshot", |v| v["connected"] == false)
        .await;
    assert!(snap["disconnected_at"].is_string());

    let gone = server.poll_status("/api/v1/devices/cam1/snapshot", 410).await;
    assert_eq!(gone["code"], "DEVICE_EXPIRED");
    server.poll("/api/v1/devices", |v| v["total"] == 0).await;
}

#[tokio::test]
async fn idle_devices_are_disconnected() {
    let server = Server::start(Arc::new(NullDetector), 0.0, |c| c.idle_timeout_secs = 1).await;
    let (_ws, _) = server.device("cam1").await;
    server
        .poll("/api/v1/devices/cam1/snapshot", |v| v["connected"] == false)
        .await;
}

#[tokio::test]
async fn unknown_device_is_404() {
    let server = Server::start(Arc::new(NullDetector), 0.0, |_| {}).await;
    let (status, body) = server.get("/api/v1/devices/nope/snapshot").await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "DEVICE_UNKNOWN");
    assert_eq!(body["success"], false);
}

// ── Fusion ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_scene_counts_zero_people() {
    let server = Server::start(Arc::new(NullDetector), 0.0, |_| {}).await;
    let (mut ws, _) = server.device("cam1").await;

    ws.send(Message::Binary(jpeg(64, 48))).await.unwrap();
    let latest = server
        .poll("/api/v1/count/latest?device_id=cam1", |v| v["camera_count"] == 0.0)
        .await;
    assert_eq!(latest["people_count"], 0);
    assert_eq!(latest["detections"], json!([]));
}

#[tokio::test]
async fn undecodable_frame_keeps_last_count() {
    let server = Server::start(Arc::new(PeopleDetector(1)), 0.0, |_| {}).await;
    let (mut ws, _) = server.device("cam1").await;

    ws.send(Message::Binary(jpeg(16, 16))).await.unwrap();
    server
        .poll("/api/v1/count/latest?device_id=cam1", |v| v["people_count"] == 1)
        .await;

    ws.send(Message::Binary(b"not a jpeg".to_vec())).await.unwrap();
    let devices = server
        .poll("/api/v1/devices", |v| v["devices"][0]["session"]["stats"]["decode_errors"] == 1)
        .await;
    assert_eq!(devices["devices"][0]["people_count"], 1);
    assert_eq!(devices["devices"][0]["connected"], true);
}

#[tokio::test]
async fn camera_only_count_uses_full_weight() {
    let server = Server::start(Arc::new(PeopleDetector(2)), 0.0, |_| {}).await;
    let (mut ws, _) = server.device("cam1").await;

    ws.send(Message::Binary(jpeg(64, 48))).await.unwrap();
    let latest = server
        .poll("/api/v1/count/latest?device_id=cam1", |v| v["people_count"] == 2)
        .await;
    assert_eq!(latest["camera_count"], 2.0);
    assert!(latest["csi_count"].is_null());
    assert_eq!(latest["fused_count"], 2.0);
    assert_eq!(latest["detections"].as_array().unwrap().len(), 2);

    let frame = server.get("/api/v1/stream/frame?device_id=cam1").await.1;
    assert!(frame["frame_base64"].as_str().is_some_and(|f| !f.is_empty()));
    assert_eq!(frame["camera_id"], "cam1");
}

#[tokio::test]
async fn camera_and_csi_are_fused_and_logged_for_training() {
    let server = Server::start(Arc::new(PeopleDetector(2)), 3.0, |_| {}).await;
    let (mut ws, _) = server.device("cam1").await;

    ws.send(Message::Binary(jpeg(64, 48))).await.unwrap();
    server
        .poll("/api/v1/count/latest?device_id=cam1", |v| v["camera_count"] == 2.0)
        .await;

    ws.send(Message::Text(csi_sample())).await.unwrap();
    let latest = server
        .poll("/api/v1/count/latest?device_id=cam1", |v| v["csi_count"] == 3.0)
        .await;
    let fused = latest["fused_count"].as_f64().unwrap();
    assert!((fused - 2.2).abs() < 1e-9, "fused {fused}");
    assert_eq!(latest["people_count"], 2);

    let buffer = server
        .poll("/api/v1/csi/buffer?limit=10", |v| v["total_in_buffer"] == 1)
        .await;
    let record = &buffer["data"][0];
    assert_eq!(record["people_count"], 2);
    assert_eq!(record["device_id"], "cam1");
    assert_eq!(record["rssi"], -55);
    assert_eq!(record["features"].as_array().unwrap().len(), 20);

    let stats = server.get("/api/v1/csi/stats").await.1;
    assert_eq!(stats["unique_people_counts"]["2"], 1);
    assert_eq!(stats["estimator"], "fixed");
}

#[tokio::test]
async fn csi_without_camera_is_not_logged() {
    let server = Server::start(Arc::new(NullDetector), 1.0, |_| {}).await;
    let (mut ws, _) = server.device("cam1").await;

    ws.send(Message::Text(csi_sample())).await.unwrap();
    let latest = server
        .poll("/api/v1/count/latest?device_id=cam1", |v| v["csi_count"] == 1.0)
        .await;
    assert_eq!(latest["fused_count"], 1.0);
    let buffer = server.get("/api/v1/csi/buffer").await.1;
    assert_eq!(buffer["total_in_buffer"], 0);
}

#[tokio::test]
async fn fusion_weights_can_be_changed_at_runtime() {
    let server = Server::start(Arc::new(PeopleDetector(4)), 0.0, |_| {}).await;

    let bad = server
        .http
        .put(server.url("/api/v1/fusion/weights"))
        .json(&json!({"camera_weight": 1.5}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status().as_u16(), 422);

    let ok: Value = server
        .http
        .put(server.url("/api/v1/fusion/weights"))
        .json(&json!({"camera_weight": 0.5}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok, json!({"camera_weight": 0.5, "csi_weight": 0.5}));

    let (mut ws, _) = server.device("cam1").await;
    let first = server
        .poll("/api/v1/devices/cam1/snapshot", |v| v["fusion"]["no_data"] == true)
        .await;
    assert_eq!(first["fusion"]["camera_weight"], 0.5);
    assert_eq!(first["fusion"]["csi_weight"], 0.5);
    assert_eq!(first["fused_count"], 0.0);

    ws.send(Message::Binary(jpeg(64, 48))).await.unwrap();
    server
        .poll("/api/v1/count/latest?device_id=cam1", |v| v["camera_count"] == 4.0)
        .await;
    ws.send(Message::Text(csi_sample())).await.unwrap();
    let latest = server
        .poll("/api/v1/count/latest?device_id=cam1", |v| v["csi_count"] == 0.0)
        .await;
    assert_eq!(latest["fused_count"], 2.0);
}

#[tokio::test]
async fn reconnect_keeps_last_frame() {
    let server = Server::start(Arc::new(PeopleDetector(1)), 0.0, |_| {}).await;
    let (mut ws, _) = server.device("cam1").await;
    ws.send(Message::Binary(jpeg(32, 32))).await.unwrap();
    server
        .poll("/api/v1/devices/cam1/snapshot", |v| v["frame"].is_string())
        .await;
    ws.close(None).await.unwrap();
    server
        .poll("/api/v1/devices/cam1/snapshot", |v| v["connected"] == false)
        .await;

    let (_ws, _) = server.device("cam1").await;
    let snap = server
        .poll("/api/v1/devices/cam1/snapshot", |v| v["connected"] == true)
        .await;
    assert!(snap["frame"].is_string());
    assert_eq!(snap["people_count"], 1);
}

// ── Camera relay and live feed ───────────────────────────────────────────────

#[tokio::test]
async fn camera_settings_are_relayed_to_the_device() {
    let server = Server::start(Arc::new(NullDetector), 0.0, |_| {}).await;
    let path = "/api/v1/devices/cam1/camera";

    let offline = server.http.post(server.url(path)).json(&json!({"quality": 10})).send().await.unwrap();
    assert_eq!(offline.status().as_u16(), 409);

    let (mut ws, _) = server.device("cam1").await;
    server.poll("/api/v1/devices", |v| v["total"] == 1).await;

    let invalid = server.http.post(server.url(path)).json(&json!({"quality": 99})).send().await.unwrap();
    assert_eq!(invalid.status().as_u16(), 422);

    let resp: Value = server
        .http
        .post(server.url(path))
        .json(&json!({"quality": 10}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);
    assert_eq!(resp["settings"]["quality"], 10);
    assert_eq!(resp["settings"]["brightness"], 1);

    assert_eq!(next_json(&mut ws).await, json!({"quality": 10}));
}

#[tokio::test]
async fn live_feed_streams_snapshots() {
    let server = Server::start(Arc::new(PeopleDetector(3)), 0.0, |_| {}).await;
    let (mut live, _) = connect_async(format!("ws://{}/ws/live?device_id=cam1", server.addr).as_str())
        .await
        .unwrap();

    let (mut ws, _) = server.device("cam1").await;
    let first = next_json(&mut live).await;
    assert_eq!(first["type"], "snapshot");
    assert_eq!(first["device_id"], "cam1");
    assert_eq!(first["connected"], true);

    ws.send(Message::Binary(jpeg(64, 48))).await.unwrap();
    loop {
        let msg = next_json(&mut live).await;
        if msg["people_count"] == 3 {
            assert!(msg.get("frame").is_none());
            break;
        }
    }
}

#[tokio::test]
async fn health_reports_components() {
    let server = Server::start(Arc::new(NullDetector), 0.0, |c| c.csi_workers = 3).await;
    let (status, health) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["detector"], "null");
    assert_eq!(health["estimator"], "fixed");
    assert_eq!(health["workers"][0]["name"], "detection");
    assert_eq!(health["workers"][1]["name"], "csi");
    assert_eq!(health["workers"][1]["size"], 3);
    assert_eq!(health["workers"][1]["available"], 3);
}
