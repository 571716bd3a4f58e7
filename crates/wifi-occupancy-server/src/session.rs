//! Device Session Manager.
//!
//! One task per device connection reads the socket, decodes each message and
//! routes it:
//!
//! ```text
//!              ┌─ Frame ──► frame mailbox ──► detection pool ──┐
//! socket ─► codec                                             ├─► fusion ─► cache ─► /ws/live
//!              └─ Csi ────► csi mailbox ────► csi pool ────────┘        └─► training log
//!              └─ Control / Reply / Ping / error ─► ack on the outbound channel
//! ```
//!
//! Mailboxes hold one pending item per kind, so a slow model drops stale
//! input instead of queueing it. Results are fused and published under the
//! session's fusion lock; results that complete after the session ended (or
//! after a newer session took over the device id) are discarded.
//!
//! State machine: `Connecting → Active → Disconnected`. The handshake is the
//! initial camera-settings send; only transport failures and the idle
//! timeout end a session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::api::dto::LiveEvent;
use crate::api::AppState;
use crate::error::{DetectionError, EstimatorError, ProtocolError, TransportError};
use crate::estimator::DEFAULT_CONFIDENCE;
use crate::fusion::{FusionEngine, SourceReading};
use crate::mailbox::Mailbox;
use crate::protocol::{CameraControl, CsiSample, FrameMessage, Inbound, Outbound, RawMessage};
use crate::snapshot::FrameUpdate;
use crate::training_log::TrainingRecord;

/// Capacity of the per-session outbound queue.
const OUTBOUND_CAPACITY: usize = 32;

/// How long queued replies may take to flush after the session ends.
const ACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Socket accepted, handshake not yet sent
    Connecting,
    /// Handshake sent; ingesting
    Active,
    /// Terminal
    Disconnected,
}

/// Per-session counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_received: AtomicU64,
    frames_processed: AtomicU64,
    csi_received: AtomicU64,
    csi_processed: AtomicU64,
    protocol_errors: AtomicU64,
    decode_errors: AtomicU64,
    inference_errors: AtomicU64,
    estimator_errors: AtomicU64,
    stale_results: AtomicU64,
    device_replies: AtomicU64,
    acks_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatsSnapshot {
    pub frames_received: u64,
    pub frames_processed: u64,
    pub frames_superseded: u64,
    pub csi_received: u64,
    pub csi_processed: u64,
    pub csi_superseded: u64,
    pub protocol_errors: u64,
    pub decode_errors: u64,
    pub inference_errors: u64,
    pub estimator_errors: u64,
    pub stale_results: u64,
    pub device_replies: u64,
    pub acks_dropped: u64,
}

/// State of one device connection shared between its tasks and the API.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    device_id: String,
    connected_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    last_activity: Mutex<DateTime<Utc>>,
    camera: Mutex<CameraControl>,
    outbound: mpsc::Sender<Outbound>,
    fusion: Mutex<FusionEngine>,
    frames: Mailbox<FrameMessage>,
    csi: Mailbox<CsiSample>,
    stats: SessionStats,
}

impl Session {
    fn new(device_id: String, outbound: mpsc::Sender<Outbound>, fusion: FusionEngine) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            device_id,
            connected_at: now,
            state: Mutex::new(SessionState::Connecting),
            last_activity: Mutex::new(now),
            camera: Mutex::new(CameraControl::default()),
            outbound,
            fusion: Mutex::new(fusion),
            frames: Mailbox::new(),
            csi: Mailbox::new(),
            stats: SessionStats::default(),
        }
    }

    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Accept time.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != SessionState::Disconnected {
            *state = next;
        }
    }

    /// Time of the last inbound message.
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    fn touch(&self, at: DateTime<Utc>) {
        *self.last_activity.lock() = at;
    }

    /// Camera settings last sent to (or reported by) the device.
    pub fn camera_settings(&self) -> CameraControl {
        *self.camera.lock()
    }

    /// Queue a camera-control command for the device.
    pub fn send_control(&self, control: CameraControl) -> Result<(), TransportError> {
        self.enqueue(Outbound::Control(control))?;
        self.camera.lock().merge(&control);
        Ok(())
    }

    /// Queue an outbound message without waiting. A full queue drops the
    /// message; a closed queue means the socket writer is gone.
    fn enqueue(&self, msg: Outbound) -> Result<(), TransportError> {
        match self.outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                bump(&self.stats.acks_dropped);
                warn!(device_id = %self.device_id, "Outbound queue full, reply dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::OutboundClosed),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SessionStatsSnapshot {
        let s = &self.stats;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionStatsSnapshot {
            frames_received: load(&s.frames_received),
            frames_processed: load(&s.frames_processed),
            frames_superseded: self.frames.superseded(),
            csi_received: load(&s.csi_received),
            csi_processed: load(&s.csi_processed),
            csi_superseded: self.csi.superseded(),
            protocol_errors: load(&s.protocol_errors),
            decode_errors: load(&s.decode_errors),
            inference_errors: load(&s.inference_errors),
            estimator_errors: load(&s.estimator_errors),
            stale_results: load(&s.stale_results),
            device_replies: load(&s.device_replies),
            acks_dropped: load(&s.acks_dropped),
        }
    }

    fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }
}

// ── Connection task ─────────────────────────────────────────────────────────

/// Drive one device connection to completion.
pub async fn run_session(socket: WebSocket, state: AppState, device_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);

    let max_staleness = state.config().max_staleness_ms.map(Duration::from_millis);
    let fusion = FusionEngine::new(state.weights(), max_staleness);
    let session = Arc::new(Session::new(device_id, out_tx, fusion));
    let device_id = session.device_id().to_string();
    info!(device_id = %device_id, session = %session.id(), "Device connected");

    // Handshake: push the configured camera settings.
    let handshake = state.config().camera_settings;
    if let Err(e) = sender.send(Message::Text(Outbound::Control(handshake).to_json().into())).await {
        info!(device_id = %device_id, error = %e, "Device disconnected before handshake");
        session.set_state(SessionState::Disconnected);
        return;
    }
    *session.camera.lock() = handshake;
    session.set_state(SessionState::Active);
    debug!(device_id = %device_id, settings = ?handshake, "Sent camera settings");

    if let Some(previous) = state.register_session(session.clone()) {
        warn!(
            device_id = %device_id,
            previous = %previous.id(),
            "Device reconnected while an older session was open; the older session is now stale"
        );
    }
    let weights = *state.weights().read();
    let snapshot = state.cache().register(&device_id, session.id(), weights);
    state.broadcast(LiveEvent::from_snapshot(&snapshot));

    let mut forward_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sender.send(Message::Text(msg.to_json().into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });
    let frame_task = spawn_frame_worker(session.clone(), state.clone());
    let csi_task = spawn_csi_worker(session.clone(), state.clone());

    let idle = state.config().idle_timeout();
    let codec = state.codec();
    let reason = loop {
        let next = match tokio::time::timeout(idle, receiver.next()).await {
            Err(_) => {
                break TransportError::IdleTimeout {
                    secs: idle.as_secs(),
                }
            }
            Ok(None) => break TransportError::Closed,
            Ok(Some(Err(e))) => break TransportError::Socket(e.to_string()),
            Ok(Some(Ok(msg))) => msg,
        };

        let now = Utc::now();
        session.touch(now);
        let raw = match next {
            Message::Binary(data) => RawMessage::Binary(Bytes::from(data)),
            Message::Text(text) => RawMessage::Text(text.to_string()),
            Message::Ping(_) | Message::Pong(_) => {
                trace!(device_id = %device_id, "Keepalive");
                continue;
            }
            Message::Close(_) => break TransportError::Closed,
        };

        if let Err(e) = handle_inbound(&session, codec.decode(raw, now)) {
            break e;
        }
    };

    // Teardown: stop accepting work, cancel in-flight inference, publish the
    // disconnected state.
    session.set_state(SessionState::Disconnected);
    session.frames.close();
    session.csi.close();
    frame_task.abort();
    csi_task.abort();

    match &reason {
        TransportError::Closed => info!(device_id = %device_id, session = %session.id(), "Device disconnected"),
        other => warn!(device_id = %device_id, session = %session.id(), reason = %other, "Session terminated"),
    }

    state.unregister_session(&session);
    if let Some(snapshot) = state.cache().mark_disconnected(&device_id, session.id()) {
        state.broadcast(LiveEvent::from_snapshot(&snapshot));
    }
    let stats = session.stats();
    info!(
        device_id = %device_id,
        frames = stats.frames_processed,
        csi = stats.csi_processed,
        superseded = stats.frames_superseded + stats.csi_superseded,
        "Session closed"
    );

    // Remaining acks drain once every sender clone is gone.
    drop(session);
    if tokio::time::timeout(ACK_DRAIN_TIMEOUT, &mut forward_task).await.is_err() {
        forward_task.abort();
    }
}

/// Route one decoded message. Only a closed outbound channel is fatal.
fn handle_inbound(session: &Session, decoded: Result<Inbound, ProtocolError>) -> Result<(), TransportError> {
    let msg = match decoded {
        Ok(msg) => msg,
        Err(e) => {
            bump(&session.stats.protocol_errors);
            match &e {
                ProtocolError::InvalidJson { detail } => {
                    debug!(device_id = %session.device_id, detail = %detail, "Malformed JSON from device")
                }
                other => debug!(device_id = %session.device_id, error = %other, "Rejected device message"),
            }
            return session.enqueue(Outbound::error(e.to_string()));
        }
    };

    trace!(device_id = %session.device_id, kind = msg.kind(), "Device message");
    match msg {
        Inbound::Frame(frame) => {
            bump(&session.stats.frames_received);
            if session.frames.put(frame).is_some() {
                trace!(device_id = %session.device_id, "Frame superseded");
            }
        }
        Inbound::Csi(sample) => {
            bump(&session.stats.csi_received);
            if session.csi.put(sample).is_some() {
                trace!(device_id = %session.device_id, "CSI sample superseded");
            }
        }
        Inbound::Control(control) => {
            session.camera.lock().merge(&control);
            session.enqueue(Outbound::ok("Camera parameters updated"))?;
        }
        Inbound::DeviceReply(reply) => {
            bump(&session.stats.device_replies);
            if reply.is_ok() {
                debug!(device_id = %session.device_id, message = ?reply.message, "Device acknowledged command");
            } else {
                warn!(device_id = %session.device_id, message = ?reply.message, "Device rejected command");
            }
        }
        Inbound::Ping => session.enqueue(Outbound::pong())?,
    }
    Ok(())
}

// ── Pipeline workers ────────────────────────────────────────────────────────

fn spawn_frame_worker(session: Arc<Session>, state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = session.frames.take().await {
            let pipeline = state.detection().clone();
            let outcome = state.detection_pool().run(move || pipeline.process(&frame)).await;
            let result = match outcome.map_err(DetectionError::from).and_then(|r| r) {
                Ok(result) => result,
                Err(DetectionError::Decode(e)) => {
                    bump(&session.stats.decode_errors);
                    debug!(device_id = %session.device_id, error = %e, "Dropped undecodable frame");
                    continue;
                }
                Err(e) => {
                    bump(&session.stats.inference_errors);
                    warn!(device_id = %session.device_id, error = %e, "Detection failed, keeping last count");
                    continue;
                }
            };

            if !session.is_active() {
                bump(&session.stats.stale_results);
                continue;
            }
            bump(&session.stats.frames_processed);

            let reading = SourceReading {
                count: f64::from(result.people_count),
                confidence: result.mean_confidence.unwrap_or(DEFAULT_CONFIDENCE),
                timestamp: result.timestamp,
            };
            let published = {
                let mut fusion = session.fusion.lock();
                let fused = fusion.update_camera(reading);
                state.cache().publish(
                    &session.device_id,
                    session.id,
                    fused,
                    Some(FrameUpdate {
                        jpeg: result.annotated_jpeg,
                        detections: result.detections,
                    }),
                )
            };
            match published {
                Some(snapshot) => state.broadcast(LiveEvent::from_snapshot(&snapshot)),
                None => bump(&session.stats.stale_results),
            }
        }
    })
}

fn spawn_csi_worker(session: Arc<Session>, state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sample) = session.csi.take().await {
            let pipeline = state.csi().clone();
            let outcome = state
                .csi_pool()
                .run(move || {
                    let estimate = pipeline.process(&sample);
                    (sample, estimate)
                })
                .await;
            let (sample, estimate) = match outcome {
                Ok((sample, Ok(estimate))) => (sample, estimate),
                Ok((_, Err(e))) => {
                    bump(&session.stats.estimator_errors);
                    warn!(device_id = %session.device_id, error = %e, "CSI estimation failed, keeping last count");
                    continue;
                }
                Err(e) => {
                    bump(&session.stats.estimator_errors);
                    warn!(device_id = %session.device_id, error = %EstimatorError::from(e), "CSI worker failed");
                    continue;
                }
            };

            if !session.is_active() {
                bump(&session.stats.stale_results);
                continue;
            }
            bump(&session.stats.csi_processed);

            let reading = SourceReading {
                count: estimate.count,
                confidence: estimate.confidence,
                timestamp: estimate.timestamp,
            };
            let (published, label) = {
                let mut fusion = session.fusion.lock();
                let fused = fusion.update_csi(reading);
                let label = fusion.latest_camera().map(|c| c.count.max(0.0).round() as u32);
                let published = state.cache().publish(&session.device_id, session.id, fused, None);
                (published, label)
            };
            let Some(snapshot) = published else {
                bump(&session.stats.stale_results);
                continue;
            };
            state.broadcast(LiveEvent::from_snapshot(&snapshot));

            match label {
                Some(people) => state.training().append(TrainingRecord::new(
                    &session.device_id,
                    &sample,
                    estimate.features,
                    people,
                )),
                None => trace!(device_id = %session.device_id, "No camera count yet, training sample skipped"),
            }
        }
    })
}
