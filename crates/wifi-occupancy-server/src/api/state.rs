//! Application state shared by the HTTP handlers and device sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::dto::LiveEvent;
use crate::config::ServerConfig;
use crate::detection::{build_detector, DetectionPipeline, Detector};
use crate::error::ConfigError;
use crate::estimator::{load_estimator, CsiEstimator, CsiPipeline};
use crate::fusion::SharedWeights;
use crate::pool::WorkerPool;
use crate::protocol::WireCodec;
use crate::session::Session;
use crate::snapshot::LiveStateCache;
use crate::training_log::TrainingLogger;

/// Capacity of the `/ws/live` broadcast channel.
const BROADCAST_CAPACITY: usize = 256;

/// Shared application state.
///
/// Cheap to clone; every clone points at the same inner state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: ServerConfig,
    codec: WireCodec,
    cache: LiveStateCache,
    weights: SharedWeights,
    detection: Arc<DetectionPipeline>,
    csi: Arc<CsiPipeline>,
    detection_pool: WorkerPool,
    csi_pool: WorkerPool,
    training: TrainingLogger,
    /// Open session per device id
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Broadcast channel for `/ws/live`
    broadcast_tx: broadcast::Sender<LiveEvent>,
    started_at: Instant,
}

impl AppState {
    /// Build the state from configuration, loading models from the
    /// configured paths.
    pub fn from_config(config: ServerConfig) -> Result<Self, ConfigError> {
        let detector = build_detector(config.detector_model.as_deref(), config.confidence_threshold);
        let estimator = load_estimator(config.csi_model.as_deref());
        Self::new(config, detector, estimator)
    }

    /// Build the state around an explicit detector and estimator.
    pub fn new(
        config: ServerConfig,
        detector: Arc<dyn Detector>,
        estimator: Arc<dyn CsiEstimator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let weights = config.fusion_weights()?.shared();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let detection = DetectionPipeline::new(detector, config.confidence_threshold, config.jpeg_quality);
        let csi = CsiPipeline::new(estimator);
        let training = TrainingLogger::new(
            config.training_log.clone(),
            config.training_buffer_capacity,
            config.stats_window,
            std::time::Duration::from_millis(config.training_retry_ms),
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                codec: WireCodec::new(config.max_subcarriers),
                cache: LiveStateCache::new(config.grace_period()),
                weights,
                detection: Arc::new(detection),
                csi: Arc::new(csi),
                detection_pool: WorkerPool::new("detection", config.detection_workers),
                csi_pool: WorkerPool::new("csi", config.csi_workers),
                training,
                sessions: RwLock::new(HashMap::new()),
                broadcast_tx,
                started_at: Instant::now(),
                config,
            }),
        })
    }

    // ── Components ──────────────────────────────────────────────────────────

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Device message codec.
    pub fn codec(&self) -> &WireCodec {
        &self.inner.codec
    }

    /// Live snapshots.
    pub fn cache(&self) -> &LiveStateCache {
        &self.inner.cache
    }

    /// Fusion weights shared by every session.
    pub fn weights(&self) -> SharedWeights {
        self.inner.weights.clone()
    }

    pub fn detection(&self) -> &Arc<DetectionPipeline> {
        &self.inner.detection
    }

    pub fn csi(&self) -> &Arc<CsiPipeline> {
        &self.inner.csi
    }

    pub fn detection_pool(&self) -> &WorkerPool {
        &self.inner.detection_pool
    }

    pub fn csi_pool(&self) -> &WorkerPool {
        &self.inner.csi_pool
    }

    /// Training-data logger.
    pub fn training(&self) -> &TrainingLogger {
        &self.inner.training
    }

    /// Seconds since the state was built.
    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    // ── Sessions ────────────────────────────────────────────────────────────

    /// Record `session` as the open session of its device. Returns the
    /// session it replaced, if any.
    pub fn register_session(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .write()
            .insert(session.device_id().to_string(), session)
    }

    /// Forget `session` unless a newer session already took its device.
    pub fn unregister_session(&self, session: &Session) {
        let mut sessions = self.inner.sessions.write();
        if sessions
            .get(session.device_id())
            .is_some_and(|s| s.id() == session.id())
        {
            sessions.remove(session.device_id());
        }
    }

    /// Open session for `device_id`.
    pub fn session(&self, device_id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(device_id).cloned()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    // ── Live feed ───────────────────────────────────────────────────────────

    /// Publish an event to `/ws/live` subscribers.
    pub fn broadcast(&self, event: LiveEvent) {
        // No subscribers is fine.
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Subscribe to live events.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.inner.broadcast_tx.subscribe()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("bind", &self.inner.config.bind)
            .field("detector", &self.inner.detection.detector_name())
            .field("estimator", &self.inner.csi.estimator_name())
            .field("sessions", &self.session_count())
            .finish()
    }
}
