//! Optional forwarding of counts to a central backend.
//!
//! Every `push_interval` the pusher POSTs the newest snapshot of each
//! connected device to `{backend_url}/api/v1/count/edge`, skipping devices
//! whose snapshot has not changed since the last successful push. Failures
//! are logged and retried on the next tick.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::detection::Detection;
use crate::error::PushError;
use crate::fusion::FusionResult;
use crate::snapshot::LiveSnapshot;

/// Request timeout for one push.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Path appended to the backend URL.
pub const EDGE_COUNT_PATH: &str = "/api/v1/count/edge";

/// Body of one push.
#[derive(Debug, Serialize)]
pub struct EdgeCount<'a> {
    pub people_count: u32,
    pub detections: &'a [Detection],
    pub timestamp: DateTime<Utc>,
    pub camera_id: &'a str,
    pub frame_base64: Option<String>,
    pub fusion: &'a FusionResult,
}

impl<'a> EdgeCount<'a> {
    pub fn from_snapshot(snapshot: &'a LiveSnapshot) -> Self {
        Self {
            people_count: snapshot.people_count(),
            detections: &snapshot.detections,
            timestamp: snapshot.updated_at,
            camera_id: &snapshot.device_id,
            frame_base64: snapshot.frame.as_ref().map(|f| STANDARD.encode(f)),
            fusion: &snapshot.fusion,
        }
    }
}

/// HTTP client for the central backend.
#[derive(Debug, Clone)]
pub struct BackendPusher {
    client: reqwest::Client,
    endpoint: String,
}

impl BackendPusher {
    /// Create a pusher for `backend_url`.
    pub fn new(backend_url: &str) -> Result<Self, PushError> {
        let client = reqwest::Client::builder().timeout(PUSH_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", backend_url.trim_end_matches('/'), EDGE_COUNT_PATH),
        })
    }

    /// Full URL pushes go to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Push one snapshot.
    pub async fn push(&self, snapshot: &LiveSnapshot) -> Result<(), PushError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EdgeCount::from_snapshot(snapshot))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Status(status.as_u16()));
        }
        Ok(())
    }

    /// Push every connected device whose snapshot changed since the last
    /// successful push. `pushed` tracks the last pushed version per device.
    pub async fn push_changed(&self, state: &AppState, pushed: &mut HashMap<String, u64>) -> usize {
        let snapshots = state.cache().list();
        let mut sent = 0;
        for snapshot in &snapshots {
            if !snapshot.connected || pushed.get(&snapshot.device_id) == Some(&snapshot.version) {
                continue;
            }
            match self.push(snapshot).await {
                Ok(()) => {
                    pushed.insert(snapshot.device_id.clone(), snapshot.version);
                    sent += 1;
                    debug!(device_id = %snapshot.device_id, count = snapshot.people_count(), "Pushed count");
                }
                Err(e) => {
                    warn!(device_id = %snapshot.device_id, error = %e, "Backend push failed");
                }
            }
        }
        pushed.retain(|id, _| snapshots.iter().any(|s| &s.device_id == id));
        sent
    }

    /// Run until `shutdown` flips to `true`.
    pub fn spawn(self, state: AppState, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(endpoint = %self.endpoint, ?interval, "Backend push enabled");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut pushed = HashMap::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.push_changed(&state, &mut pushed).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Backend pusher stopped");
        })
    }
}
