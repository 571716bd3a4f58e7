//! Edge fusion server for ESP32 camera + WiFi CSI sensor nodes.
//!
//! Each node opens a WebSocket and streams JPEG frames (binary) and CSI
//! samples (JSON). The server:
//!
//! - runs person detection on the newest frame and a CSI occupancy
//!   estimate on the newest sample, each on a bounded worker pool;
//! - fuses the two counts with configurable weights;
//! - keeps a live snapshot per device for the dashboard (`/ws/live`, REST);
//! - logs CSI features labelled with the camera count for offline training;
//! - optionally forwards counts to a central backend.
//!
//! # Example
//!
//! ```rust,no_run
//! use wifi_occupancy_server::{api, config::ServerConfig, Background};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::default();
//!     let state = api::AppState::from_config(config.clone())?;
//!     let background = Background::spawn(&state)?;
//!
//!     let listener = tokio::net::TcpListener::bind(config.bind).await?;
//!     axum::serve(listener, api::create_router(state.clone())).await?;
//!
//!     background.shutdown(&state, std::time::Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod detection;
pub mod error;
pub mod estimator;
pub mod fusion;
pub mod mailbox;
pub mod pool;
pub mod protocol;
pub mod push;
pub mod session;
pub mod snapshot;
pub mod training_log;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use api::{create_router, AppState};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Longest pause between expiry sweeps of the live cache.
const MAX_JANITOR_PERIOD: Duration = Duration::from_secs(5);

/// Long-running tasks that live beside the HTTP server.
#[derive(Debug)]
pub struct Background {
    shutdown: watch::Sender<bool>,
    writer: JoinHandle<()>,
    janitor: JoinHandle<()>,
    pusher: Option<JoinHandle<()>>,
}

impl Background {
    /// Start the training-log writer, the cache janitor and, when a backend
    /// URL is configured, the backend pusher.
    pub fn spawn(state: &AppState) -> ServerResult<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let writer = state.training().spawn_writer();
        let janitor = spawn_janitor(state.clone(), shutdown_rx.clone());
        let pusher = match &state.config().backend_url {
            Some(url) => {
                let pusher = push::BackendPusher::new(url)?;
                Some(pusher.spawn(state.clone(), state.config().push_interval(), shutdown_rx))
            }
            None => None,
        };

        Ok(Self {
            shutdown,
            writer,
            janitor,
            pusher,
        })
    }

    /// Stop every task, then let the training-log writer flush pending
    /// records for at most `flush_timeout`.
    pub async fn shutdown(self, state: &AppState, flush_timeout: Duration) {
        let _ = self.shutdown.send(true);
        if let Some(pusher) = self.pusher {
            let _ = pusher.await;
        }
        let _ = self.janitor.await;

        state.training().shutdown();
        if tokio::time::timeout(flush_timeout, self.writer).await.is_err() {
            warn!(pending = state.training().pending_len(), "Training log writer did not stop in time");
        }
        info!("Background tasks stopped");
    }
}

fn spawn_janitor(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let period = (state.config().grace_period() / 2).clamp(Duration::from_millis(100), MAX_JANITOR_PERIOD);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = state.cache().purge_expired(chrono::Utc::now());
                    if purged > 0 {
                        debug!(purged, "Expired disconnected devices");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
