//! Edge fusion server binary.
//!
//! ```text
//! wifi-occupancy-server --bind 0.0.0.0:8080 --backend-url http://backend:8000
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use wifi_occupancy_server::{create_router, AppState, Background, ServerConfig};

/// Time the training-log writer gets to flush on shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "wifi-occupancy-server", version, about = "Camera + WiFi CSI occupancy fusion server")]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen address for device WebSockets and the HTTP API
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Central backend to forward counts to
    #[arg(long, value_name = "URL")]
    backend_url: Option<String>,

    /// Minimum detection confidence (0-1)
    #[arg(long)]
    conf: Option<f32>,

    /// Camera weight in the fused count (0-1); CSI gets the rest
    #[arg(long)]
    camera_weight: Option<f64>,

    /// Close device sessions after this many idle seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// JSONL file for labelled CSI training samples
    #[arg(long, value_name = "PATH")]
    training_log: Option<PathBuf>,

    /// Linear CSI model (JSON)
    #[arg(long, value_name = "PATH")]
    csi_model: Option<PathBuf>,

    /// YOLO person detector (ONNX; needs the `onnx` feature)
    #[arg(long, value_name = "PATH")]
    detector_model: Option<PathBuf>,

    /// Minimum milliseconds between backend pushes per device
    #[arg(long)]
    push_interval_ms: Option<u64>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Write the effective configuration to a JSON file and exit
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(ServerConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(url) = self.backend_url {
            config.backend_url = Some(url);
        }
        if let Some(conf) = self.conf {
            config.confidence_threshold = conf;
        }
        if let Some(weight) = self.camera_weight {
            config.camera_weight = weight;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout_secs = secs;
        }
        if let Some(path) = self.training_log {
            config.training_log = path;
        }
        if let Some(path) = self.csi_model {
            config.csi_model = Some(path);
        }
        if let Some(path) = self.detector_model {
            config.detector_model = Some(path);
        }
        if let Some(ms) = self.push_interval_ms {
            config.push_interval_ms = ms;
        }

        config.validate().context("invalid configuration")?;
        Ok((config, self.print_config))
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let write_config = args.write_config.clone();
    let (config, print_config) = args.into_config()?;
    if print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    if let Some(path) = write_config {
        config
            .to_json(&path)
            .with_context(|| format!("writing config to {}", path.display()))?;
        info!(path = %path.display(), "Configuration written");
        return Ok(());
    }

    let bind = config.bind;
    let state = AppState::from_config(config).context("building server state")?;
    info!(?state, "Server state ready");
    let background = Background::spawn(&state).context("starting background tasks")?;

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!("Listening on {bind} (devices: ws://{bind}/ws/device, dashboard: ws://{bind}/ws/live)");

    axum::serve(listener, create_router(state.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    background.shutdown(&state, FLUSH_TIMEOUT).await;
    Ok(())
}
