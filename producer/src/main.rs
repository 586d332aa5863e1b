mod mjpeg;
mod uplink;

use bytes::Bytes;
use keyframe_stream_common::config::Config;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Frames held between the camera and the uplink before new ones are dropped.
const FRAME_QUEUE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("stream token rejected by server")]
    Unauthorized,
    #[error("invalid stream endpoint {0}")]
    InvalidEndpoint(String),
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let Some(producer) = config.producer else {
        eprintln!("Missing [producer] section in {}", config_path.display());
        std::process::exit(1);
    };

    info!(
        source = producer.source_url,
        endpoint = producer.endpoint,
        mode = producer.mode,
        fps = producer.fps,
        "starting keyframe stream producer"
    );

    let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(FRAME_QUEUE);

    let source = match producer.mode.as_str() {
        "mjpeg" => {
            let url = producer.source_url.clone();
            tokio::spawn(async move { mjpeg::run_mjpeg_source(&url, frames_tx).await })
        }
        "polling" => {
            if !(producer.fps.is_finite() && producer.fps > 0.0) {
                error!(fps = producer.fps, "polling mode needs a positive fps");
                std::process::exit(1);
            }
            let url = producer.source_url.clone();
            let interval = Duration::from_secs_f64(1.0 / producer.fps);
            tokio::spawn(async move { mjpeg::run_polling_source(&url, interval, frames_tx).await })
        }
        other => {
            error!(mode = other, "unknown stream mode, expected 'mjpeg' or 'polling'");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = uplink::run_uplink(&producer.endpoint, &producer.token, frames_rx) => {
            if let Err(e) = result {
                error!(error = %e, "uplink stopped");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    source.abort();
    info!("producer stopped");
}
