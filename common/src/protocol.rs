//! JSON messages exchanged over the streaming socket.
//!
//! Binary messages carry raw frame bytes and have no envelope; everything else
//! is a JSON object discriminated by its `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::GarmentSummary;

/// Keyframe selector thresholds that a client may tune mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectorParams {
    pub ssim_threshold: f64,
    pub pixel_diff_threshold: f64,
    pub min_interval_s: f64,
    pub max_interval_s: f64,
}

impl Default for SelectorParams {
    fn default() -> Self {
        Self {
            ssim_threshold: 0.85,
            pixel_diff_threshold: 0.06,
            min_interval_s: 1.0,
            max_interval_s: 10.0,
        }
    }
}

impl SelectorParams {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(-1.0..=1.0).contains(&self.ssim_threshold) {
            return Err(ProtocolError::InvalidParameter(
                "ssim_threshold",
                "must be within [-1, 1]".into(),
            ));
        }
        let checks = [
            ("pixel_diff_threshold", self.pixel_diff_threshold, 0.0),
            ("min_interval_s", self.min_interval_s, 0.0),
            ("max_interval_s", self.max_interval_s, 0.0),
        ];
        for (name, value, floor) in checks {
            if !value.is_finite() {
                return Err(ProtocolError::InvalidParameter(name, "must be finite".into()));
            }
            if value < floor {
                return Err(ProtocolError::InvalidParameter(name, format!("must be >= {floor}")));
            }
        }
        if self.min_interval_s > self.max_interval_s {
            return Err(ProtocolError::InvalidParameter(
                "min_interval_s",
                "must not exceed max_interval_s".into(),
            ));
        }
        Ok(())
    }
}

/// Body of a `configure` command. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigureParams {
    pub ssim_threshold: Option<f64>,
    pub pixel_diff_threshold: Option<f64>,
    pub min_interval_s: Option<f64>,
    pub max_interval_s: Option<f64>,
}

impl ConfigureParams {
    /// Overlay these values on `current`. Nothing changes unless the merged
    /// result is valid as a whole.
    pub fn apply_to(&self, current: &SelectorParams) -> Result<SelectorParams, ProtocolError> {
        let merged = SelectorParams {
            ssim_threshold: self.ssim_threshold.unwrap_or(current.ssim_threshold),
            pixel_diff_threshold: self
                .pixel_diff_threshold
                .unwrap_or(current.pixel_diff_threshold),
            min_interval_s: self.min_interval_s.unwrap_or(current.min_interval_s),
            max_interval_s: self.max_interval_s.unwrap_or(current.max_interval_s),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// Client → server control commands (text frames).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Configure(ConfigureParams),
    Ping,
    Stop,
    Stats,
}

const KNOWN_COMMANDS: [&str; 4] = ["configure", "ping", "stop", "stats"];

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if !KNOWN_COMMANDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownCommand(kind));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }
}

/// Counters reported in `stats` messages and attached to every `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub keyframes_detected: u64,
    pub frames_skipped: u64,
    pub keyframes_evicted: u64,
    pub inference_failures: u64,
    pub avg_processing_ms: f64,
    pub last_keyframe_seq: Option<u64>,
    pub effective_fps: f64,
    pub uptime_s: f64,
    pub session_start: String,
}

/// Server → client messages (text frames).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ack {
        seq: u64,
        is_keyframe: bool,
        jpeg_size: u32,
        buffer_depth: usize,
    },
    Result {
        seq: u64,
        timestamp: f64,
        garments: Vec<GarmentSummary>,
        processing_ms: f64,
        stats: StatsSnapshot,
    },
    Stats(StatsSnapshot),
    Pong,
    Configured {
        params: SelectorParams,
    },
    Error {
        detail: String,
    },
}

impl ServerMessage {
    pub fn error(err: &ProtocolError) -> Self {
        ServerMessage::Error {
            detail: err.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Ack { .. } => "ack",
            ServerMessage::Result { .. } => "result",
            ServerMessage::Stats(_) => "stats",
            ServerMessage::Pong => "pong",
            ServerMessage::Configured { .. } => "configured",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Invalid parameter {0}: {1}")]
    InvalidParameter(&'static str, String),
}
