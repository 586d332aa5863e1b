use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata produced for every ingested frame, keyframe or not.
///
/// `seq` starts at 1 for each session and increases by one per binary
/// message, including frames that fail to decode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    pub seq: u64,
    /// Unix seconds at ingestion.
    pub timestamp: f64,
    pub byte_size: u32,
    pub is_keyframe: bool,
}

/// One detected garment as reported to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarmentSummary {
    #[serde(default = "unknown_garment")]
    pub garment_type: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

fn unknown_garment() -> String {
    "unknown".into()
}

/// Output of the external inference pipeline for a single keyframe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureInference {
    #[serde(default)]
    pub garments: Vec<GarmentSummary>,
    #[serde(default)]
    pub global_attributes: Map<String, Value>,
}

/// A processed keyframe, handed from the processing loop to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamResult {
    pub seq: u64,
    /// Ingestion time of the keyframe, unix seconds.
    pub timestamp: f64,
    pub processing_ms: f64,
    pub garment_summaries: Vec<GarmentSummary>,
    pub inference: CaptureInference,
}

impl StreamResult {
    pub fn new(seq: u64, timestamp: f64, processing_ms: f64, inference: CaptureInference) -> Self {
        Self {
            seq,
            timestamp,
            processing_ms,
            garment_summaries: inference.garments.clone(),
            inference,
        }
    }
}

/// Current wall-clock time as fractional unix seconds.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Round to one decimal place, as shown to clients.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
