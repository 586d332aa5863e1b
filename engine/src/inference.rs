use image::DynamicImage;
use keyframe_stream_common::frame::CaptureInference;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference backend failed: {0}")]
    Backend(String),
    #[error("inference task panicked or was aborted: {0}")]
    Panicked(String),
}

/// The per-keyframe model step (segmentation, embedding, attributes).
///
/// `run` is blocking and may take hundreds of milliseconds; callers execute it
/// on a blocking worker. One handle is shared read-only across all sessions,
/// so implementations must tolerate concurrent calls.
pub trait CaptureInferencePipeline: Send + Sync {
    fn run(&self, frame: &DynamicImage) -> Result<CaptureInference, InferenceError>;

    /// Backend identifier for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Deterministic stand-in backend. Reports frame geometry and mean luma as
/// global attributes and never detects garments.
#[derive(Debug, Default)]
pub struct StubPipeline;

impl StubPipeline {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureInferencePipeline for StubPipeline {
    fn run(&self, frame: &DynamicImage) -> Result<CaptureInference, InferenceError> {
        let gray = frame.to_luma8();
        if gray.as_raw().is_empty() {
            return Err(InferenceError::Backend("empty frame".into()));
        }
        let total: u64 = gray.as_raw().iter().map(|&p| u64::from(p)).sum();
        let mean_luma = total as f64 / gray.as_raw().len() as f64;

        let mut global_attributes = Map::new();
        global_attributes.insert("width".into(), Value::from(frame.width()));
        global_attributes.insert("height".into(), Value::from(frame.height()));
        global_attributes.insert("mean_luma".into(), Value::from(mean_luma));

        Ok(CaptureInference {
            garments: Vec::new(),
            global_attributes,
        })
    }

    fn name(&self) -> &str {
        "stub"
    }
}

/// Build the backend named in `[inference].backend`.
pub fn pipeline_from_name(name: &str) -> Option<std::sync::Arc<dyn CaptureInferencePipeline>> {
    match name {
        "stub" => Some(std::sync::Arc::new(StubPipeline::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn stub_reports_geometry_and_luma() {
        let frame = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 2, Luma([100])));
        let inference = StubPipeline::new().run(&frame).unwrap();
        assert!(inference.garments.is_empty());
        assert_eq!(inference.global_attributes["width"], 4);
        assert_eq!(inference.global_attributes["height"], 2);
        assert_eq!(inference.global_attributes["mean_luma"], 100.0);
    }

    #[test]
    fn stub_rejects_empty_frame() {
        let frame = DynamicImage::ImageLuma8(GrayImage::new(0, 0));
        assert!(StubPipeline::new().run(&frame).is_err());
    }

    #[test]
    fn backend_lookup() {
        assert_eq!(pipeline_from_name("stub").unwrap().name(), "stub");
        assert!(pipeline_from_name("onnx").is_none());
    }
}
