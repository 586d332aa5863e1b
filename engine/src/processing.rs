use std::sync::Arc;
use std::time::{Duration, Instant};

use keyframe_stream_common::frame::StreamResult;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferedKeyframe, KeyframeBuffer};
use crate::inference::{CaptureInferencePipeline, InferenceError};
use crate::stats::StreamStats;

/// Single consumer of the keyframe buffer.
///
/// Pops one keyframe at a time and runs inference on the blocking pool, so at
/// most one inference per session is in flight. An inference that is running
/// when the session is cancelled is allowed to finish; its result is dropped.
pub struct ProcessingLoop {
    buffer: Arc<KeyframeBuffer>,
    stats: Arc<StreamStats>,
    pipeline: Arc<dyn CaptureInferencePipeline>,
    results: mpsc::Sender<StreamResult>,
    cancel: CancellationToken,
    idle_wait: Duration,
}

impl ProcessingLoop {
    pub fn new(
        buffer: Arc<KeyframeBuffer>,
        stats: Arc<StreamStats>,
        pipeline: Arc<dyn CaptureInferencePipeline>,
        results: mpsc::Sender<StreamResult>,
        cancel: CancellationToken,
        idle_wait: Duration,
    ) -> Self {
        Self {
            buffer,
            stats,
            pipeline,
            results,
            cancel,
            idle_wait,
        }
    }

    pub async fn run(self) {
        debug!(backend = self.pipeline.name(), "processing loop started");
        let mut processed: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.buffer.pop_timeout(self.idle_wait) => next,
            };
            let Some(keyframe) = next else {
                continue;
            };

            let seq = keyframe.seq;
            let outcome = self.infer(keyframe).await;

            if self.cancel.is_cancelled() {
                debug!(seq, "session draining, discarding in-flight result");
                break;
            }

            match outcome {
                Ok(result) => {
                    processed += 1;
                    let avg_ms = self.stats.record_processing(result.processing_ms);
                    debug!(
                        seq,
                        processing_ms = format!("{:.1}", result.processing_ms),
                        avg_ms = format!("{:.1}", avg_ms),
                        garments = result.garment_summaries.len(),
                        "keyframe processed"
                    );
                    let sent = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => false,
                        sent = self.results.send(result) => sent.is_ok(),
                    };
                    if !sent {
                        debug!(seq, "result channel closed or session draining, stopping processing loop");
                        break;
                    }
                }
                Err(e) => {
                    self.stats.record_inference_failure();
                    warn!(seq, error = %e, "inference failed, dropping keyframe");
                }
            }
        }

        info!(processed, "processing loop stopped");
    }

    async fn infer(&self, keyframe: BufferedKeyframe) -> Result<StreamResult, InferenceError> {
        let pipeline = Arc::clone(&self.pipeline);
        let BufferedKeyframe {
            seq,
            timestamp,
            frame,
        } = keyframe;

        let started = Instant::now();
        let inference = tokio::task::spawn_blocking(move || pipeline.run(&frame))
            .await
            .map_err(|e| {
                error!(seq, error = %e, "inference worker failed");
                InferenceError::Panicked(e.to_string())
            })??;
        let processing_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(StreamResult::new(seq, timestamp, processing_ms, inference))
    }
}
