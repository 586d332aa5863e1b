use std::io::Cursor;
use std::sync::Arc;

use image::{DynamicImage, ImageReader};
use keyframe_stream_common::frame::{unix_now, FrameMeta};
use tracing::{debug, warn};

use crate::buffer::{BufferedKeyframe, KeyframeBuffer};
use crate::filter::{FrameFilter, KeyframeSelector};
use crate::stats::StreamStats;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unrecognized image format: {0}")]
    Format(#[from] std::io::Error),
    #[error("failed to decode frame: {0}")]
    Image(#[from] image::ImageError),
}

/// Decode compressed frame bytes, guessing the codec from its magic bytes.
pub fn decode_frame(data: &[u8]) -> Result<DynamicImage, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    let img = ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .decode()?;
    Ok(img)
}

/// Entry point for inbound frames: numbering, decode, keyframe selection and
/// buffering.
pub struct FrameIngestor<F = KeyframeSelector> {
    seq: u64,
    filter: F,
    buffer: Arc<KeyframeBuffer>,
    stats: Arc<StreamStats>,
}

impl<F: FrameFilter> FrameIngestor<F> {
    pub fn new(filter: F, buffer: Arc<KeyframeBuffer>, stats: Arc<StreamStats>) -> Self {
        Self {
            seq: 0,
            filter,
            buffer,
            stats,
        }
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }

    pub fn buffer_depth(&self) -> usize {
        self.buffer.depth()
    }

    pub fn ingest(&mut self, data: &[u8]) -> FrameMeta {
        self.ingest_at(data, unix_now())
    }

    /// Ingest one frame observed at `now` (unix seconds). Never fails: frames
    /// that cannot be decoded are counted as skipped and reported as
    /// non-keyframes.
    pub fn ingest_at(&mut self, data: &[u8], now: f64) -> FrameMeta {
        self.seq += 1;
        let seq = self.seq;
        self.stats.record_received();

        let mut meta = FrameMeta {
            seq,
            timestamp: now,
            byte_size: u32::try_from(data.len()).unwrap_or(u32::MAX),
            is_keyframe: false,
        };

        let frame = match decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(seq, bytes = data.len(), error = %e, "frame decode failed, skipping");
                self.stats.record_skipped();
                return meta;
            }
        };

        if !self.filter.check(&frame, now) {
            self.stats.record_skipped();
            return meta;
        }

        meta.is_keyframe = true;
        self.stats.record_keyframe(seq);
        let evicted = self.buffer.push(BufferedKeyframe {
            seq,
            timestamp: now,
            frame,
        });
        if let Some(old) = evicted {
            self.stats.record_evicted();
            debug!(
                evicted_seq = old.seq,
                seq,
                filter = self.filter.name(),
                "keyframe buffer full, dropped oldest"
            );
        } else {
            debug!(seq, depth = self.buffer.depth(), "keyframe buffered");
        }
        meta
    }

    /// Start over as a fresh session.
    pub fn reset(&mut self) {
        self.seq = 0;
        self.filter.reset();
        self.buffer.clear();
        self.stats.reset();
    }
}
