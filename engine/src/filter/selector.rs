use image::{DynamicImage, GrayImage};
use keyframe_stream_common::config::SelectorConfig;
use keyframe_stream_common::protocol::SelectorParams;
use tracing::debug;

use super::ssim::mean_ssim;
use super::thumbnail::{gray_thumbnail, mean_abs_diff};
use super::traits::FrameFilter;

/// Why a frame was accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// No reference thumbnail yet.
    FirstFrame,
    /// Too soon after the last keyframe.
    RateLimited { elapsed: f64 },
    /// Forced keyframe so a static scene is still re-sampled.
    MaxIntervalElapsed { elapsed: f64 },
    /// Pixel difference below threshold; SSIM was not computed.
    NearIdentical { diff: f64 },
    /// Structurally similar to the last keyframe.
    TooSimilar { diff: f64, ssim: f64 },
    SceneChanged { diff: f64, ssim: f64 },
}

impl Decision {
    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            Decision::FirstFrame | Decision::MaxIntervalElapsed { .. } | Decision::SceneChanged { .. }
        )
    }
}

/// Keyframe selector combining time gaps with thumbnail similarity.
///
/// Decision order for a frame at time `now`:
/// 1. no reference yet → accept
/// 2. `elapsed < min_interval_s` → reject
/// 3. `elapsed >= max_interval_s` → accept
/// 4. mean absolute difference `< pixel_diff_threshold` → reject
/// 5. mean SSIM `> ssim_threshold` → reject, otherwise accept
///
/// The reference thumbnail and time only move on acceptance.
pub struct KeyframeSelector {
    params: SelectorParams,
    thumbnail_width: u32,
    thumbnail_height: u32,
    last_thumbnail: Option<GrayImage>,
    last_keyframe_time: f64,
}

impl KeyframeSelector {
    pub fn new(params: SelectorParams, thumbnail_width: u32, thumbnail_height: u32) -> Self {
        Self {
            params,
            thumbnail_width,
            thumbnail_height,
            last_thumbnail: None,
            last_keyframe_time: 0.0,
        }
    }

    pub fn from_config(config: &SelectorConfig) -> Self {
        Self::new(
            config.params(),
            config.thumbnail_width,
            config.thumbnail_height,
        )
    }

    pub fn params(&self) -> SelectorParams {
        self.params
    }

    /// Replace the thresholds. The reference thumbnail is kept.
    pub fn set_params(&mut self, params: SelectorParams) {
        debug!(?params, "selector thresholds updated");
        self.params = params;
    }

    #[cfg(test)]
    fn has_reference(&self) -> bool {
        self.last_thumbnail.is_some()
    }

    pub fn evaluate(&mut self, frame: &DynamicImage, now: f64) -> Decision {
        let decision = self.decide(frame, now);
        debug!(?decision, now, "keyframe decision");
        decision
    }

    fn decide(&mut self, frame: &DynamicImage, now: f64) -> Decision {
        let Some(reference) = &self.last_thumbnail else {
            let thumb = self.thumbnail(frame);
            self.accept(thumb, now);
            return Decision::FirstFrame;
        };

        let elapsed = now - self.last_keyframe_time;
        if elapsed < self.params.min_interval_s {
            return Decision::RateLimited { elapsed };
        }

        let thumb = self.thumbnail(frame);
        if elapsed >= self.params.max_interval_s {
            self.accept(thumb, now);
            return Decision::MaxIntervalElapsed { elapsed };
        }

        let diff = mean_abs_diff(&thumb, reference);
        if diff < self.params.pixel_diff_threshold {
            return Decision::NearIdentical { diff };
        }

        let ssim = mean_ssim(&thumb, reference);
        if ssim > self.params.ssim_threshold {
            return Decision::TooSimilar { diff, ssim };
        }

        self.accept(thumb, now);
        Decision::SceneChanged { diff, ssim }
    }

    fn thumbnail(&self, frame: &DynamicImage) -> GrayImage {
        gray_thumbnail(frame, self.thumbnail_width, self.thumbnail_height)
    }

    fn accept(&mut self, thumb: GrayImage, now: f64) {
        self.last_thumbnail = Some(thumb);
        self.last_keyframe_time = now;
    }
}

impl FrameFilter for KeyframeSelector {
    fn check(&mut self, frame: &DynamicImage, now: f64) -> bool {
        self.evaluate(frame, now).is_keyframe()
    }

    fn reset(&mut self) {
        self.last_thumbnail = None;
        self.last_keyframe_time = 0.0;
    }

    fn name(&self) -> &str {
        "ssim"
    }
}
