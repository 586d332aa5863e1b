use image::DynamicImage;

/// Scene-change decision interface for decoded frames.
///
/// Implementations see every successfully decoded frame together with its
/// ingestion time and decide whether it represents a meaningful change from
/// the last frame they accepted.
pub trait FrameFilter: Send {
    /// Returns `true` if this frame should be treated as a keyframe.
    /// Internal reference state may only change when `true` is returned.
    fn check(&mut self, frame: &DynamicImage, now: f64) -> bool;

    /// Forget all reference state; the next `check` accepts unconditionally.
    fn reset(&mut self);

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
