pub mod selector;
pub mod ssim;
pub mod thumbnail;
pub mod traits;

pub use selector::{Decision, KeyframeSelector};
pub use traits::FrameFilter;
