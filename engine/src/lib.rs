//! Per-session keyframe selection and inference scheduling.

pub mod auth;
pub mod buffer;
pub mod dispatcher;
pub mod filter;
pub mod inference;
pub mod ingest;
pub mod processing;
pub mod session;
pub mod stats;

pub use auth::{AuthError, AuthValidator, SessionIdentity, StaticTokenValidator};
pub use inference::{pipeline_from_name, CaptureInferencePipeline, StubPipeline};
pub use session::{ActiveSession, ClientFrame, SessionController, SessionSettings, SessionState};
