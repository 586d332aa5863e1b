use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::protocol::SelectorParams;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    pub producer: Option<ProducerConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Accepted tokens, mapped to the identity they authenticate as.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    /// Literal token accepted for local development. Disabled when unset.
    pub dev_token: Option<String>,
    #[serde(default = "default_dev_identity")]
    pub dev_identity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    #[serde(default = "default_ssim_threshold")]
    pub ssim_threshold: f64,
    #[serde(default = "default_pixel_diff_threshold")]
    pub pixel_diff_threshold: f64,
    #[serde(default = "default_min_interval_s")]
    pub min_interval_s: f64,
    #[serde(default = "default_max_interval_s")]
    pub max_interval_s: f64,
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
    #[serde(default = "default_thumbnail_height")]
    pub thumbnail_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Keyframes waiting for inference. Oldest is evicted on overflow.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Number of recent inference latencies averaged into `avg_processing_ms`.
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    #[serde(default = "default_result_wait_ms")]
    pub result_wait_ms: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default = "default_result_queue")]
    pub result_queue: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_inference_backend")]
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    /// MJPEG stream (or single-frame URL in polling mode) of the camera.
    pub source_url: String,
    /// WebSocket URL of the streaming endpoint, without the token query.
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            stream_path: default_stream_path(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tokens: HashMap::new(),
            dev_token: None,
            dev_identity: default_dev_identity(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            ssim_threshold: default_ssim_threshold(),
            pixel_diff_threshold: default_pixel_diff_threshold(),
            min_interval_s: default_min_interval_s(),
            max_interval_s: default_max_interval_s(),
            thumbnail_width: default_thumbnail_width(),
            thumbnail_height: default_thumbnail_height(),
        }
    }
}

impl SelectorConfig {
    /// The live-tunable subset of the selector settings.
    pub fn params(&self) -> SelectorParams {
        SelectorParams {
            ssim_threshold: self.ssim_threshold,
            pixel_diff_threshold: self.pixel_diff_threshold,
            min_interval_s: self.min_interval_s,
            max_interval_s: self.max_interval_s,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            latency_window: default_latency_window(),
            idle_wait_ms: default_idle_wait_ms(),
            result_wait_ms: default_result_wait_ms(),
            stats_interval_secs: default_stats_interval_secs(),
            result_queue: default_result_queue(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: default_inference_backend(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("stream.buffer_capacity must be > 0".into()));
        }
        if self.stream.latency_window == 0 {
            return Err(ConfigError::Invalid("stream.latency_window must be > 0".into()));
        }
        if self.stream.stats_interval_secs == 0 {
            return Err(ConfigError::Invalid("stream.stats_interval_secs must be > 0".into()));
        }
        if self.selector.thumbnail_width == 0 || self.selector.thumbnail_height == 0 {
            return Err(ConfigError::Invalid("selector thumbnail must be non-empty".into()));
        }
        self.selector
            .params()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("selector: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}
fn default_stream_path() -> String {
    "/v1/stream".into()
}
fn default_dev_identity() -> String {
    "dev-user".into()
}
fn default_ssim_threshold() -> f64 {
    0.85
}
fn default_pixel_diff_threshold() -> f64 {
    0.06
}
fn default_min_interval_s() -> f64 {
    1.0
}
fn default_max_interval_s() -> f64 {
    10.0
}
fn default_thumbnail_width() -> u32 {
    160
}
fn default_thumbnail_height() -> u32 {
    120
}
fn default_buffer_capacity() -> usize {
    8
}
fn default_latency_window() -> usize {
    50
}
fn default_idle_wait_ms() -> u64 {
    50
}
fn default_result_wait_ms() -> u64 {
    500
}
fn default_stats_interval_secs() -> u64 {
    5
}
fn default_result_queue() -> usize {
    32
}
fn default_outbound_queue() -> usize {
    64
}
fn default_inference_backend() -> String {
    "stub".into()
}
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_fps() -> f64 {
    10.0
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.stream_path, "/v1/stream");
        assert_eq!(config.stream.buffer_capacity, 8);
        assert_eq!(config.stream.latency_window, 50);
        assert_eq!(config.stream.stats_interval_secs, 5);
        assert_eq!(config.selector.thumbnail_width, 160);
        assert_eq!(config.selector.thumbnail_height, 120);
        assert_eq!(config.selector.params(), SelectorParams::default());
        assert!(config.producer.is_none());
        assert!(config.auth.dev_token.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml(
            r#"
            [auth]
            dev_token = "dev"
            tokens = { "s3cret" = "user-42" }

            [selector]
            ssim_threshold = 0.9
            min_interval_s = 0.5

            [stream]
            buffer_capacity = 2

            [producer]
            source_url = "http://camera.local/stream"
            endpoint = "ws://localhost:8000/v1/stream"
            "#,
        )
        .unwrap();
        assert_eq!(config.auth.dev_token.as_deref(), Some("dev"));
        assert_eq!(config.auth.tokens.get("s3cret").map(String::as_str), Some("user-42"));
        assert_eq!(config.selector.ssim_threshold, 0.9);
        assert_eq!(config.selector.min_interval_s, 0.5);
        assert_eq!(config.selector.max_interval_s, 10.0);
        assert_eq!(config.stream.buffer_capacity, 2);
        let producer = config.producer.unwrap();
        assert_eq!(producer.mode, "mjpeg");
        assert_eq!(producer.fps, 10.0);
    }

    #[test]
    fn zero_capacity_rejected() {
        let err = Config::from_toml("[stream]\nbuffer_capacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn inverted_intervals_rejected() {
        let err = Config::from_toml("[selector]\nmin_interval_s = 20.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml("[stream\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
