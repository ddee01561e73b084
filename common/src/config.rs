use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Largest accepted frame width or height.
pub const MAX_DIMENSION: u32 = 8192;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub broadcaster: BroadcasterConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub index: u32,
    /// Capture backend: "synthetic" or "webcam".
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Frames the driver may hold before we read them. 1 keeps latency low.
    #[serde(default = "default_buffer_depth")]
    pub buffer_depth: u32,
    /// Number of devices the synthetic backend pretends to have.
    #[serde(default = "default_synthetic_devices")]
    pub synthetic_devices: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncodingConfig {
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_boundary")]
    pub boundary: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcasterConfig {
    #[serde(default = "default_max_capture_errors")]
    pub max_consecutive_capture_errors: u32,
    #[serde(default = "default_wake_interval_ms")]
    pub wake_interval_ms: u64,
    /// 0 disables the stall timeout.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            backend: default_backend(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            buffer_depth: default_buffer_depth(),
            synthetic_devices: default_synthetic_devices(),
        }
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            boundary: default_boundary(),
        }
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            max_consecutive_capture_errors: default_max_capture_errors(),
            wake_interval_ms: default_wake_interval_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
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

impl CameraConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl BroadcasterConfig {
    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_secs > 0).then(|| Duration::from_secs(self.stall_timeout_secs))
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

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoding.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "encoding.jpeg_quality must be 0-100, got {}",
                self.encoding.jpeg_quality
            )));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "camera resolution must be non-zero, got {}",
                self.camera.resolution()
            )));
        }
        if self.camera.width > MAX_DIMENSION || self.camera.height > MAX_DIMENSION {
            return Err(ConfigError::Invalid(format!(
                "camera resolution {} exceeds {MAX_DIMENSION}x{MAX_DIMENSION}",
                self.camera.resolution()
            )));
        }
        if self.camera.fps == 0 {
            return Err(ConfigError::Invalid("camera.fps must be non-zero".into()));
        }
        if self.broadcaster.max_consecutive_capture_errors == 0 {
            return Err(ConfigError::Invalid(
                "broadcaster.max_consecutive_capture_errors must be at least 1".into(),
            ));
        }
        if self.broadcaster.wake_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "broadcaster.wake_interval_ms must be non-zero".into(),
            ));
        }
        if !is_valid_boundary(&self.encoding.boundary) {
            return Err(ConfigError::Invalid(format!(
                "encoding.boundary {:?} is not a valid multipart boundary",
                self.encoding.boundary
            )));
        }
        Ok(())
    }
}

/// Multipart boundary usable unquoted in a `Content-Type` header: 1-70
/// characters that are both RFC 2046 `bchars` and RFC 2045 token characters.
pub fn is_valid_boundary(boundary: &str) -> bool {
    const SPECIALS: &str = "'+_-.";
    !boundary.is_empty()
        && boundary.len() <= 70
        && boundary
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || SPECIALS.contains(c))
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
fn default_backend() -> String {
    "synthetic".into()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> u32 {
    30
}
fn default_buffer_depth() -> u32 {
    1
}
fn default_synthetic_devices() -> u32 {
    1
}
fn default_jpeg_quality() -> u8 {
    70
}
fn default_boundary() -> String {
    "frame".into()
}
fn default_max_capture_errors() -> u32 {
    10
}
fn default_wake_interval_ms() -> u64 {
    250
}
fn default_stall_timeout_secs() -> u64 {
    10
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5000
}
fn default_log_level() -> String {
    "info".into()
}
