pub mod auth;
pub mod capture;
pub mod error;
pub mod relay;
pub mod server;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use auth::{generate_token, TimeWindow, Verifier, AUTH_HEADER, AUTH_KEY_ENV};
pub use capture::{CaptureGate, CaptureMode, Frame};
pub use error::{CaptureError, ConfigError};
pub use relay::{Relay, WaitOutcome};

/// Lowest and highest frame rate the stream pipeline accepts
pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 60;

/// Prefix for environment overrides, e.g. `HERMES_SERVER__PORT=8080`
const ENV_PREFIX: &str = "HERMES";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// V4L2 device path; `None` runs the synthetic test pattern
    pub device: Option<String>,
    pub resolution: Resolution,
    pub fps: u32,
    /// Still capture size; `None` lets the source pick its largest mode
    pub still_resolution: Option<Resolution>,
    pub mode: CaptureMode,
    pub still_timeout_ms: u64,
    pub jpeg_quality: u8,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// How long a streaming client waits on the relay before probing its connection
    pub wait_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 3002,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            resolution: Resolution::new(640, 480),
            fps: 30,
            still_resolution: None,
            mode: CaptureMode::Exclusive,
            still_timeout_ms: 10_000,
            jpeg_quality: 80,
            buffer_count: 4,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `HERMES_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the server spin or refuse every still.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream.wait_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.capture.still_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "capture.still_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl CaptureConfig {
    /// Frame rate limited to the range the pipeline supports.
    pub fn clamped_fps(&self) -> u32 {
        let fps = self.fps.clamp(MIN_FPS, MAX_FPS);
        if fps != self.fps {
            warn!(requested = self.fps, using = fps, "frame rate out of range, clamping");
        }
        fps
    }

    pub fn still_timeout(&self) -> Duration {
        Duration::from_millis(self.still_timeout_ms)
    }
}

impl StreamConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Frame size, written as `WIDTHxHEIGHT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FromStr for Resolution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Resolution(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.parse().map_err(|_| invalid())?;
        let height: u32 = h.parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
