//! Error types shared across the capture, configuration and HTTP layers

use thiserror::Error;

/// Failures of a still capture or of the underlying frame source.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Another still capture holds the device, or the worker queue is full.
    #[error("capture device busy")]
    DeviceBusy,

    #[error("capture device error: {0}")]
    Device(String),

    #[error("jpeg encoding failed: {0}")]
    Encode(String),

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid resolution {0:?}, expected WIDTHxHEIGHT")]
    Resolution(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

impl axum::response::IntoResponse for CaptureError {
    fn into_response(self) -> axum::response::Response {
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            self.to_string(),
        )
            .into_response()
    }
}
