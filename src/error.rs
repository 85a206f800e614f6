//! Custom error types for the camera driver.
//!
//! This module defines `PdvError`, the single error type returned by every
//! fallible operation in the crate. Using the `thiserror` crate, it keeps the
//! failure taxonomy of the acquisition pipeline in one place.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: A geometry or trigger setter was given a value that would
//!   break the sensor-geometry invariants. State is left untouched.
//! - **`DeviceOpen`** / **`DeviceInit`**: The frame grabber channel could not be
//!   opened, or the vendor configuration could not be loaded or applied. Raised
//!   by reconfiguration; the reconfigure-pending flag is re-armed.
//! - **`TransferTimeout`**: No raw buffer arrived within the acquire timeout.
//!   The acquire loop treats it as a local event and keeps running.
//! - **`FrameSync`**: The frame-sync check reported a counter mismatch or lost
//!   sync. This is a warning; whether the frame is kept depends on the
//!   configured `SyncPolicy`.
//! - **`Allocation`**: The shared buffer pool could not satisfy a request.
//! - **`InvalidGeometry`** / **`ShortBuffer`**: A raw frame could not be
//!   converted with the current geometry.
//! - **`ConnectionLost`**: The device handle disappeared while connected.
//! - **`Registry`**: Camera registration failed (duplicate name or unit/channel).
//! - **`Config`** / **`Io`**: Wrapped `figment` and I/O errors.
//!
//! By using `#[from]`, `PdvError` can be created from the underlying error
//! types with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type Result<T> = std::result::Result<T, PdvError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum PdvError {
    #[error("Invalid value for {param}: {reason}")]
    Validation { param: &'static str, reason: String },

    #[error("Failed to open pdv unit {unit} channel {channel}: {reason}")]
    DeviceOpen {
        unit: u32,
        channel: u32,
        reason: String,
    },

    #[error("Device initialization failed: {0}")]
    DeviceInit(String),

    #[error("No frame within {0:?}")]
    TransferTimeout(Duration),

    #[error("Frame sync warning: {0}")]
    FrameSync(String),

    #[error("Buffer allocation failed: {0}")]
    Allocation(String),

    #[error("Invalid frame geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("Raw buffer too short: need {expected} bytes, got {actual}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("Device connection lost")]
    ConnectionLost,

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PdvError {
    /// Shorthand for a [`PdvError::Validation`].
    pub fn validation(param: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            param,
            reason: reason.into(),
        }
    }

    /// Whether the acquire loop can carry on after this error.
    ///
    /// Device open/init failures need a reconfigure pass first; everything
    /// raised inside a loop iteration is local to that frame.
    #[must_use]
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            Self::TransferTimeout(_)
                | Self::FrameSync(_)
                | Self::Allocation(_)
                | Self::InvalidGeometry { .. }
                | Self::ShortBuffer { .. }
        )
    }
}
