//! Camera error taxonomy
//!
//! Every fallible camera, pipeline and factory operation returns
//! [`CameraError`]. Variants map one-to-one onto the numeric codes used by
//! the device's diagnostic tooling (see [`CameraError::code`]).

use thiserror::Error;

pub type Result<T, E = CameraError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("hardware fault: {0}")]
    HardwareFault(String),

    #[error("firmware error: {0}")]
    FirmwareError(String),

    #[error("calibration error: {0}")]
    CalibrationError(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("insufficient power: {0}")]
    InsufficientPower(String),

    #[error("temperature limit exceeded: {0}")]
    TemperatureError(String),

    #[error("memory error: {0}")]
    MemoryError(String),

    #[error("safety violation: {0}")]
    SafetyViolation(String),

    #[error("checksum mismatch on {stream} frame {frame_number}")]
    ChecksumMismatch {
        stream: &'static str,
        frame_number: u64,
    },

    #[error("stream closed: {0}")]
    StreamClosed(String),
}

impl CameraError {
    /// Stable numeric code, shared with the device's service tooling.
    pub fn code(&self) -> u32 {
        match self {
            Self::DeviceNotFound(_) => 1001,
            Self::ConnectionFailed(_) => 1002,
            Self::InitializationFailed(_) => 1003,
            Self::CaptureFailed(_) => 1004,
            Self::InvalidConfiguration(_) => 1005,
            Self::HardwareFault(_) => 1006,
            Self::FirmwareError(_) => 1007,
            Self::CalibrationError(_) => 1008,
            Self::Timeout(_) => 1009,
            Self::InsufficientPower(_) => 1010,
            Self::TemperatureError(_) => 1011,
            Self::MemoryError(_) => 1012,
            Self::SafetyViolation(_) => 1013,
            Self::ChecksumMismatch { .. } => 1014,
            Self::StreamClosed(_) => 1015,
        }
    }

    /// Short upper-case name used in event context and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::InitializationFailed(_) => "INITIALIZATION_FAILED",
            Self::CaptureFailed(_) => "CAPTURE_FAILED",
            Self::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            Self::HardwareFault(_) => "HARDWARE_FAULT",
            Self::FirmwareError(_) => "FIRMWARE_ERROR",
            Self::CalibrationError(_) => "CALIBRATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::InsufficientPower(_) => "INSUFFICIENT_POWER",
            Self::TemperatureError(_) => "TEMPERATURE_ERROR",
            Self::MemoryError(_) => "MEMORY_ERROR",
            Self::SafetyViolation(_) => "SAFETY_VIOLATION",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::StreamClosed(_) => "STREAM_CLOSED",
        }
    }

    /// Errors that must stop capture immediately and are never retried.
    pub fn is_safety_critical(&self) -> bool {
        matches!(
            self,
            Self::TemperatureError(_) | Self::SafetyViolation(_) | Self::ChecksumMismatch { .. }
        )
    }

    /// Errors absorbed by the pipeline as a dropped frame; the watchdog
    /// catches them if they persist.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::CaptureFailed(_))
    }

    /// Errors a consumer should back off and retry on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::StreamClosed(_) | Self::HardwareFault(_)
        )
    }
}
