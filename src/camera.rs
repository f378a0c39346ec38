//! The camera contract shared by every backend
//!
//! A [`Camera`] is driven through `&self` so one instance can be shared as
//! `Arc<dyn Camera>` between a consumer blocked in
//! [`Camera::synchronized_frames`] and a control thread that stops it.

use std::fmt;

use serde::Serialize;

use crate::capture::{CameraCapabilities, DepthFrame, RgbFrame};
use crate::config::CameraConfig;
use crate::error::{CameraError, Result};

/// Lifecycle state of a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraStatus {
    Disconnected,
    Connecting,
    Connected,
    Initializing,
    Ready,
    Capturing,
    Error,
    /// Watchdog expiry, exhausted recovery or a safety violation. Only
    /// `disconnect` or a successful recovery leaves this state.
    Fault,
}

impl CameraStatus {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Initializing | Self::Ready | Self::Capturing | Self::Fault
        )
    }
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Capturing => "CAPTURING",
            Self::Error => "ERROR",
            Self::Fault => "FAULT",
        };
        f.write_str(s)
    }
}

/// Rolling performance snapshot, copied out on every read
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub current_fps: f32,
    pub average_latency_ms: f32,
    pub p99_latency_ms: f32,
    pub dropped_frames: u64,
    pub total_frames: u64,
    pub processed_frames: u64,
    pub sync_discards: u64,
    pub cpu_usage_percent: f32,
    /// Share of the frame interval spent in the processing stage
    pub gpu_usage_percent: f32,
    pub memory_usage_mb: f32,
    pub temperature_celsius: f32,
    pub power_consumption_watts: f32,
}

/// What the error callback receives
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub error: CameraError,
    pub message: String,
    /// `true` when this report announces that capture resumed
    pub recovered: bool,
}

/// Sensor temperature against the configured limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThermalStatus {
    pub temperature_celsius: f32,
    pub max_temperature: f32,
    pub warning: bool,
    pub shutdown_imminent: bool,
    /// 0 = none, 1 = light, 2 = heavy
    pub throttling_level: u8,
}

impl ThermalStatus {
    pub fn evaluate(temperature_celsius: f32, max_temperature: f32) -> Self {
        let ratio = if max_temperature > 0.0 {
            temperature_celsius / max_temperature
        } else {
            0.0
        };
        let throttling_level = if ratio >= 0.98 {
            2
        } else if ratio >= 0.9 {
            1
        } else {
            0
        };

        Self {
            temperature_celsius,
            max_temperature,
            warning: ratio >= 0.9,
            shutdown_imminent: ratio >= 0.98,
            throttling_level,
        }
    }
}

pub type FrameCallback = Box<dyn Fn(&RgbFrame, &DepthFrame) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&ErrorReport) + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(CameraStatus, &str) + Send + Sync>;

/// Operations every depth camera backend provides.
///
/// Getters block up to the session's `timeout_ms`; status and metrics reads
/// never block. Callbacks run on the camera's own threads and must return
/// quickly. Registering a callback replaces the previous one; `None`
/// clears it.
pub trait Camera: Send + Sync {
    /// Camera type identifier, e.g. `"femto_mega"` or `"d435_sim"`
    fn id(&self) -> &str;

    /// Open the link. Idempotent while connected.
    fn connect(&self) -> Result<()>;

    /// Stop capture and release every device handle
    fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    fn capabilities(&self) -> Option<CameraCapabilities>;

    /// Validate `config` and begin acquisition. An invalid config fails
    /// before any state changes.
    fn start_capture(&self, config: &CameraConfig) -> Result<()>;

    /// Stop acquisition and wake any blocked getter. The device stays
    /// connected.
    fn stop_capture(&self) -> Result<()>;

    fn is_capturing(&self) -> bool {
        self.status() == CameraStatus::Capturing
    }

    /// Next colour/depth pair within the synchronisation tolerance
    fn synchronized_frames(&self) -> Result<(RgbFrame, DepthFrame)>;

    fn rgb_frame(&self) -> Result<RgbFrame>;

    fn depth_frame(&self) -> Result<DepthFrame>;

    fn calibrate(&self) -> Result<()>;

    /// Self-diagnostic: connectivity, temperature, buffered data integrity
    fn validate(&self) -> Result<()>;

    fn status(&self) -> CameraStatus;

    fn last_error(&self) -> Option<CameraError>;

    fn performance_metrics(&self) -> PerformanceMetrics;

    fn thermal_status(&self) -> Option<ThermalStatus>;

    fn set_frame_callback(&self, callback: Option<FrameCallback>);

    fn set_error_callback(&self, callback: Option<ErrorCallback>);

    fn set_status_callback(&self, callback: Option<StatusCallback>);
}
