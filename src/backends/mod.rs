//! Concrete cameras
//!
//! Every backend is a [`CapturePipeline`] around its own [`FrameSource`]
//! plus a handful of family-specific controls. The [`Camera`] contract is
//! implemented once, for anything that exposes a pipeline.
//!
//! [`FrameSource`]: crate::capture::FrameSource

pub mod d435;
pub mod femto_mega;
pub mod simulation;

pub use d435::D435Camera;
pub use femto_mega::{FemtoMegaCamera, PowerMode};
pub use simulation::{SimulationCamera, SimulationOptions, SimulationProfile};

use crate::camera::{
    Camera, CameraStatus, ErrorCallback, FrameCallback, PerformanceMetrics, StatusCallback,
    ThermalStatus,
};
use crate::capture::{CameraCapabilities, DepthFrame, RgbFrame};
use crate::config::CameraConfig;
use crate::error::{CameraError, Result};
use crate::pipeline::CapturePipeline;

/// A camera built on the shared capture engine
pub trait PipelineBackend: Send + Sync {
    fn pipeline(&self) -> &CapturePipeline;

    /// Backend adjustments to a requested config before it is validated
    fn prepare(&self, config: &CameraConfig) -> CameraConfig {
        config.clone()
    }
}

impl<T: PipelineBackend> Camera for T {
    fn id(&self) -> &str {
        self.pipeline().camera_type()
    }

    fn connect(&self) -> Result<()> {
        self.pipeline().connect()
    }

    fn disconnect(&self) -> Result<()> {
        self.pipeline().disconnect()
    }

    fn capabilities(&self) -> Option<CameraCapabilities> {
        self.pipeline().capabilities()
    }

    fn start_capture(&self, config: &CameraConfig) -> Result<()> {
        let config = self.prepare(config);
        self.pipeline().start_capture(&config)
    }

    fn stop_capture(&self) -> Result<()> {
        self.pipeline().stop_capture()
    }

    fn synchronized_frames(&self) -> Result<(RgbFrame, DepthFrame)> {
        self.pipeline().synchronized_frames()
    }

    fn rgb_frame(&self) -> Result<RgbFrame> {
        self.pipeline().rgb_frame()
    }

    fn depth_frame(&self) -> Result<DepthFrame> {
        self.pipeline().depth_frame()
    }

    fn calibrate(&self) -> Result<()> {
        self.pipeline().calibrate()
    }

    fn validate(&self) -> Result<()> {
        self.pipeline().validate()
    }

    fn status(&self) -> CameraStatus {
        self.pipeline().status()
    }

    fn last_error(&self) -> Option<CameraError> {
        self.pipeline().last_error()
    }

    fn performance_metrics(&self) -> PerformanceMetrics {
        self.pipeline().performance_metrics()
    }

    fn thermal_status(&self) -> Option<ThermalStatus> {
        self.pipeline().thermal_status()
    }

    fn set_frame_callback(&self, callback: Option<FrameCallback>) {
        self.pipeline().set_frame_callback(callback)
    }

    fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        self.pipeline().set_error_callback(callback)
    }

    fn set_status_callback(&self, callback: Option<StatusCallback>) {
        self.pipeline().set_status_callback(callback)
    }
}
