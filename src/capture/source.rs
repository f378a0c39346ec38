//! Vendor link abstraction
//!
//! A [`FrameSource`] is the thin layer that talks to one sensor family and
//! hands back raw, vendor-native frames. Everything above it (conversion,
//! checksums, buffering, watchdog, recovery) lives in the capture engine
//! and is shared by every backend.

use std::time::{Duration, Instant};

use bytes::Bytes;

use super::capabilities::{CameraCapabilities, SensorModel};
use super::frame::{Intrinsics, PixelFormat};
use crate::config::CameraConfig;
use crate::error::{CameraError, Result};

/// Colour payload as it came off the link
#[derive(Debug, Clone)]
pub struct RawColor {
    pub data: Bytes,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    pub device_timestamp: Option<Duration>,
    /// CRC computed by the link before transfer, if it provides one
    pub transport_crc: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum DepthPayload {
    /// Little-endian bytes in a depth pixel format
    Packed(Bytes, PixelFormat),
    Unpacked(Vec<u16>),
}

/// Depth payload as it came off the link
#[derive(Debug, Clone)]
pub struct RawDepth {
    pub payload: DepthPayload,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    pub device_timestamp: Option<Duration>,
    pub transport_crc: Option<u32>,
}

/// Whatever the link produced in one read. Streams are clocked
/// independently, so either half may be missing.
#[derive(Debug, Clone, Default)]
pub struct RawFrameset {
    pub color: Option<RawColor>,
    pub depth: Option<RawDepth>,
}

pub trait FrameSource: Send {
    /// Stable device identifier stamped on every frame
    fn device_id(&self) -> &str;

    /// Open the device and query its capabilities
    fn open(&mut self) -> Result<CameraCapabilities>;

    fn is_open(&self) -> bool;

    /// Configure and start streaming
    fn start(&mut self, config: &CameraConfig) -> Result<()>;

    /// Block up to `timeout` for the next frames
    fn read(&mut self, timeout: Duration) -> Result<RawFrameset>;

    /// Stop streaming, keep the device open
    fn stop(&mut self);

    /// Release the device handle
    fn close(&mut self);

    /// Sensor temperature in Celsius, if the link exposes it
    fn temperature(&self) -> Option<f32>;

    /// Depth intrinsics for a stream resolution
    fn intrinsics(&self, width: u32, height: u32) -> Intrinsics;

    /// Run the family's calibration routine and return refined intrinsics
    fn calibrate(&mut self, width: u32, height: u32) -> Result<Intrinsics>;

    /// Link-level diagnostic on an open device
    fn self_test(&mut self) -> Result<()>;

    fn set_option(&mut self, name: &str, _value: f32) -> Result<()> {
        Err(CameraError::InvalidConfiguration(format!(
            "option '{name}' not supported by {}",
            self.device_id()
        )))
    }
}

/// Stand-in link for builds without a hardware transport
pub struct OfflineSource {
    model: SensorModel,
}

impl OfflineSource {
    pub fn new(model: SensorModel) -> Self {
        Self { model }
    }

    fn unavailable(&self) -> CameraError {
        CameraError::DeviceNotFound(format!("{} support not compiled in", self.model))
    }
}

impl FrameSource for OfflineSource {
    fn device_id(&self) -> &str {
        self.model.type_id()
    }

    fn open(&mut self) -> Result<CameraCapabilities> {
        Err(self.unavailable())
    }

    fn is_open(&self) -> bool {
        false
    }

    fn start(&mut self, _config: &CameraConfig) -> Result<()> {
        Err(self.unavailable())
    }

    fn read(&mut self, _timeout: Duration) -> Result<RawFrameset> {
        Err(self.unavailable())
    }

    fn stop(&mut self) {}

    fn close(&mut self) {}

    fn temperature(&self) -> Option<f32> {
        None
    }

    fn intrinsics(&self, width: u32, height: u32) -> Intrinsics {
        let (h, v) = self.model.depth_fov();
        Intrinsics::from_fov(width, height, h, v)
    }

    fn calibrate(&mut self, _width: u32, _height: u32) -> Result<Intrinsics> {
        Err(self.unavailable())
    }

    fn self_test(&mut self) -> Result<()> {
        Err(self.unavailable())
    }
}
