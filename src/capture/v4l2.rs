//! V4L2 link for UVC depth cameras
//!
//! RealSense and Orbbec cameras enumerate as several capture nodes on one
//! USB device: a depth node (`Z16`/`Y16`) and a colour node (`YUYV`/`MJPG`).
//! [`V4l2Source`] opens both and reads them back to back.

use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::capabilities::{CameraCapabilities, SensorModel};
use super::frame::{Intrinsics, PixelFormat};
use super::source::{DepthPayload, FrameSource, RawColor, RawDepth, RawFrameset};
use crate::config::CameraConfig;
use crate::error::{CameraError, Result};
use crate::utils::{self, FoundDevice, SensorNodes};

const STREAM_BUFFERS: u32 = 4;

struct Node {
    info: FoundDevice,
    format: PixelFormat,
    width: u32,
    height: u32,
    device: Device,
    stream: Option<MmapStream<'static>>,
}

impl Node {
    fn open(info: FoundDevice, format: PixelFormat) -> Result<Self> {
        let device = Device::with_path(&info.path)
            .map_err(|e| CameraError::ConnectionFailed(format!("{}: {e}", info.path)))?;
        Ok(Self {
            info,
            format,
            width: 0,
            height: 0,
            device,
            stream: None,
        })
    }

    fn start(&mut self, width: u32, height: u32, fps: u32, timeout: Duration) -> Result<()> {
        let init = |e: io::Error| CameraError::InitializationFailed(format!("{}: {e}", self.info.path));

        let mut fmt = self.device.format().map_err(init)?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = fourcc(self.format);
        let applied = self.device.set_format(&fmt).map_err(init)?;
        if applied.width != width || applied.height != height || applied.fourcc != fmt.fourcc {
            return Err(CameraError::InvalidConfiguration(format!(
                "{} refused {}x{} {:?}, got {}x{} {}",
                self.info.path, width, height, self.format, applied.width, applied.height, applied.fourcc
            )));
        }

        let mut params = self.device.params().map_err(init)?;
        params.interval = v4l::Fraction::new(1, fps);
        if let Err(e) = self.device.set_params(&params) {
            warn!("{}: frame interval not applied: {}", self.info.path, e);
        }

        let mut stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, STREAM_BUFFERS).map_err(init)?;
        stream.set_timeout(timeout);
        self.stream = Some(stream);
        self.width = width;
        self.height = height;

        info!("{} streaming {}x{} {:?} @ {}fps", self.info.path, width, height, self.format, fps);
        Ok(())
    }

    fn next(&mut self) -> Result<(Bytes, Instant, Duration)> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::StreamClosed(format!("{} not streaming", self.info.path)))?;

        let (buf, meta) = stream.next().map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                CameraError::Timeout(format!("{}: no frame", self.info.path))
            }
            io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe => {
                CameraError::HardwareFault(format!("{}: {e}", self.info.path))
            }
            _ => CameraError::CaptureFailed(format!("{}: {e}", self.info.path)),
        })?;

        let captured_at = Instant::now();
        let device_ts = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);
        let used = (meta.bytesused as usize).min(buf.len());
        Ok((Bytes::copy_from_slice(&buf[..used]), captured_at, device_ts))
    }

    fn set_control(&self, name: &str, value: f32) -> Result<bool> {
        let controls = self
            .device
            .query_controls()
            .map_err(|e| CameraError::HardwareFault(format!("{}: {e}", self.info.path)))?;

        let Some(desc) = controls.iter().find(|c| c.name.eq_ignore_ascii_case(name)) else {
            return Ok(false);
        };

        self.device
            .set_control(Control {
                id: desc.id,
                value: Value::Integer(value.round() as i64),
            })
            .map_err(|e| CameraError::InvalidConfiguration(format!("{name}: {e}")))?;
        debug!("{}: {} = {}", self.info.path, name, value);
        Ok(true)
    }
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Z16 => FourCC::new(b"Z16 "),
        PixelFormat::Y16 => FourCC::new(b"Y16 "),
    }
}

/// Frame source for one physical camera reached through V4L2
pub struct V4l2Source {
    model: SensorModel,
    device_id: String,
    color: Option<Node>,
    depth: Option<Node>,
    streaming_color: bool,
    streaming_depth: bool,
}

impl V4l2Source {
    pub fn new(model: SensorModel) -> Self {
        Self {
            model,
            device_id: model.type_id().to_string(),
            color: None,
            depth: None,
            streaming_color: false,
            streaming_depth: false,
        }
    }

    fn discover(&self) -> Result<SensorNodes> {
        let devices = utils::enumerate_devices();
        utils::find_sensors(self.model, &devices)
            .into_iter()
            .find(SensorNodes::is_complete)
            .ok_or_else(|| CameraError::DeviceNotFound(format!("no {} on any V4L2 node", self.model)))
    }
}

impl FrameSource for V4l2Source {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    #[instrument(skip(self), fields(model = %self.model))]
    fn open(&mut self) -> Result<CameraCapabilities> {
        let sensor = self.discover()?;
        let (Some(color), Some(depth)) = (sensor.color, sensor.depth) else {
            return Err(CameraError::DeviceNotFound(format!("{} is missing a stream node", self.model)));
        };

        let color_format = color
            .color_format()
            .ok_or_else(|| CameraError::InitializationFailed("colour node has no usable format".into()))?;
        let depth_format = depth
            .depth_format()
            .ok_or_else(|| CameraError::InitializationFailed("depth node has no depth format".into()))?;

        let mut caps = self.model.capabilities();
        caps.serial_number = sensor.serial.clone();
        caps.firmware_version = format!("{} ({})", depth.driver, depth.card);

        self.device_id = format!("{}-{}", self.model.type_id(), sensor.serial);
        self.color = Some(Node::open(color, color_format)?);
        self.depth = Some(Node::open(depth, depth_format)?);

        info!("Opened {} serial {}", caps.model_name, caps.serial_number);
        Ok(caps)
    }

    fn is_open(&self) -> bool {
        self.color.is_some() && self.depth.is_some()
    }

    fn start(&mut self, config: &CameraConfig) -> Result<()> {
        let (Some(color), Some(depth)) = (self.color.as_mut(), self.depth.as_mut()) else {
            return Err(CameraError::ConnectionFailed("device not open".into()));
        };

        let timeout = config.timeout();
        if config.enable_depth {
            depth.start(config.width, config.height, config.fps, timeout)?;
        }
        if config.enable_color {
            color.start(config.width, config.height, config.fps, timeout)?;
        }
        self.streaming_depth = config.enable_depth;
        self.streaming_color = config.enable_color;

        if !config.auto_exposure {
            let _ = color.set_control("Auto Exposure", 1.0);
            if let Err(e) = color.set_control("Exposure Time, Absolute", config.exposure_value as f32) {
                warn!("Manual exposure not applied: {}", e);
            }
        }
        let _ = color.set_control(
            "White Balance Temperature, Auto",
            if config.auto_white_balance { 1.0 } else { 0.0 },
        );
        Ok(())
    }

    fn read(&mut self, _timeout: Duration) -> Result<RawFrameset> {
        let mut frames = RawFrameset::default();

        if self.streaming_depth {
            if let Some(node) = self.depth.as_mut() {
                let (data, captured_at, device_ts) = node.next()?;
                frames.depth = Some(RawDepth {
                    payload: DepthPayload::Packed(data, node.format),
                    width: node.width,
                    height: node.height,
                    captured_at,
                    device_timestamp: Some(device_ts),
                    transport_crc: None,
                });
            }
        }

        if self.streaming_color {
            if let Some(node) = self.color.as_mut() {
                let (data, captured_at, device_ts) = node.next()?;
                frames.color = Some(RawColor {
                    data,
                    format: node.format,
                    width: node.width,
                    height: node.height,
                    captured_at,
                    device_timestamp: Some(device_ts),
                    transport_crc: None,
                });
            }
        }

        Ok(frames)
    }

    fn stop(&mut self) {
        for node in [self.color.as_mut(), self.depth.as_mut()].into_iter().flatten() {
            node.stream = None;
        }
        self.streaming_color = false;
        self.streaming_depth = false;
    }

    fn close(&mut self) {
        self.stop();
        self.color = None;
        self.depth = None;
    }

    fn temperature(&self) -> Option<f32> {
        // UVC exposes no standard temperature control
        None
    }

    fn intrinsics(&self, width: u32, height: u32) -> Intrinsics {
        let (h, v) = self.model.depth_fov();
        Intrinsics::from_fov(width, height, h, v)
    }

    fn calibrate(&mut self, width: u32, height: u32) -> Result<Intrinsics> {
        if !self.is_open() {
            return Err(CameraError::CalibrationError("device not open".into()));
        }
        Ok(self.intrinsics(width, height))
    }

    fn self_test(&mut self) -> Result<()> {
        for node in [self.color.as_ref(), self.depth.as_ref()].into_iter().flatten() {
            node.device
                .query_caps()
                .map_err(|e| CameraError::HardwareFault(format!("{}: {e}", node.info.path)))?;
        }
        Ok(())
    }

    fn set_option(&mut self, name: &str, value: f32) -> Result<()> {
        for node in [self.depth.as_ref(), self.color.as_ref()].into_iter().flatten() {
            if node.set_control(name, value)? {
                return Ok(());
            }
        }
        Err(CameraError::InvalidConfiguration(format!(
            "option '{name}' not exposed by {}",
            self.device_id
        )))
    }
}
