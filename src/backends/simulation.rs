//! Simulated depth cameras for tests and hardware-less demos.
//!
//! [`SimulationCamera`] runs the same capture engine as the device backends
//! over a synthetic [`FrameSource`]: a floor plane with a person-sized
//! object drifting across it, depth noise, a sprinkle of holes and a slowly
//! warming sensor. Faults, acquisition delay, thermal drift and transport
//! corruption can be injected at runtime.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use depthcam::{Camera, CameraConfig, CameraError, Services, SimulationCamera, SimulationProfile};
//!
//! let camera = SimulationCamera::new(SimulationProfile::FemtoMega, Services::default());
//! camera.connect().unwrap();
//! camera.start_capture(&CameraConfig::default()).unwrap();
//!
//! camera.inject_fault(CameraError::HardwareFault("cable".into()), Duration::from_secs(2));
//! ```

use std::f32::consts::TAU;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::PipelineBackend;
use crate::capture::frame::depth_checksum;
use crate::capture::{
    CameraCapabilities, DepthPayload, FrameSource, Intrinsics, PixelFormat, RawColor, RawDepth,
    RawFrameset, SensorModel,
};
use crate::config::CameraConfig;
use crate::error::{CameraError, Result};
use crate::events::Severity;
use crate::pipeline::{CapturePipeline, PipelineSpec};
use crate::Services;

// ────────────────────────────────────────────────────────────────────────────
// Profiles and options
// ────────────────────────────────────────────────────────────────────────────

/// Which device a simulator impersonates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationProfile {
    D435,
    FemtoMega,
}

impl SimulationProfile {
    pub const ALL: [SimulationProfile; 2] = [SimulationProfile::D435, SimulationProfile::FemtoMega];

    pub fn model(self) -> SensorModel {
        match self {
            SimulationProfile::D435 => SensorModel::D435,
            SimulationProfile::FemtoMega => SensorModel::FemtoMega,
        }
    }

    /// Camera type identifier, e.g. `"femto_mega_sim"`
    pub fn type_id(self) -> &'static str {
        match self {
            SimulationProfile::D435 => "d435_sim",
            SimulationProfile::FemtoMega => "femto_mega_sim",
        }
    }

    pub fn from_type_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.type_id() == id)
    }

    pub fn serial(self) -> &'static str {
        match self {
            SimulationProfile::D435 => "SIM001",
            SimulationProfile::FemtoMega => "SIM002",
        }
    }

    /// The impersonated device's capabilities with a simulator identity
    pub fn capabilities(self) -> CameraCapabilities {
        let mut caps = self.model().capabilities();
        caps.model_name = format!("{} (Simulation)", caps.model_name);
        caps.serial_number = self.serial().to_string();
        caps.firmware_version = concat!("sim-", env!("CARGO_PKG_VERSION")).to_string();
        caps.factory_calibrated = true;
        caps.requires_recalibration = false;
        caps
    }
}

impl fmt::Display for SimulationProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_id())
    }
}

/// Knobs fixed at construction
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOptions {
    /// Same seed, same noise and holes
    pub seed: Option<u64>,
    /// Peak depth noise in millimetres
    pub depth_noise_mm: f32,
    pub base_temperature: f32,
    pub thermal_drift_c_per_min: f32,
    /// Extra latency on every read
    pub acquisition_delay: Duration,
    /// Depth stream captured this much earlier than colour
    pub depth_clock_offset: Duration,
    /// Random per-frame timestamp jitter, up to this much
    pub timestamp_jitter: Duration,
    /// Report a calibration older than the recalibration interval
    pub stale_calibration: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            seed: None,
            depth_noise_mm: 2.0,
            base_temperature: 35.0,
            thermal_drift_c_per_min: 0.0,
            acquisition_delay: Duration::ZERO,
            depth_clock_offset: Duration::ZERO,
            timestamp_jitter: Duration::ZERO,
            stale_calibration: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Runtime controls
// ────────────────────────────────────────────────────────────────────────────

struct ControlState {
    fault: Option<(CameraError, Instant)>,
    acquisition_delay: Duration,
    corrupt_frames: u32,
    base_temperature: f32,
    base_at: Instant,
    drift_c_per_min: f32,
}

/// Shared between a [`SimulationCamera`] and its source
struct SimControls {
    state: Mutex<ControlState>,
}

impl SimControls {
    fn new(options: &SimulationOptions) -> Self {
        Self {
            state: Mutex::new(ControlState {
                fault: None,
                acquisition_delay: options.acquisition_delay,
                corrupt_frames: 0,
                base_temperature: options.base_temperature,
                base_at: Instant::now(),
                drift_c_per_min: options.thermal_drift_c_per_min,
            }),
        }
    }

    /// The injected fault, if still active
    fn active_fault(&self) -> Option<CameraError> {
        let mut state = self.state.lock();
        if matches!(&state.fault, Some((_, until)) if Instant::now() >= *until) {
            state.fault = None;
            debug!("Injected fault expired");
        }
        state.fault.as_ref().map(|(error, _)| error.clone())
    }

    fn temperature(&self) -> f32 {
        let state = self.state.lock();
        let minutes = state.base_at.elapsed().as_secs_f32() / 60.0;
        state.base_temperature + state.drift_c_per_min * minutes
    }

    /// Restart the drift curve from the current temperature
    fn rebase_temperature(&self, base: Option<f32>, drift: Option<f32>) {
        let current = self.temperature();
        let mut state = self.state.lock();
        state.base_temperature = base.unwrap_or(current);
        state.base_at = Instant::now();
        if let Some(drift) = drift {
            state.drift_c_per_min = drift;
        }
    }

    fn take_corruption(&self) -> bool {
        let mut state = self.state.lock();
        if state.corrupt_frames > 0 {
            state.corrupt_frames -= 1;
            true
        } else {
            false
        }
    }

    fn acquisition_delay(&self) -> Duration {
        self.state.lock().acquisition_delay
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Synthetic frame source
// ────────────────────────────────────────────────────────────────────────────

struct Streaming {
    width: u32,
    height: u32,
    interval: Duration,
    color: bool,
    depth: bool,
    started: Instant,
    next_due: Instant,
    frame_index: u64,
}

pub(crate) struct SimulatedSource {
    profile: SimulationProfile,
    options: SimulationOptions,
    controls: Arc<SimControls>,
    rng: fastrand::Rng,
    open: bool,
    streaming: Option<Streaming>,
}

impl SimulatedSource {
    fn new(profile: SimulationProfile, options: SimulationOptions, controls: Arc<SimControls>) -> Self {
        let rng = match options.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self {
            profile,
            options,
            controls,
            rng,
            open: false,
            streaming: None,
        }
    }

    /// Stand-alone source with default controls, for driving device
    /// backends without hardware
    #[cfg(test)]
    pub(crate) fn standalone(profile: SimulationProfile, options: SimulationOptions) -> Self {
        let controls = Arc::new(SimControls::new(&options));
        Self::new(profile, options, controls)
    }

    fn check_fault(&self) -> Result<()> {
        match self.controls.active_fault() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn jitter(&mut self) -> Duration {
        let max = self.options.timestamp_jitter.as_micros() as u64;
        if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.rng.u64(0..=max))
        }
    }

    /// One colour/depth pair of the synthetic scene
    fn render(&mut self, stream: &Streaming) -> (Vec<u8>, Vec<u16>) {
        let (w, h) = (stream.width as usize, stream.height as usize);
        let t = stream.frame_index as f32 * stream.interval.as_secs_f32();
        let noise = self.options.depth_noise_mm;

        // Person-sized ellipse swaying left and right
        let cx = w as f32 / 2.0 + w as f32 / 4.0 * (t * TAU / 8.0).sin();
        let cy = h as f32 / 2.0;
        let rx = (w as f32 / 8.0).max(1.0);
        let ry = (h as f32 / 3.0).max(1.0);

        let mut rgb = Vec::with_capacity(w * h * 3);
        let mut depth = Vec::with_capacity(w * h);
        for y in 0..h {
            let floor_mm = 3000.0 - 1000.0 * (y as f32 / h as f32);
            for x in 0..w {
                let dx = (x as f32 - cx) / rx;
                let dy = (y as f32 - cy) / ry;
                let person = dx * dx + dy * dy <= 1.0;

                let base = if person { 1500.0 } else { floor_mm };
                let d = if self.rng.f32() < 0.01 {
                    0
                } else {
                    (base + (self.rng.f32() * 2.0 - 1.0) * noise).max(0.0) as u16
                };
                depth.push(d);

                if person {
                    rgb.extend_from_slice(&[200, 160, 140]);
                } else {
                    let shade = (64 + (y * 128 / h.max(1))) as u8;
                    rgb.extend_from_slice(&[shade, shade, (shade / 2).saturating_add(40)]);
                }
            }
        }
        (rgb, depth)
    }
}

impl FrameSource for SimulatedSource {
    fn device_id(&self) -> &str {
        self.profile.serial()
    }

    fn open(&mut self) -> Result<CameraCapabilities> {
        self.check_fault()?;

        let mut caps = self.profile.capabilities();
        if self.options.stale_calibration {
            caps.factory_calibrated = false;
            caps.calibration_date = Some(
                chrono::Local::now().date_naive()
                    - chrono::Duration::days(crate::capture::RECALIBRATION_INTERVAL_DAYS + 35),
            );
        }
        self.open = true;
        debug!(profile = %self.profile, "simulated device opened");
        Ok(caps)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn start(&mut self, config: &CameraConfig) -> Result<()> {
        if !self.open {
            return Err(CameraError::ConnectionFailed("simulated device not open".into()));
        }
        self.check_fault()?;

        let now = Instant::now();
        self.streaming = Some(Streaming {
            width: config.width,
            height: config.height,
            interval: config.frame_interval(),
            color: config.enable_color,
            depth: config.enable_depth,
            started: now,
            next_due: now,
            frame_index: 0,
        });
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<RawFrameset> {
        self.check_fault()?;
        let Some(mut stream) = self.streaming.take() else {
            return Err(CameraError::CaptureFailed("simulated stream not started".into()));
        };

        let now = Instant::now();
        let wait = stream.next_due.saturating_duration_since(now) + self.controls.acquisition_delay();
        if wait > timeout {
            thread::sleep(timeout);
            self.streaming = Some(stream);
            return Err(CameraError::Timeout(format!(
                "no simulated frame within {}ms",
                timeout.as_millis()
            )));
        }
        thread::sleep(wait);

        // Fell behind: skip ahead rather than burst
        let now = Instant::now();
        stream.next_due += stream.interval;
        if stream.next_due < now {
            stream.next_due = now + stream.interval;
        }

        let (rgb, depth) = self.render(&stream);
        let device_timestamp = Some(now - stream.started);
        let corrupt = self.controls.take_corruption();
        let mut frames = RawFrameset::default();

        if stream.depth {
            let mut depth = depth;
            let crc = depth_checksum(&depth);
            if corrupt {
                depth[0] ^= 0x5a5a;
            }
            let lag = self.options.depth_clock_offset + self.jitter();
            let captured_at = now.checked_sub(lag).unwrap_or(now);
            frames.depth = Some(RawDepth {
                payload: DepthPayload::Unpacked(depth),
                width: stream.width,
                height: stream.height,
                captured_at,
                device_timestamp,
                transport_crc: Some(crc),
            });
        }

        if stream.color {
            let mut rgb = rgb;
            let crc = crc32fast::hash(&rgb);
            if corrupt && !stream.depth {
                rgb[0] ^= 0xff;
            }
            let lag = self.jitter();
            let captured_at = now.checked_sub(lag).unwrap_or(now);
            frames.color = Some(RawColor {
                data: Bytes::from(rgb),
                format: PixelFormat::Rgb24,
                width: stream.width,
                height: stream.height,
                captured_at,
                device_timestamp,
                transport_crc: Some(crc),
            });
        }

        stream.frame_index += 1;
        self.streaming = Some(stream);
        Ok(frames)
    }

    fn stop(&mut self) {
        self.streaming = None;
    }

    fn close(&mut self) {
        self.streaming = None;
        self.open = false;
    }

    fn temperature(&self) -> Option<f32> {
        self.open.then(|| self.controls.temperature())
    }

    fn intrinsics(&self, width: u32, height: u32) -> Intrinsics {
        let (h, v) = self.profile.model().depth_fov();
        Intrinsics::from_fov(width, height, h, v)
    }

    fn calibrate(&mut self, width: u32, height: u32) -> Result<Intrinsics> {
        if !self.open {
            return Err(CameraError::CalibrationError("simulated device not open".into()));
        }
        self.check_fault()?;
        Ok(self.intrinsics(width, height))
    }

    fn self_test(&mut self) -> Result<()> {
        if !self.open {
            return Err(CameraError::ConnectionFailed("simulated device not open".into()));
        }
        self.check_fault()
    }

    fn set_option(&mut self, name: &str, value: f32) -> Result<()> {
        debug!(profile = %self.profile, "simulated option {} = {}", name, value);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Camera
// ────────────────────────────────────────────────────────────────────────────

pub struct SimulationCamera {
    profile: SimulationProfile,
    pipeline: CapturePipeline,
    controls: Arc<SimControls>,
}

impl SimulationCamera {
    pub fn new(profile: SimulationProfile, services: Services) -> Self {
        Self::with_options(profile, SimulationOptions::default(), services)
    }

    pub fn with_options(profile: SimulationProfile, options: SimulationOptions, services: Services) -> Self {
        let controls = Arc::new(SimControls::new(&options));
        let source = SimulatedSource::new(profile, options, controls.clone());
        let spec = PipelineSpec {
            camera_type: profile.type_id().to_string(),
            processing_stage: profile == SimulationProfile::FemtoMega,
        };

        info!("Simulation camera created ({})", profile);
        Self {
            profile,
            pipeline: CapturePipeline::new(spec, Box::new(source), services),
            controls,
        }
    }

    pub fn profile(&self) -> SimulationProfile {
        self.profile
    }

    /// Make every device call fail with `error` for `duration`
    pub fn inject_fault(&self, error: CameraError, duration: Duration) {
        info!("Injecting {} for {}ms", error.name(), duration.as_millis());
        self.pipeline.record(
            Severity::Warning,
            "simulation",
            format!("fault injected: {} for {}ms", error.name(), duration.as_millis()),
        );
        self.controls.state.lock().fault = Some((error, Instant::now() + duration));
    }

    pub fn clear_fault(&self) {
        self.controls.state.lock().fault = None;
    }

    pub fn set_acquisition_delay(&self, delay: Duration) {
        self.controls.state.lock().acquisition_delay = delay;
    }

    pub fn set_thermal_drift(&self, c_per_min: f32) {
        self.controls.rebase_temperature(None, Some(c_per_min));
    }

    /// Jump the sensor to `celsius`; drift continues from there
    pub fn set_temperature(&self, celsius: f32) {
        self.controls.rebase_temperature(Some(celsius), None);
    }

    /// Corrupt the payload of the next `n` frames after the link CRC
    pub fn corrupt_next_frames(&self, n: u32) {
        self.controls.state.lock().corrupt_frames = n;
    }

    pub fn set_filter_level(&self, level: u8) {
        self.pipeline.set_filter_level(level);
    }
}

impl PipelineBackend for SimulationCamera {
    fn pipeline(&self) -> &CapturePipeline {
        &self.pipeline
    }
}
