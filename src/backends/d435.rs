//! Intel RealSense D435 (development hardware)
//!
//! Depth is filtered inline on the acquisition thread. The D435 ships
//! without a usable factory calibration record, so `calibrate` must succeed
//! once per connection before the first capture.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::PipelineBackend;
use crate::camera::Camera;
use crate::capture::{FrameSource, SensorModel};
use crate::error::{CameraError, Result};
use crate::events::Severity;
use crate::pipeline::{CapturePipeline, PipelineSpec};
use crate::Services;

/// Named device options: (option, V4L2 control, min, max, default)
const ADVANCED_OPTIONS: &[(&str, &str, f32, f32, f32)] = &[
    ("emitter_enabled", "Emitter Enabled", 0.0, 1.0, 1.0),
    ("laser_power", "Laser Power", 0.0, 360.0, 150.0),
    ("exposure", "Exposure Time, Absolute", 1.0, 10_000.0, 166.0),
    ("gain", "Gain", 16.0, 248.0, 16.0),
    ("visual_preset", "Visual Preset", 0.0, 5.0, 0.0),
];

fn option_spec(name: &str) -> Option<&'static (&'static str, &'static str, f32, f32, f32)> {
    ADVANCED_OPTIONS.iter().find(|(n, ..)| *n == name)
}

pub struct D435Camera {
    pipeline: CapturePipeline,
    options: Mutex<BTreeMap<&'static str, f32>>,
}

impl D435Camera {
    pub fn new(services: Services) -> Self {
        #[cfg(feature = "v4l2")]
        let source: Box<dyn FrameSource> = Box::new(crate::capture::V4l2Source::new(SensorModel::D435));
        #[cfg(not(feature = "v4l2"))]
        let source: Box<dyn FrameSource> = Box::new(crate::capture::OfflineSource::new(SensorModel::D435));

        Self::with_source(source, services)
    }

    /// D435 behaviour over an arbitrary link
    pub fn with_source(source: Box<dyn FrameSource>, services: Services) -> Self {
        let spec = PipelineSpec {
            camera_type: SensorModel::D435.type_id().to_string(),
            processing_stage: false,
        };
        let options = ADVANCED_OPTIONS.iter().map(|(n, _, _, _, d)| (*n, *d)).collect();

        Self {
            pipeline: CapturePipeline::new(spec, source, services),
            options: Mutex::new(options),
        }
    }

    /// Model, serial, firmware and stream summary
    pub fn device_info(&self) -> String {
        match self.pipeline.capabilities() {
            Some(caps) => format!(
                "{} | serial {} | firmware {} | depth {:.0}-{:.0}mm ±{:.0}mm | {}",
                caps.model_name,
                caps.serial_number,
                caps.firmware_version,
                caps.min_depth_mm,
                caps.max_depth_mm,
                caps.depth_accuracy_mm,
                self.pipeline.status(),
            ),
            None => format!(
                "{} | {}",
                SensorModel::D435.capabilities().model_name,
                self.pipeline.status()
            ),
        }
    }

    /// Set a named option. Only the stored value changes while disconnected.
    pub fn set_advanced_option(&self, name: &str, value: f32) -> Result<()> {
        let Some(&(key, control, min, max, _)) = option_spec(name) else {
            return Err(CameraError::InvalidConfiguration(format!("unknown D435 option '{name}'")));
        };
        if !(min..=max).contains(&value) {
            return Err(CameraError::InvalidConfiguration(format!(
                "{name} = {value} outside {min}..={max}"
            )));
        }

        if self.is_connected() {
            self.pipeline.with_source(|source| source.set_option(control, value))?;
        }
        self.options.lock().insert(key, value);
        debug!("D435 option {} = {}", name, value);
        Ok(())
    }

    /// Current value of a named option, `None` if the name is unknown
    pub fn advanced_option(&self, name: &str) -> Option<f32> {
        self.options.lock().get(name).copied()
    }

    pub fn set_laser_power(&self, enable: bool) -> Result<()> {
        self.set_advanced_option("emitter_enabled", if enable { 1.0 } else { 0.0 })?;
        info!("D435 laser projector {}", if enable { "on" } else { "off" });
        self.pipeline.record(
            Severity::Info,
            "d435",
            format!("laser projector {}", if enable { "enabled" } else { "disabled" }),
        );
        Ok(())
    }

    pub fn is_laser_enabled(&self) -> bool {
        self.advanced_option("emitter_enabled").unwrap_or(0.0) >= 0.5
    }
}

impl PipelineBackend for D435Camera {
    fn pipeline(&self) -> &CapturePipeline {
        &self.pipeline
    }
}
