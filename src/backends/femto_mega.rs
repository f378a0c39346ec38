//! ORBBEC Femto Mega (production hardware)
//!
//! Depth filtering runs on a dedicated processing thread so heavier filter
//! levels never stall acquisition. The Femto also offers power modes and
//! ships factory calibrated.

use std::fmt;
use std::str::FromStr;

use crossbeam::atomic::AtomicCell;
use tracing::info;

use super::PipelineBackend;
use crate::camera::Camera;
use crate::capture::{FrameSource, SensorModel};
use crate::config::CameraConfig;
use crate::error::{CameraError, Result};
use crate::events::Severity;
use crate::pipeline::{CapturePipeline, PipelineSpec, MAX_FILTER_LEVEL};
use crate::Services;

/// Highest frame rate allowed in [`PowerMode::PowerSave`]
pub const POWER_SAVE_MAX_FPS: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerMode {
    Performance,
    #[default]
    Balanced,
    PowerSave,
}

impl PowerMode {
    /// Share of nominal power draw
    pub fn power_scale(self) -> f32 {
        match self {
            PowerMode::Performance => 1.0,
            PowerMode::Balanced => 0.85,
            PowerMode::PowerSave => 0.6,
        }
    }
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerMode::Performance => "performance",
            PowerMode::Balanced => "balanced",
            PowerMode::PowerSave => "power_save",
        })
    }
}

impl FromStr for PowerMode {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "performance" => Ok(PowerMode::Performance),
            "balanced" => Ok(PowerMode::Balanced),
            "power_save" => Ok(PowerMode::PowerSave),
            other => Err(CameraError::InvalidConfiguration(format!("unknown power mode '{other}'"))),
        }
    }
}

pub struct FemtoMegaCamera {
    pipeline: CapturePipeline,
    power_mode: AtomicCell<PowerMode>,
    filter_level: AtomicCell<Option<u8>>,
}

impl FemtoMegaCamera {
    pub fn new(services: Services) -> Self {
        #[cfg(feature = "v4l2")]
        let source: Box<dyn FrameSource> =
            Box::new(crate::capture::V4l2Source::new(SensorModel::FemtoMega));
        #[cfg(not(feature = "v4l2"))]
        let source: Box<dyn FrameSource> =
            Box::new(crate::capture::OfflineSource::new(SensorModel::FemtoMega));

        Self::with_source(source, services)
    }

    pub fn with_source(source: Box<dyn FrameSource>, services: Services) -> Self {
        let spec = PipelineSpec {
            camera_type: SensorModel::FemtoMega.type_id().to_string(),
            processing_stage: true,
        };
        let pipeline = CapturePipeline::new(spec, source, services);
        pipeline.set_power_scale(PowerMode::default().power_scale());

        Self {
            pipeline,
            power_mode: AtomicCell::new(PowerMode::default()),
            filter_level: AtomicCell::new(None),
        }
    }

    /// Depth filter strength 0 (off) to 5. Applies to the running session
    /// from the next frame and overrides `filter_level` of later configs.
    pub fn set_depth_filtering(&self, level: u8) -> Result<()> {
        if level > MAX_FILTER_LEVEL {
            return Err(CameraError::InvalidConfiguration(format!(
                "filter level {level} outside 0..={MAX_FILTER_LEVEL}"
            )));
        }
        self.filter_level.store(Some(level));
        self.pipeline.set_filter_level(level);
        info!("Femto Mega depth filtering level {}", level);
        Ok(())
    }

    pub fn depth_filtering(&self) -> u8 {
        self.pipeline.filter_level()
    }

    /// Takes effect on the next `start_capture`; power accounting changes
    /// at once.
    pub fn set_power_mode(&self, mode: PowerMode) {
        let previous = self.power_mode.swap(mode);
        self.pipeline.set_power_scale(mode.power_scale());
        if previous != mode {
            self.pipeline.record(
                Severity::Info,
                "femto_mega",
                format!("power mode {previous} -> {mode}"),
            );
        }
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power_mode.load()
    }

    /// Human-readable calibration record
    pub fn calibration_certificate(&self) -> String {
        let Some(caps) = self.pipeline.capabilities() else {
            return "Femto Mega not connected, calibration unknown".into();
        };

        let calibrated = match caps.calibration_date {
            Some(date) => format!("calibrated {date}"),
            None if caps.factory_calibrated => "factory calibrated".into(),
            None => "not calibrated".into(),
        };
        format!(
            "{} serial {} firmware {}: {}, accuracy ±{:.1}mm over {:.0}-{:.0}mm{}",
            caps.model_name,
            caps.serial_number,
            caps.firmware_version,
            calibrated,
            caps.depth_accuracy_mm,
            caps.min_depth_mm,
            caps.max_depth_mm,
            if caps.requires_recalibration { ", RECALIBRATION REQUIRED" } else { "" },
        )
    }

    /// Deployment gate: connected, medical grade, calibrated, self-test passes
    pub fn validate_production_readiness(&self) -> Result<()> {
        let caps = self
            .pipeline
            .capabilities()
            .ok_or_else(|| CameraError::ConnectionFailed("Femto Mega not connected".into()))?;

        if !caps.is_medical_grade {
            return Err(CameraError::SafetyViolation(format!(
                "{} is not medical grade",
                caps.model_name
            )));
        }
        if caps.requires_recalibration {
            return Err(CameraError::CalibrationError(format!(
                "{} calibration is missing or stale",
                caps.model_name
            )));
        }
        if caps.firmware_version.is_empty() {
            return Err(CameraError::FirmwareError("firmware version unavailable".into()));
        }
        self.validate()
    }
}

impl PipelineBackend for FemtoMegaCamera {
    fn pipeline(&self) -> &CapturePipeline {
        &self.pipeline
    }

    fn prepare(&self, config: &CameraConfig) -> CameraConfig {
        let mut config = config.clone();
        if let Some(level) = self.filter_level.load() {
            config.filter_level = level;
        }
        // Only a rate the device offers is capped; anything else is left for
        // validation to reject
        let supported = self
            .pipeline
            .capabilities()
            .is_some_and(|caps| caps.supports_fps(config.fps));
        if self.power_mode.load() == PowerMode::PowerSave
            && supported
            && config.fps > POWER_SAVE_MAX_FPS
        {
            info!("Power save: {} fps capped to {}", config.fps, POWER_SAVE_MAX_FPS);
            config.fps = POWER_SAVE_MAX_FPS;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulation::SimulatedSource;
    use crate::backends::SimulationOptions;
    use crate::backends::SimulationProfile;
    use crate::camera::CameraStatus;

    fn femto() -> FemtoMegaCamera {
        let source = SimulatedSource::standalone(SimulationProfile::FemtoMega, SimulationOptions::default());
        FemtoMegaCamera::with_source(Box::new(source), Services::default())
    }

    #[test]
    fn power_mode_parses() {
        assert_eq!("power_save".parse::<PowerMode>().unwrap(), PowerMode::PowerSave);
        assert_eq!(PowerMode::Performance.to_string(), "performance");
        assert!("turbo".parse::<PowerMode>().is_err());
    }

    #[test]
    fn power_save_caps_frame_rate() {
        let camera = femto();
        camera.connect().unwrap();
        let config = CameraConfig::default();
        assert_eq!(camera.prepare(&config).fps, 30);

        camera.set_power_mode(PowerMode::PowerSave);
        assert_eq!(camera.prepare(&config).fps, POWER_SAVE_MAX_FPS);

        let slow = CameraConfig {
            fps: 5,
            ..Default::default()
        };
        assert_eq!(camera.prepare(&slow).fps, 5);
    }

    #[test]
    fn power_save_still_rejects_unsupported_rate() {
        let camera = femto();
        camera.connect().unwrap();
        camera.set_power_mode(PowerMode::PowerSave);

        let fast = CameraConfig {
            width: 320,
            height: 288,
            fps: 60,
            ..Default::default()
        };
        assert_eq!(camera.prepare(&fast).fps, 60);
        assert!(matches!(
            camera.start_capture(&fast),
            Err(CameraError::InvalidConfiguration(_))
        ));
        assert_eq!(camera.status(), CameraStatus::Connected);

        let supported = CameraConfig { fps: 30, ..fast };
        camera.start_capture(&supported).unwrap();
        camera.stop_capture().unwrap();
    }

    #[test]
    fn filter_level_is_bounded_and_sticky() {
        let camera = femto();
        assert!(camera.set_depth_filtering(6).is_err());

        camera.set_depth_filtering(5).unwrap();
        assert_eq!(camera.depth_filtering(), 5);
        assert_eq!(camera.prepare(&CameraConfig::default()).filter_level, 5);
    }

    #[test]
    fn production_readiness_needs_connection() {
        let camera = femto();
        assert!(matches!(
            camera.validate_production_readiness(),
            Err(CameraError::ConnectionFailed(_))
        ));

        camera.connect().unwrap();
        assert_eq!(camera.status(), CameraStatus::Connected);
        camera.validate_production_readiness().unwrap();
        assert!(camera.calibration_certificate().contains("factory calibrated"));
    }
}
