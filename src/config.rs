//! Camera and factory configuration
//!
//! Values arrive already resolved; this module only checks them against
//! what the hardware can do. [`Settings::load`] is the binary's layered
//! loader (defaults, optional file, `DEPTHCAM__*` environment).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::{CameraCapabilities, ColorOrder};
use crate::error::{CameraError, Result};

/// Ceiling for a single recovery backoff.
pub const MAX_RECOVERY_BACKOFF: Duration = Duration::from_secs(2);

/// Desired operating parameters for one capture session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,

    pub enable_color: bool,
    pub enable_depth: bool,
    pub enable_infrared: bool,

    pub color_format: ColorOrder,
    pub auto_exposure: bool,
    pub exposure_value: u32,
    pub auto_white_balance: bool,

    pub enable_hardware_sync: bool,
    pub buffer_size: usize,
    pub timeout_ms: u64,

    pub enable_validation: bool,
    pub enable_checksums: bool,
    /// Minimum share of valid depth pixels for a frame to count as valid
    pub min_confidence: f32,

    pub max_temperature: f32,
    pub watchdog_timeout_ms: u64,
    pub enable_safety_monitoring: bool,

    /// Max colour/depth timestamp gap for a pair; 0 means one frame interval
    pub sync_tolerance_ms: u64,
    pub max_recovery_attempts: u32,
    pub recovery_backoff_ms: u64,
    /// Depth filter strength 0-5 (0 disables filtering)
    pub filter_level: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            enable_color: true,
            enable_depth: true,
            enable_infrared: false,
            color_format: ColorOrder::Bgr,
            auto_exposure: true,
            exposure_value: 0,
            auto_white_balance: true,
            enable_hardware_sync: true,
            buffer_size: 5,
            timeout_ms: 1000,
            enable_validation: true,
            enable_checksums: true,
            min_confidence: 0.8,
            max_temperature: 70.0,
            watchdog_timeout_ms: 5000,
            enable_safety_monitoring: true,
            sync_tolerance_ms: 0,
            max_recovery_attempts: 3,
            recovery_backoff_ms: 500,
            filter_level: 2,
        }
    }
}

impl CameraConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn recovery_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_ms)
    }

    /// Wait before recovery attempt `attempt` (1-based): the base backoff
    /// doubled per attempt, capped at [`MAX_RECOVERY_BACKOFF`].
    pub fn recovery_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.recovery_backoff()
            .saturating_mul(factor)
            .min(MAX_RECOVERY_BACKOFF)
    }

    /// Total time the retry budget waits before giving up.
    pub fn recovery_window(&self) -> Duration {
        (1..=self.max_recovery_attempts)
            .map(|attempt| self.recovery_delay(attempt))
            .sum()
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn sync_tolerance(&self) -> Duration {
        match self.sync_tolerance_ms {
            0 => self.frame_interval(),
            ms => Duration::from_millis(ms),
        }
    }

    /// Semantic validation against the connected device's capabilities.
    ///
    /// Runs before any hardware state is touched.
    pub fn validate_against(&self, caps: &CameraCapabilities) -> Result<()> {
        let invalid = |msg: String| Err(CameraError::InvalidConfiguration(msg));

        if !caps.supports_resolution(self.width, self.height) {
            return invalid(format!(
                "resolution {}x{} not supported by {}",
                self.width, self.height, caps.model_name
            ));
        }
        if !caps.supports_fps(self.fps) {
            return invalid(format!("{} fps not supported by {}", self.fps, caps.model_name));
        }
        if !self.enable_color && !self.enable_depth {
            return invalid("no stream enabled".into());
        }
        if self.enable_color && !caps.has_color_stream {
            return invalid("colour stream not available".into());
        }
        if self.enable_depth && !caps.has_depth_stream {
            return invalid("depth stream not available".into());
        }
        if self.enable_infrared && !caps.has_infrared_stream {
            return invalid("infrared stream not available".into());
        }
        if self.buffer_size < 1 {
            return invalid("buffer_size must be at least 1".into());
        }
        if self.timeout_ms == 0 || self.watchdog_timeout_ms == 0 {
            return invalid("timeouts must be non-zero".into());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return invalid(format!("min_confidence {} outside 0..=1", self.min_confidence));
        }
        if self.max_temperature <= 0.0 {
            return invalid("max_temperature must be positive".into());
        }
        if self.filter_level > 5 {
            return invalid(format!("filter_level {} outside 0..=5", self.filter_level));
        }
        Ok(())
    }
}

/// Factory behaviour and hardware preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    pub prefer_production_hardware: bool,
    pub enable_automatic_detection: bool,
    pub enable_hardware_validation: bool,
    pub enable_medical_compliance_check: bool,
    /// `"auto"` or a camera type id such as `"femto_mega"`
    pub preferred_camera_type: String,
    pub detection_timeout_ms: u64,
    pub enable_fallback_mode: bool,
    pub enable_simulation_mode: bool,
    pub detection_cache_ttl_ms: u64,
    pub min_detection_confidence: f32,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            prefer_production_hardware: true,
            enable_automatic_detection: true,
            enable_hardware_validation: true,
            enable_medical_compliance_check: true,
            preferred_camera_type: "auto".into(),
            detection_timeout_ms: 5000,
            enable_fallback_mode: true,
            enable_simulation_mode: false,
            detection_cache_ttl_ms: 5 * 60 * 1000,
            min_detection_confidence: 0.5,
        }
    }
}

impl FactoryConfig {
    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn detection_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.detection_cache_ttl_ms)
    }
}

/// Everything the binary needs, as one document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub camera: CameraConfig,
    pub factory: FactoryConfig,
    pub log_filter: String,
    /// Synchronized pairs to pull before exiting; 0 runs until Ctrl-C
    pub frame_limit: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            factory: FactoryConfig::default(),
            log_filter: "depthcam=info".into(),
            frame_limit: 0,
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix("DEPTHCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_fits_both_devices() {
        let config = CameraConfig::default();
        assert!(config.validate_against(&CameraCapabilities::d435()).is_ok());
        assert!(config.validate_against(&CameraCapabilities::femto_mega()).is_ok());
    }

    #[test]
    fn unsupported_mode_is_rejected() {
        let caps = CameraCapabilities::femto_mega();
        let config = CameraConfig {
            fps: 60,
            ..Default::default()
        };
        assert!(matches!(
            config.validate_against(&caps),
            Err(CameraError::InvalidConfiguration(_))
        ));

        let config = CameraConfig {
            width: 1920,
            height: 1200,
            ..Default::default()
        };
        assert!(config.validate_against(&caps).is_err());
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let config = CameraConfig {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate_against(&CameraCapabilities::d435()).is_err());
    }

    #[test]
    fn sync_tolerance_defaults_to_frame_interval() {
        let config = CameraConfig::default();
        assert_eq!(config.sync_tolerance(), Duration::from_secs_f64(1.0 / 30.0));

        let config = CameraConfig {
            sync_tolerance_ms: 10,
            ..Default::default()
        };
        assert_eq!(config.sync_tolerance(), Duration::from_millis(10));
    }

    #[test]
    fn recovery_backoff_doubles_up_to_ceiling() {
        let config = CameraConfig::default();
        assert_eq!(config.recovery_delay(1), Duration::from_millis(500));
        assert_eq!(config.recovery_delay(2), Duration::from_millis(1000));
        assert_eq!(config.recovery_delay(3), Duration::from_millis(2000));
        assert_eq!(config.recovery_delay(9), MAX_RECOVERY_BACKOFF);
        assert_eq!(config.recovery_delay(u32::MAX), MAX_RECOVERY_BACKOFF);
    }

    #[test]
    fn default_budget_outlasts_short_outage() {
        // Cable reseats and USB re-enumeration take around two seconds
        let config = CameraConfig::default();
        assert!(config.recovery_window() > Duration::from_secs(2));
        assert_eq!(config.recovery_window(), Duration::from_millis(3500));
    }

    #[test]
    fn settings_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "frame_limit = 12\n[camera]\nfps = 15\n[factory]\npreferred_camera_type = \"d435\""
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.frame_limit, 12);
        assert_eq!(settings.camera.fps, 15);
        assert_eq!(settings.camera.width, 640);
        assert_eq!(settings.factory.preferred_camera_type, "d435");
        assert!(settings.factory.enable_medical_compliance_check);
    }
}
