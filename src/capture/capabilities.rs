//! Hardware capability descriptors and the sensor families we know about

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Calibrations older than this must be redone before capture
pub const RECALIBRATION_INTERVAL_DAYS: i64 = 365;

/// Static description of a connected (or simulated) camera.
///
/// Queried once per connection and treated as immutable for the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCapabilities {
    pub model_name: String,
    pub serial_number: String,
    pub firmware_version: String,

    pub supported_resolutions: Vec<(u32, u32)>,
    pub supported_fps: Vec<u32>,

    pub min_depth_mm: f32,
    pub max_depth_mm: f32,
    pub depth_accuracy_mm: f32,
    /// Millimetres per depth unit
    pub depth_scale: f32,

    pub has_color_stream: bool,
    pub has_depth_stream: bool,
    pub has_infrared_stream: bool,

    pub max_frame_rate: f32,
    pub power_consumption_mw: u32,

    /// On-board depth filtering (noise removal, edge-preserving smoothing)
    pub hardware_filtering: bool,
    /// Selectable power modes
    pub power_modes: bool,

    pub is_medical_grade: bool,
    /// Calibration stored on the device at manufacture
    pub factory_calibrated: bool,
    pub calibration_date: Option<NaiveDate>,
    pub requires_recalibration: bool,
}

impl CameraCapabilities {
    /// Intel RealSense D435 (development hardware)
    pub fn d435() -> Self {
        Self {
            model_name: "Intel RealSense D435".into(),
            serial_number: String::new(),
            firmware_version: String::new(),
            supported_resolutions: vec![
                (424, 240),
                (480, 270),
                (640, 360),
                (640, 480),
                (848, 480),
                (1280, 720),
            ],
            supported_fps: vec![6, 15, 30, 60, 90],
            min_depth_mm: 280.0,
            max_depth_mm: 10_000.0,
            depth_accuracy_mm: 2.0,
            depth_scale: 1.0,
            has_color_stream: true,
            has_depth_stream: true,
            has_infrared_stream: true,
            max_frame_rate: 90.0,
            power_consumption_mw: 3_500,
            hardware_filtering: false,
            power_modes: false,
            is_medical_grade: false,
            factory_calibrated: false,
            calibration_date: None,
            requires_recalibration: true,
        }
    }

    /// ORBBEC Femto Mega (production hardware)
    pub fn femto_mega() -> Self {
        Self {
            model_name: "ORBBEC Femto Mega".into(),
            serial_number: String::new(),
            firmware_version: String::new(),
            supported_resolutions: vec![(320, 288), (640, 480), (640, 576), (1280, 720)],
            supported_fps: vec![5, 15, 25, 30],
            min_depth_mm: 250.0,
            max_depth_mm: 5_460.0,
            depth_accuracy_mm: 1.0,
            depth_scale: 1.0,
            has_color_stream: true,
            has_depth_stream: true,
            has_infrared_stream: true,
            max_frame_rate: 30.0,
            power_consumption_mw: 2_800,
            hardware_filtering: true,
            power_modes: true,
            is_medical_grade: true,
            factory_calibrated: true,
            calibration_date: None,
            requires_recalibration: false,
        }
    }

    pub fn supports_resolution(&self, width: u32, height: u32) -> bool {
        self.supported_resolutions.contains(&(width, height))
    }

    pub fn supports_fps(&self, fps: u32) -> bool {
        self.supported_fps.contains(&fps)
    }

    /// Recomputes `requires_recalibration` for the given day
    pub fn refresh_calibration_status(&mut self, today: NaiveDate) {
        self.requires_recalibration = match self.calibration_date {
            Some(date) => (today - date).num_days() > RECALIBRATION_INTERVAL_DAYS,
            None => !self.factory_calibrated,
        };
    }

    pub fn record_calibration(&mut self, today: NaiveDate) {
        self.calibration_date = Some(today);
        self.requires_recalibration = false;
    }
}

/// Physical sensor families with a backend in this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorModel {
    D435,
    FemtoMega,
}

impl SensorModel {
    pub fn capabilities(self) -> CameraCapabilities {
        match self {
            SensorModel::D435 => CameraCapabilities::d435(),
            SensorModel::FemtoMega => CameraCapabilities::femto_mega(),
        }
    }

    /// Camera type identifier used by the factory
    pub fn type_id(self) -> &'static str {
        match self {
            SensorModel::D435 => "d435",
            SensorModel::FemtoMega => "femto_mega",
        }
    }

    /// Nominal depth field of view (horizontal, vertical) in degrees
    pub fn depth_fov(self) -> (f32, f32) {
        match self {
            SensorModel::D435 => (87.0, 58.0),
            SensorModel::FemtoMega => (75.0, 65.0),
        }
    }

    /// Whether a V4L2 card name belongs to this family
    pub fn matches_card(self, card: &str) -> bool {
        let card = card.to_ascii_lowercase();
        match self {
            SensorModel::D435 => card.contains("realsense") && card.contains("435"),
            SensorModel::FemtoMega => card.contains("femto mega") || card.contains("femto_mega"),
        }
    }
}

impl fmt::Display for SensorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_id())
    }
}
