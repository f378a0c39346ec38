//! Hardware discovery and camera construction
//!
//! [`HardwareFactory`] asks every registered [`HardwareProbe`] what is
//! plugged in, caches the answer for a short while, ranks the candidates
//! and builds the matching backend. When nothing suitable is found it can
//! fall back to a simulated camera.
//!
//! Probes run on their own threads against `detection_timeout_ms`; a probe
//! that misses the deadline is reported and ignored.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam::channel;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::backends::{D435Camera, FemtoMegaCamera, SimulationCamera, SimulationProfile};
use crate::camera::Camera;
use crate::capture::{CameraCapabilities, SensorModel};
use crate::config::FactoryConfig;
use crate::error::{CameraError, Result};
use crate::events::{Event, Severity};
use crate::utils::{self, SensorNodes};
use crate::Services;

/// Diagnostics kept for [`FactoryStatus::error_messages`]
pub const MAX_ERROR_MESSAGES: usize = 100;

/// Built-in camera types, best first
pub const DEFAULT_TYPE_ORDER: [&str; 4] = ["femto_mega", "d435", "femto_mega_sim", "d435_sim"];

// ────────────────────────────────────────────────────────────────────────────
// Detection
// ────────────────────────────────────────────────────────────────────────────

/// One detected (or simulated) device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareDetectionResult {
    pub camera_type: String,
    pub model_name: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub is_medical_grade: bool,
    pub is_production_ready: bool,
    /// 0.0 - 1.0
    pub detection_confidence: f32,
    pub connection_interface: String,
    pub additional_info: BTreeMap<String, String>,
}

impl HardwareDetectionResult {
    /// Result describing a simulator profile
    pub fn simulated(profile: SimulationProfile) -> Self {
        let caps = profile.capabilities();
        let mut additional_info = BTreeMap::new();
        additional_info.insert("impersonates".into(), profile.model().type_id().into());

        Self {
            camera_type: profile.type_id().into(),
            model_name: caps.model_name,
            serial_number: caps.serial_number,
            firmware_version: caps.firmware_version,
            is_medical_grade: caps.is_medical_grade,
            is_production_ready: profile == SimulationProfile::FemtoMega,
            detection_confidence: 1.0,
            connection_interface: "Simulation".into(),
            additional_info,
        }
    }

    fn from_nodes(sensor: &SensorNodes) -> Self {
        let caps = sensor.model.capabilities();
        let mut additional_info = BTreeMap::new();
        additional_info.insert("bus_info".into(), sensor.bus_info.clone());
        for (role, node) in [("color_node", &sensor.color), ("depth_node", &sensor.depth)] {
            if let Some(node) = node {
                additional_info.insert(role.into(), node.path.clone());
            }
        }
        let technology = match sensor.model {
            SensorModel::D435 => "Active IR Stereo",
            SensorModel::FemtoMega => "Time of Flight",
        };
        additional_info.insert("depth_technology".into(), technology.into());

        let confidence = match (sensor.is_complete(), sensor.model) {
            (false, _) => 0.4,
            (true, SensorModel::D435) => 0.9,
            (true, SensorModel::FemtoMega) => 0.95,
        };
        let firmware = sensor
            .depth
            .as_ref()
            .or(sensor.color.as_ref())
            .map(|n| format!("{} ({})", n.driver, n.card))
            .unwrap_or_default();
        let interface = if sensor.bus_info.starts_with("usb") {
            "USB".to_string()
        } else {
            sensor.bus_info.clone()
        };

        Self {
            camera_type: sensor.model.type_id().into(),
            model_name: caps.model_name,
            serial_number: sensor.serial.clone(),
            firmware_version: firmware,
            is_medical_grade: caps.is_medical_grade,
            is_production_ready: caps.is_medical_grade && caps.factory_calibrated,
            detection_confidence: confidence,
            connection_interface: interface,
            additional_info,
        }
    }
}

/// A source of detection results, one per device family
pub trait HardwareProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Enumerate connected devices. May block; the factory bounds it.
    fn probe(&self) -> Vec<HardwareDetectionResult>;
}

/// Finds a sensor family among the V4L2 capture nodes
pub struct V4l2Probe {
    model: SensorModel,
}

impl V4l2Probe {
    pub fn new(model: SensorModel) -> Self {
        Self { model }
    }
}

impl HardwareProbe for V4l2Probe {
    fn name(&self) -> &str {
        self.model.type_id()
    }

    fn probe(&self) -> Vec<HardwareDetectionResult> {
        let devices = utils::enumerate_devices();
        utils::find_sensors(self.model, &devices)
            .iter()
            .map(HardwareDetectionResult::from_nodes)
            .collect()
    }
}

struct DetectionCache {
    results: Vec<HardwareDetectionResult>,
    at: Instant,
}

// ────────────────────────────────────────────────────────────────────────────
// Factory
// ────────────────────────────────────────────────────────────────────────────

pub type CameraCreator = Arc<dyn Fn(&Services) -> Result<Box<dyn Camera>> + Send + Sync>;

/// Diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct FactoryStatus {
    pub is_initialized: bool,
    pub detected_cameras_count: usize,
    pub preferred_camera: String,
    pub active_configuration: String,
    pub medical_compliance_verified: bool,
    pub simulation_mode_active: bool,
    pub available_types: Vec<String>,
    pub error_messages: Vec<String>,
    pub last_detection_time: Option<DateTime<Utc>>,
}

pub struct HardwareFactory {
    services: Services,
    config: Mutex<FactoryConfig>,
    probes: Vec<Arc<dyn HardwareProbe>>,
    cache: Mutex<Option<DetectionCache>>,
    /// Held across cache check, probing and fill so concurrent callers
    /// share one probe round
    detecting: Mutex<()>,
    last_detection: Mutex<Option<DateTime<Utc>>>,
    simulation_mode: AtomicBool,
    medical_compliance_verified: AtomicBool,
    custom: Mutex<BTreeMap<String, CameraCreator>>,
    errors: Mutex<VecDeque<String>>,
}

impl HardwareFactory {
    /// Factory probing the V4L2 device families
    pub fn new(config: FactoryConfig, services: Services) -> Self {
        let probes: Vec<Arc<dyn HardwareProbe>> = vec![
            Arc::new(V4l2Probe::new(SensorModel::FemtoMega)),
            Arc::new(V4l2Probe::new(SensorModel::D435)),
        ];
        Self::with_probes(config, services, probes)
    }

    pub fn with_probes(
        config: FactoryConfig,
        services: Services,
        probes: Vec<Arc<dyn HardwareProbe>>,
    ) -> Self {
        let factory = Self {
            services,
            simulation_mode: AtomicBool::new(config.enable_simulation_mode),
            config: Mutex::new(config),
            probes,
            cache: Mutex::new(None),
            detecting: Mutex::new(()),
            last_detection: Mutex::new(None),
            medical_compliance_verified: AtomicBool::new(false),
            custom: Mutex::new(BTreeMap::new()),
            errors: Mutex::new(VecDeque::new()),
        };

        if factory.configuration().enable_automatic_detection {
            let found = factory.detect_all_hardware();
            info!("Initial hardware detection found {} camera(s)", found.len());
        }
        factory
    }

    pub fn configuration(&self) -> FactoryConfig {
        self.config.lock().clone()
    }

    /// Replace the configuration; the detection cache is dropped
    pub fn configure(&self, config: FactoryConfig) {
        info!(
            preferred = %config.preferred_camera_type,
            prefer_production = config.prefer_production_hardware,
            "Factory reconfigured"
        );
        self.simulation_mode
            .store(config.enable_simulation_mode, Ordering::SeqCst);
        *self.config.lock() = config;
        self.invalidate_cache();
    }

    pub fn enable_simulation_mode(&self, enable: bool) {
        if self.simulation_mode.swap(enable, Ordering::SeqCst) != enable {
            info!("Simulation mode {}", if enable { "enabled" } else { "disabled" });
            self.invalidate_cache();
        }
    }

    pub fn is_simulation_mode(&self) -> bool {
        self.simulation_mode.load(Ordering::SeqCst)
    }

    fn invalidate_cache(&self) {
        *self.cache.lock() = None;
    }

    fn add_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.services
            .record(Event::new(Severity::Warning, "camera_factory", message.clone()));

        let mut errors = self.errors.lock();
        errors.push_back(message);
        while errors.len() > MAX_ERROR_MESSAGES {
            errors.pop_front();
        }
    }

    /// Every connected device, from cache while it is fresh
    #[instrument(skip(self))]
    pub fn detect_all_hardware(&self) -> Vec<HardwareDetectionResult> {
        let _detecting = self.detecting.lock();
        let ttl = self.configuration().detection_cache_ttl();
        if let Some(cache) = &*self.cache.lock() {
            if cache.at.elapsed() < ttl {
                debug!("Hardware detection served from cache");
                return cache.results.clone();
            }
        }

        let results = self.perform_detection();

        let config = self.configuration();
        if config.enable_medical_compliance_check {
            let mut verified = !results.is_empty();
            for result in results.iter().filter(|r| !r.is_medical_grade) {
                verified = false;
                self.add_error(format!(
                    "Hardware {} does not meet medical device requirements",
                    result.camera_type
                ));
            }
            self.medical_compliance_verified.store(verified, Ordering::SeqCst);
        }

        *self.cache.lock() = Some(DetectionCache {
            results: results.clone(),
            at: Instant::now(),
        });
        *self.last_detection.lock() = Some(Utc::now());
        results
    }

    fn perform_detection(&self) -> Vec<HardwareDetectionResult> {
        if self.is_simulation_mode() {
            let mut results: Vec<_> = SimulationProfile::ALL
                .into_iter()
                .map(HardwareDetectionResult::simulated)
                .collect();
            results.sort_by_key(|r| type_rank(&r.camera_type));
            return results;
        }

        let timeout = self.configuration().detection_timeout();
        let deadline = Instant::now() + timeout;
        let (tx, rx) = channel::unbounded();

        for probe in &self.probes {
            let probe = probe.clone();
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("probe-{}", probe.name()))
                .spawn(move || {
                    let found = probe.probe();
                    let _ = tx.send((probe.name().to_string(), found));
                });
            if let Err(e) = spawned {
                self.add_error(format!("Hardware probe could not start: {e}"));
            }
        }
        drop(tx);

        let mut results = Vec::new();
        let mut pending = self.probes.len();
        while pending > 0 {
            match rx.recv_deadline(deadline) {
                Ok((name, found)) => {
                    debug!("Probe {} found {} device(s)", name, found.len());
                    results.extend(found);
                    pending -= 1;
                }
                Err(channel::RecvTimeoutError::Timeout) => {
                    self.add_error(format!(
                        "{pending} hardware probe(s) missed the {}ms detection deadline",
                        timeout.as_millis()
                    ));
                    break;
                }
                Err(channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        // Probe threads finish in any order
        results.sort_by_key(|r| type_rank(&r.camera_type));
        info!("Hardware detection completed, {} device(s)", results.len());
        results
    }

    /// Drop the cache and probe again; returns the number of devices found
    pub fn refresh_hardware_detection(&self) -> usize {
        self.invalidate_cache();
        self.detect_all_hardware().len()
    }

    /// Camera types of every detected device
    pub fn detect_connected_cameras(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .detect_all_hardware()
            .into_iter()
            .map(|r| r.camera_type)
            .collect();
        types.dedup();
        types
    }

    /// Types `create_camera` can build in the current mode
    pub fn available_camera_types(&self) -> Vec<String> {
        let mut types: Vec<String> = if self.is_simulation_mode() {
            SimulationProfile::ALL.iter().map(|p| p.type_id().to_string()).collect()
        } else {
            DEFAULT_TYPE_ORDER.iter().map(|t| t.to_string()).collect()
        };
        types.extend(self.custom.lock().keys().cloned());
        types.sort();
        types.dedup();
        types
    }

    /// Best candidate that passes [`Self::validate_detection_result`]
    pub fn select_best_camera(
        &self,
        results: &[HardwareDetectionResult],
    ) -> Option<HardwareDetectionResult> {
        let config = self.configuration();
        let mut ranked: Vec<&HardwareDetectionResult> = results.iter().collect();
        ranked.sort_by(|a, b| compare_candidates(&config, a, b));

        let best = ranked
            .into_iter()
            .find(|r| self.validate_detection_result(r))
            .cloned();
        match &best {
            Some(r) => info!("Selected {} ({}, serial {})", r.camera_type, r.model_name, r.serial_number),
            None if !results.is_empty() => warn!("No detected camera passed validation"),
            None => {}
        }
        best
    }

    pub fn validate_detection_result(&self, result: &HardwareDetectionResult) -> bool {
        let config = self.configuration();
        if config.enable_medical_compliance_check && !result.is_medical_grade {
            return false;
        }
        result.detection_confidence >= config.min_detection_confidence
    }

    /// Build a camera of `camera_type`, validated when the configuration asks
    #[instrument(skip(self))]
    pub fn create_camera(&self, camera_type: &str) -> Result<Box<dyn Camera>> {
        if camera_type == "auto" {
            return self
                .create_best_camera()
                .ok_or_else(|| CameraError::DeviceNotFound("no suitable camera".into()));
        }

        let custom = self.custom.lock().get(camera_type).cloned();
        let built = match custom {
            Some(creator) => {
                info!("Using custom creator for {}", camera_type);
                creator(&self.services)
            }
            None => self.build_builtin(camera_type),
        };
        let camera = match built {
            Ok(camera) => camera,
            Err(e) => {
                self.add_error(format!("Failed to create camera {camera_type}: {e}"));
                return Err(e);
            }
        };

        if self.configuration().enable_hardware_validation {
            if let Err(e) = camera.validate() {
                self.add_error(format!("Camera validation failed for {camera_type}: {e}"));
                return Err(e);
            }
        }

        info!("Created camera {}", camera.id());
        self.services.record(
            Event::new(Severity::Info, "camera_factory", "camera created").with("type", camera.id()),
        );
        Ok(camera)
    }

    fn build_builtin(&self, camera_type: &str) -> Result<Box<dyn Camera>> {
        let simulated = if self.is_simulation_mode() {
            let base = camera_type.trim_end_matches("_sim");
            SimulationProfile::ALL.into_iter().find(|p| p.model().type_id() == base)
        } else {
            SimulationProfile::from_type_id(camera_type)
        };
        if let Some(profile) = simulated {
            return Ok(Box::new(SimulationCamera::new(profile, self.services.clone())));
        }

        match camera_type {
            "d435" => Ok(Box::new(D435Camera::new(self.services.clone()))),
            "femto_mega" => Ok(Box::new(FemtoMegaCamera::new(self.services.clone()))),
            other => Err(CameraError::InvalidConfiguration(format!("unknown camera type '{other}'"))),
        }
    }

    /// Detect, rank and build; falls back to simulation when allowed
    #[instrument(skip(self))]
    pub fn create_best_camera(&self) -> Option<Box<dyn Camera>> {
        let detected = self.detect_all_hardware();
        match self.select_best_camera(&detected) {
            Some(best) => match self.create_camera(&best.camera_type) {
                Ok(camera) => return Some(camera),
                Err(e) => debug!("Best candidate {} unusable: {}", best.camera_type, e),
            },
            None if detected.is_empty() => self.add_error("No cameras detected"),
            None => self.add_error("No suitable camera found"),
        }

        let config = self.configuration();
        if !config.enable_fallback_mode {
            self.add_error("Fallback disabled, no camera available");
            return None;
        }

        let profile = if config.preferred_camera_type.starts_with("d435") {
            SimulationProfile::D435
        } else {
            SimulationProfile::FemtoMega
        };
        info!("Falling back to simulation ({})", profile);
        self.services.record(
            Event::new(Severity::Warning, "camera_factory", "falling back to simulation")
                .with("profile", profile),
        );
        match self.create_camera(profile.type_id()) {
            Ok(camera) => Some(camera),
            Err(_) => None,
        }
    }

    /// Simulated camera, regardless of mode
    pub fn create_simulation_camera(&self, profile: SimulationProfile) -> Result<Box<dyn Camera>> {
        self.create_camera(profile.type_id())
    }

    pub fn create_default_camera(&self) -> Option<Box<dyn Camera>> {
        self.create_best_camera()
    }

    /// Development preset: no compliance gate, D435 preferred
    pub fn create_development_camera(&self) -> Option<Box<dyn Camera>> {
        let mut config = self.configuration();
        config.prefer_production_hardware = false;
        config.enable_medical_compliance_check = false;
        config.preferred_camera_type = "d435".into();
        self.configure(config);
        self.create_best_camera()
    }

    /// Production preset: compliance gate on, Femto Mega preferred, no simulation
    pub fn create_production_camera(&self) -> Option<Box<dyn Camera>> {
        let mut config = self.configuration();
        config.prefer_production_hardware = true;
        config.enable_medical_compliance_check = true;
        config.preferred_camera_type = "femto_mega".into();
        config.enable_simulation_mode = false;
        self.configure(config);
        self.create_best_camera()
    }

    /// Build, validate and drop a camera of `camera_type`
    pub fn validate_hardware(&self, camera_type: &str) -> bool {
        let config = self.configuration();
        let result = self.build_builtin(camera_type).and_then(|camera| camera.validate());
        match result {
            Ok(()) => true,
            Err(e) => {
                if config.enable_hardware_validation {
                    self.add_error(format!("Hardware validation failed for {camera_type}: {e}"));
                }
                false
            }
        }
    }

    /// Nominal capabilities of a built-in type
    pub fn hardware_capabilities(&self, camera_type: &str) -> Option<CameraCapabilities> {
        if let Some(profile) = SimulationProfile::from_type_id(camera_type) {
            return Some(profile.capabilities());
        }
        match camera_type {
            "d435" => Some(SensorModel::D435.capabilities()),
            "femto_mega" => Some(SensorModel::FemtoMega.capabilities()),
            _ => None,
        }
    }

    pub fn check_medical_compliance(&self, camera_type: &str) -> bool {
        self.hardware_capabilities(camera_type)
            .is_some_and(|caps| caps.is_medical_grade)
    }

    /// Add or replace a camera type
    pub fn register_custom_camera<F>(&self, camera_type: &str, creator: F)
    where
        F: Fn(&Services) -> Result<Box<dyn Camera>> + Send + Sync + 'static,
    {
        info!("Registered custom camera type {}", camera_type);
        self.custom.lock().insert(camera_type.to_string(), Arc::new(creator));
    }

    pub fn unregister_custom_camera(&self, camera_type: &str) -> bool {
        self.custom.lock().remove(camera_type).is_some()
    }

    pub fn factory_status(&self) -> FactoryStatus {
        let config = self.configuration();
        let detected = self
            .cache
            .lock()
            .as_ref()
            .map(|c| c.results.len())
            .unwrap_or(0);

        FactoryStatus {
            is_initialized: true,
            detected_cameras_count: detected,
            preferred_camera: config.preferred_camera_type.clone(),
            active_configuration: format!(
                "production={} compliance={} validation={} fallback={} simulation={}",
                config.prefer_production_hardware,
                config.enable_medical_compliance_check,
                config.enable_hardware_validation,
                config.enable_fallback_mode,
                self.is_simulation_mode(),
            ),
            medical_compliance_verified: self.medical_compliance_verified.load(Ordering::SeqCst),
            simulation_mode_active: self.is_simulation_mode(),
            available_types: self.available_camera_types(),
            error_messages: self.errors.lock().iter().cloned().collect(),
            last_detection_time: *self.last_detection.lock(),
        }
    }
}

fn type_rank(camera_type: &str) -> usize {
    DEFAULT_TYPE_ORDER
        .iter()
        .position(|t| *t == camera_type)
        .unwrap_or(DEFAULT_TYPE_ORDER.len())
}

/// Confidence compared in hundredths; closer than that counts as a tie
fn confidence_key(result: &HardwareDetectionResult) -> i32 {
    (result.detection_confidence * 100.0).round() as i32
}

fn compare_candidates(
    config: &FactoryConfig,
    a: &HardwareDetectionResult,
    b: &HardwareDetectionResult,
) -> CmpOrdering {
    let medical = if config.enable_medical_compliance_check {
        b.is_medical_grade.cmp(&a.is_medical_grade)
    } else {
        CmpOrdering::Equal
    };
    let production = || {
        if config.prefer_production_hardware {
            b.is_production_ready.cmp(&a.is_production_ready)
        } else {
            CmpOrdering::Equal
        }
    };
    let preferred = || {
        let pref = config.preferred_camera_type.as_str();
        if pref == "auto" {
            CmpOrdering::Equal
        } else {
            (b.camera_type == pref).cmp(&(a.camera_type == pref))
        }
    };

    medical
        .then_with(production)
        .then_with(|| confidence_key(b).cmp(&confidence_key(a)))
        .then_with(preferred)
        .then_with(|| type_rank(&a.camera_type).cmp(&type_rank(&b.camera_type)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FixedProbe {
        results: Vec<HardwareDetectionResult>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FixedProbe {
        fn new(results: Vec<HardwareDetectionResult>) -> Arc<Self> {
            Arc::new(Self {
                results,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }
    }

    impl HardwareProbe for FixedProbe {
        fn name(&self) -> &str {
            "fixed"
        }

        fn probe(&self) -> Vec<HardwareDetectionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.results.clone()
        }
    }

    fn device(camera_type: &str, medical: bool, production: bool, confidence: f32) -> HardwareDetectionResult {
        HardwareDetectionResult {
            camera_type: camera_type.into(),
            model_name: camera_type.into(),
            serial_number: "0001".into(),
            firmware_version: "1.0".into(),
            is_medical_grade: medical,
            is_production_ready: production,
            detection_confidence: confidence,
            connection_interface: "USB".into(),
            additional_info: BTreeMap::new(),
        }
    }

    fn quiet_config() -> FactoryConfig {
        FactoryConfig {
            enable_automatic_detection: false,
            ..Default::default()
        }
    }

    impl FixedProbe {
        fn slow(results: Vec<HardwareDetectionResult>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                results,
                calls: AtomicUsize::new(0),
                delay,
            })
        }
    }

    fn factory_with(config: FactoryConfig, probe: Arc<FixedProbe>) -> HardwareFactory {
        let probes: Vec<Arc<dyn HardwareProbe>> = vec![probe];
        HardwareFactory::with_probes(config, Services::default(), probes)
    }

    #[test]
    fn concurrent_detection_runs_once() {
        let probe = FixedProbe::slow(
            vec![device("femto_mega", true, true, 0.95)],
            Duration::from_millis(150),
        );
        let factory = factory_with(quiet_config(), probe.clone());

        let found: Vec<usize> = thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| factory.detect_all_hardware().len()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(found, vec![1; 4]);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn medical_grade_beats_confidence_under_compliance() {
        let factory = factory_with(quiet_config(), FixedProbe::new(vec![]));
        let results = vec![
            device("d435", false, false, 0.95),
            device("femto_mega", true, true, 0.7),
        ];
        let best = factory.select_best_camera(&results).unwrap();
        assert_eq!(best.camera_type, "femto_mega");
    }

    #[test]
    fn without_compliance_confidence_then_preference_decide() {
        let config = FactoryConfig {
            enable_medical_compliance_check: false,
            prefer_production_hardware: false,
            preferred_camera_type: "d435".into(),
            ..quiet_config()
        };
        let factory = factory_with(config, FixedProbe::new(vec![]));

        let results = vec![device("femto_mega", true, true, 0.9), device("d435", false, false, 0.95)];
        assert_eq!(factory.select_best_camera(&results).unwrap().camera_type, "d435");

        // Within a hundredth counts as a tie, so preference wins
        let results = vec![device("femto_mega", true, true, 0.952), device("d435", false, false, 0.95)];
        assert_eq!(factory.select_best_camera(&results).unwrap().camera_type, "d435");
    }

    #[test]
    fn default_order_breaks_ties() {
        let config = FactoryConfig {
            enable_medical_compliance_check: false,
            prefer_production_hardware: false,
            ..quiet_config()
        };
        let factory = factory_with(config, FixedProbe::new(vec![]));
        let results = vec![
            device("d435_sim", false, false, 1.0),
            device("d435", false, false, 1.0),
            device("femto_mega_sim", false, false, 1.0),
        ];
        assert_eq!(factory.select_best_camera(&results).unwrap().camera_type, "d435");
    }

    #[test]
    fn low_confidence_and_non_medical_are_rejected() {
        let factory = factory_with(quiet_config(), FixedProbe::new(vec![]));
        assert!(!factory.validate_detection_result(&device("femto_mega", true, true, 0.3)));
        assert!(!factory.validate_detection_result(&device("d435", false, false, 0.99)));
        assert!(factory.validate_detection_result(&device("femto_mega", true, true, 0.5)));
        assert!(factory.select_best_camera(&[device("d435", false, false, 0.99)]).is_none());
    }

    #[test]
    fn detection_is_cached_until_ttl_or_configure() {
        let probe = FixedProbe::new(vec![device("femto_mega", true, true, 0.95)]);
        let config = FactoryConfig {
            detection_cache_ttl_ms: 150,
            ..quiet_config()
        };
        let factory = factory_with(config.clone(), probe.clone());

        let first = factory.detect_all_hardware();
        let second = factory.detect_all_hardware();
        assert_eq!(first, second);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(200));
        factory.detect_all_hardware();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

        factory.configure(config);
        factory.detect_all_hardware();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(factory.factory_status().last_detection_time.is_some());
    }

    #[test]
    fn slow_probe_misses_deadline() {
        let probe = Arc::new(FixedProbe {
            results: vec![device("femto_mega", true, true, 0.95)],
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(500),
        });
        let config = FactoryConfig {
            detection_timeout_ms: 50,
            ..quiet_config()
        };
        let factory = factory_with(config, probe);

        let started = Instant::now();
        assert!(factory.detect_all_hardware().is_empty());
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(factory
            .factory_status()
            .error_messages
            .iter()
            .any(|m| m.contains("deadline")));
    }

    #[test]
    fn simulation_mode_detects_simulators() {
        let config = FactoryConfig {
            enable_simulation_mode: true,
            ..quiet_config()
        };
        let factory = factory_with(config, FixedProbe::new(vec![]));
        assert_eq!(factory.detect_connected_cameras(), vec!["femto_mega_sim", "d435_sim"]);
        assert_eq!(factory.available_camera_types(), vec!["d435_sim", "femto_mega_sim"]);

        let camera = factory.create_best_camera().unwrap();
        assert_eq!(camera.id(), "femto_mega_sim");
    }

    #[test]
    fn empty_detection_falls_back_to_simulation() {
        let factory = factory_with(quiet_config(), FixedProbe::new(vec![]));
        let camera = factory.create_best_camera().unwrap();
        assert_eq!(camera.id(), "femto_mega_sim");
        assert!(factory
            .factory_status()
            .error_messages
            .contains(&"No cameras detected".to_string()));

        let config = FactoryConfig {
            enable_fallback_mode: false,
            ..quiet_config()
        };
        let factory = factory_with(config, FixedProbe::new(vec![]));
        assert!(factory.create_best_camera().is_none());
    }

    #[test]
    fn failed_validation_discards_camera() {
        let factory = factory_with(quiet_config(), FixedProbe::new(vec![]));
        factory.register_custom_camera("flaky", |services: &Services| {
            let camera = SimulationCamera::new(SimulationProfile::D435, services.clone());
            camera.inject_fault(CameraError::HardwareFault("bad cable".into()), Duration::from_secs(60));
            Ok(Box::new(camera) as Box<dyn Camera>)
        });

        assert!(matches!(
            factory.create_camera("flaky"),
            Err(CameraError::HardwareFault(_))
        ));
        assert!(factory
            .factory_status()
            .error_messages
            .iter()
            .any(|m| m.starts_with("Camera validation failed for flaky")));

        assert!(factory.available_camera_types().contains(&"flaky".to_string()));
        assert!(factory.unregister_custom_camera("flaky"));
        assert!(factory.create_camera("flaky").is_err());
    }

    #[test]
    fn error_history_is_bounded() {
        let factory = factory_with(quiet_config(), FixedProbe::new(vec![]));
        for i in 0..(MAX_ERROR_MESSAGES + 20) {
            factory.add_error(format!("message {i}"));
        }
        let errors = factory.factory_status().error_messages;
        assert_eq!(errors.len(), MAX_ERROR_MESSAGES);
        assert_eq!(errors[0], "message 20");
    }

    #[test]
    fn compliance_is_verified_only_for_medical_hardware() {
        let factory = factory_with(
            quiet_config(),
            FixedProbe::new(vec![device("femto_mega", true, true, 0.95)]),
        );
        factory.detect_all_hardware();
        assert!(factory.factory_status().medical_compliance_verified);

        let factory = factory_with(
            quiet_config(),
            FixedProbe::new(vec![device("d435", false, false, 0.9)]),
        );
        factory.detect_all_hardware();
        assert!(!factory.factory_status().medical_compliance_verified);
        assert!(factory.check_medical_compliance("femto_mega"));
        assert!(!factory.check_medical_compliance("d435"));
        assert!(factory.hardware_capabilities("unknown").is_none());
    }
}
