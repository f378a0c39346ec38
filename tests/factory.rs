//! Factory selection, fallback and custom registration

use std::collections::BTreeMap;
use std::sync::Arc;

use depthcam::factory::HardwareProbe;
use depthcam::{
    Camera, CameraConfig, CameraError, CameraStatus, FactoryConfig, HardwareDetectionResult,
    HardwareFactory, RecordingSink, Services, SimulationCamera, SimulationProfile,
};

struct Bench(Vec<HardwareDetectionResult>);

impl HardwareProbe for Bench {
    fn name(&self) -> &str {
        "bench"
    }

    fn probe(&self) -> Vec<HardwareDetectionResult> {
        self.0.clone()
    }
}

fn found(camera_type: &str, medical: bool, confidence: f32) -> HardwareDetectionResult {
    HardwareDetectionResult {
        camera_type: camera_type.into(),
        model_name: camera_type.into(),
        serial_number: "BENCH".into(),
        firmware_version: "5.0".into(),
        is_medical_grade: medical,
        is_production_ready: medical,
        detection_confidence: confidence,
        connection_interface: "USB".into(),
        additional_info: BTreeMap::new(),
    }
}

fn simulation_factory() -> HardwareFactory {
    let config = FactoryConfig {
        enable_simulation_mode: true,
        ..Default::default()
    };
    HardwareFactory::with_probes(config, Services::default(), Vec::new())
}

#[test]
fn simulation_factory_builds_working_cameras() {
    let factory = simulation_factory();
    let status = factory.factory_status();
    assert!(status.simulation_mode_active);
    assert_eq!(status.detected_cameras_count, 2);
    assert!(status.last_detection_time.is_some());

    // Real type names map onto simulators in simulation mode
    let camera = factory.create_camera("d435").unwrap();
    assert_eq!(camera.id(), "d435_sim");

    let camera: Arc<dyn Camera> = Arc::from(factory.create_camera("auto").unwrap());
    assert_eq!(camera.id(), "femto_mega_sim");
    camera.connect().unwrap();
    let config = CameraConfig {
        width: 320,
        height: 288,
        ..Default::default()
    };
    camera.start_capture(&config).unwrap();
    assert!(camera.synchronized_frames().is_ok());
    camera.stop_capture().unwrap();
}

#[test]
fn unknown_type_is_rejected_with_diagnostic() {
    let factory = simulation_factory();
    assert!(matches!(
        factory.create_camera("kinect"),
        Err(CameraError::InvalidConfiguration(_))
    ));
    assert!(factory
        .factory_status()
        .error_messages
        .iter()
        .any(|m| m.contains("kinect")));
}

#[test]
fn medical_hardware_is_preferred_but_validated() {
    let probe: Arc<dyn HardwareProbe> = Arc::new(Bench(vec![
        found("d435", false, 0.95),
        found("femto_mega", true, 0.7),
    ]));
    let factory = HardwareFactory::with_probes(FactoryConfig::default(), Services::default(), vec![probe]);

    let detected = factory.detect_all_hardware();
    assert_eq!(detected.len(), 2);
    let best = factory.select_best_camera(&detected).unwrap();
    assert_eq!(best.camera_type, "femto_mega");
    assert!(!factory.factory_status().medical_compliance_verified);
}

#[test]
fn unusable_hardware_falls_back_to_simulation() {
    let sink = Arc::new(RecordingSink::new());
    let probe: Arc<dyn HardwareProbe> = Arc::new(Bench(vec![found("femto_mega", true, 0.2)]));
    let config = FactoryConfig {
        preferred_camera_type: "d435".into(),
        enable_medical_compliance_check: false,
        ..Default::default()
    };
    let factory = HardwareFactory::with_probes(config, Services::new(sink.clone()), vec![probe]);

    let camera = factory.create_best_camera().unwrap();
    assert_eq!(camera.id(), "d435_sim");
    assert_eq!(camera.status(), CameraStatus::Disconnected);
    assert_eq!(sink.count_where(|e| e.message == "falling back to simulation"), 1);
}

#[test]
fn custom_cameras_are_registered_and_listed() {
    let factory = simulation_factory();
    factory.register_custom_camera("bench_femto", |services: &Services| {
        let camera = SimulationCamera::new(SimulationProfile::FemtoMega, services.clone());
        camera.set_filter_level(0);
        Ok(Box::new(camera) as Box<dyn Camera>)
    });

    assert!(factory.available_camera_types().contains(&"bench_femto".to_string()));
    let camera = factory.create_camera("bench_femto").unwrap();
    assert_eq!(camera.id(), "femto_mega_sim");

    assert!(factory.unregister_custom_camera("bench_femto"));
    assert!(!factory.unregister_custom_camera("bench_femto"));
}

#[test]
fn refresh_reprobes_after_mode_change() {
    let probe: Arc<dyn HardwareProbe> = Arc::new(Bench(vec![found("femto_mega", true, 0.95)]));
    let factory = HardwareFactory::with_probes(FactoryConfig::default(), Services::default(), vec![probe]);
    assert_eq!(factory.detect_connected_cameras(), vec!["femto_mega"]);
    assert!(factory.factory_status().medical_compliance_verified);

    factory.enable_simulation_mode(true);
    assert_eq!(factory.refresh_hardware_detection(), 2);
    assert_eq!(factory.detect_connected_cameras(), vec!["femto_mega_sim", "d435_sim"]);

    assert!(factory.check_medical_compliance("femto_mega_sim"));
    assert!(!factory.check_medical_compliance("d435_sim"));
    assert!(factory.validate_hardware("d435_sim"));
}
