//! Fault injection, recovery and safety stops

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use depthcam::{
    Camera, CameraConfig, CameraError, CameraStatus, ErrorReport, RecordingSink, Services,
    Severity, SimulationCamera, SimulationProfile,
};

fn femto_config() -> CameraConfig {
    CameraConfig {
        width: 320,
        height: 288,
        ..Default::default()
    }
}

fn wait_for(camera: &dyn Camera, status: CameraStatus, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if camera.status() == status {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    camera.status() == status
}

fn recorded() -> (Arc<RecordingSink>, Services) {
    let sink = Arc::new(RecordingSink::new());
    (sink.clone(), Services::new(sink))
}

// ── Recovery ────────────────────────────────────────────────────────────────

#[test]
fn transient_fault_recovers_within_budget() {
    let (sink, services) = recorded();
    let camera = SimulationCamera::new(SimulationProfile::FemtoMega, services);
    let reports = Arc::new(Mutex::new(Vec::<ErrorReport>::new()));
    let log = reports.clone();
    camera.set_error_callback(Some(Box::new(move |report: &ErrorReport| {
        log.lock().unwrap().push(report.clone());
    })));

    let config = CameraConfig {
        watchdog_timeout_ms: 500,
        recovery_backoff_ms: 100,
        max_recovery_attempts: 10,
        ..femto_config()
    };
    camera.connect().unwrap();
    camera.start_capture(&config).unwrap();
    camera.synchronized_frames().unwrap();

    camera.inject_fault(CameraError::HardwareFault("cable glitch".into()), Duration::from_millis(2000));
    assert!(wait_for(&camera, CameraStatus::Fault, Duration::from_secs(1)));
    assert!(wait_for(&camera, CameraStatus::Capturing, Duration::from_secs(5)));

    // Frames flow again
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut resumed = false;
    while Instant::now() < deadline && !resumed {
        resumed = camera.synchronized_frames().is_ok();
    }
    assert!(resumed);

    let reports = reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 2, "{reports:?}");
    assert!(!reports[0].recovered);
    assert!(reports[1].recovered);
    assert!(matches!(reports[0].error, CameraError::HardwareFault(_)));
    assert!(matches!(camera.last_error(), Some(CameraError::HardwareFault(_))));

    assert_eq!(
        sink.count_where(|e| e.component == "recovery" && e.message == "capture resumed"),
        1
    );
    camera.stop_capture().unwrap();
}

#[test]
fn default_budget_rides_out_two_second_outage() {
    let camera = SimulationCamera::new(SimulationProfile::FemtoMega, Services::default());
    let reports = Arc::new(Mutex::new(Vec::<ErrorReport>::new()));
    let log = reports.clone();
    camera.set_error_callback(Some(Box::new(move |report: &ErrorReport| {
        log.lock().unwrap().push(report.clone());
    })));

    let config = femto_config();
    assert_eq!(config.max_recovery_attempts, CameraConfig::default().max_recovery_attempts);
    camera.connect().unwrap();
    camera.start_capture(&config).unwrap();
    camera.synchronized_frames().unwrap();

    camera.inject_fault(CameraError::HardwareFault("cable reseated".into()), Duration::from_millis(2000));
    assert!(wait_for(&camera, CameraStatus::Fault, Duration::from_secs(1)));
    assert!(wait_for(&camera, CameraStatus::Capturing, Duration::from_secs(5)));

    let reports = reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 2, "{reports:?}");
    assert!(!reports[0].recovered);
    assert!(reports[1].recovered);
    camera.stop_capture().unwrap();
}

#[test]
fn exhausted_recovery_closes_the_stream() {
    let camera = SimulationCamera::new(SimulationProfile::D435, Services::default());
    let config = CameraConfig {
        width: 424,
        height: 240,
        recovery_backoff_ms: 50,
        max_recovery_attempts: 2,
        ..Default::default()
    };
    camera.connect().unwrap();
    camera.start_capture(&config).unwrap();

    camera.inject_fault(CameraError::HardwareFault("sensor lost".into()), Duration::from_secs(60));
    assert!(wait_for(&camera, CameraStatus::Fault, Duration::from_secs(1)));

    // The getter reports the cause once the budget is spent
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut outcome = camera.synchronized_frames();
    while Instant::now() < deadline && !matches!(outcome, Err(CameraError::HardwareFault(_))) {
        outcome = camera.synchronized_frames();
    }
    assert!(matches!(outcome, Err(CameraError::HardwareFault(_))));
    assert_eq!(camera.status(), CameraStatus::Fault);

    // Stopping from FAULT keeps FAULT; disconnect clears it
    camera.stop_capture().unwrap();
    assert_eq!(camera.status(), CameraStatus::Fault);
    camera.disconnect().unwrap();
    camera.clear_fault();
    camera.connect().unwrap();
    assert_eq!(camera.status(), CameraStatus::Connected);
}

#[test]
fn stalled_source_trips_the_watchdog() {
    let camera = SimulationCamera::new(SimulationProfile::D435, Services::default());
    let config = CameraConfig {
        width: 424,
        height: 240,
        timeout_ms: 100,
        watchdog_timeout_ms: 300,
        recovery_backoff_ms: 100,
        max_recovery_attempts: 20,
        ..Default::default()
    };
    camera.connect().unwrap();
    camera.start_capture(&config).unwrap();

    camera.set_acquisition_delay(Duration::from_millis(500));
    assert!(wait_for(&camera, CameraStatus::Fault, Duration::from_secs(2)));
    assert!(matches!(camera.last_error(), Some(CameraError::Timeout(_))));

    camera.set_acquisition_delay(Duration::ZERO);
    assert!(wait_for(&camera, CameraStatus::Capturing, Duration::from_secs(5)));
    camera.stop_capture().unwrap();
}

// ── Safety stops ────────────────────────────────────────────────────────────

#[test]
fn overheating_halts_capture() {
    let (sink, services) = recorded();
    let camera = SimulationCamera::new(SimulationProfile::FemtoMega, services);
    camera.connect().unwrap();
    camera.start_capture(&femto_config()).unwrap();

    camera.set_temperature(75.0);
    assert!(wait_for(&camera, CameraStatus::Fault, Duration::from_secs(3)));
    assert!(matches!(camera.last_error(), Some(CameraError::TemperatureError(_))));
    assert!(matches!(
        camera.synchronized_frames(),
        Err(CameraError::TemperatureError(_))
    ));
    assert!(matches!(camera.validate(), Err(CameraError::TemperatureError(_))));

    // Terminal until disconnect
    assert!(camera.start_capture(&femto_config()).is_err());
    assert!(sink.count_where(|e| e.severity == Severity::Critical && e.component == "safety") >= 1);

    camera.disconnect().unwrap();
    assert_eq!(camera.status(), CameraStatus::Disconnected);
}

#[test]
fn repeated_corruption_is_a_safety_violation() {
    let camera = SimulationCamera::new(SimulationProfile::FemtoMega, Services::default());
    camera.connect().unwrap();
    camera.start_capture(&femto_config()).unwrap();
    camera.synchronized_frames().unwrap();

    camera.corrupt_next_frames(10);
    assert!(wait_for(&camera, CameraStatus::Fault, Duration::from_secs(2)));
    assert!(matches!(camera.last_error(), Some(CameraError::SafetyViolation(_))));
    assert!(camera.performance_metrics().dropped_frames >= 5);
    camera.disconnect().unwrap();
}

#[test]
fn isolated_corruption_only_drops_frames() {
    let camera = SimulationCamera::new(SimulationProfile::FemtoMega, Services::default());
    camera.connect().unwrap();
    camera.start_capture(&femto_config()).unwrap();

    camera.corrupt_next_frames(2);
    thread::sleep(Duration::from_millis(500));
    assert_eq!(camera.status(), CameraStatus::Capturing);
    assert!(camera.performance_metrics().dropped_frames >= 2);
    assert!(camera.synchronized_frames().is_ok());
    camera.stop_capture().unwrap();
}
