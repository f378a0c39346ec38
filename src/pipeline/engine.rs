//! Capture engine shared by every backend
//!
//! A [`CapturePipeline`] owns one [`FrameSource`] and runs a capture session
//! on dedicated threads:
//!
//! * acquisition: reads the source, converts, checks integrity, publishes
//!   into the [`FrameStore`], runs the watchdog and bounded recovery
//! * processing (optional): depth filtering off the acquisition thread
//! * dispatch: delivers synchronized pairs to the frame callback through a
//!   bounded channel, so a slow callback drops pairs instead of stalling
//!   acquisition
//!
//! Status, metrics and buffered frames are read through snapshots; no lock
//! taken by a getter is ever held across a device call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use chrono::NaiveDate;
use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use super::filters::DepthFilterChain;
use super::metrics::{FrameCounters, MetricsTracker};
use super::store::FrameStore;
use super::watchdog::Watchdog;
use crate::camera::{
    CameraStatus, ErrorCallback, ErrorReport, FrameCallback, PerformanceMetrics, StatusCallback,
    ThermalStatus,
};
use crate::capture::frame::depth_checksum;
use crate::capture::{
    decoder, CameraCapabilities, DepthFrame, DepthPayload, FrameSource, Intrinsics, RawColor,
    RawDepth, RgbFrame,
};
use crate::config::CameraConfig;
use crate::error::{CameraError, Result};
use crate::events::{Event, Severity};
use crate::Services;

/// Consecutive transport checksum failures treated as data corruption
pub const CORRUPTION_ESCALATION: u32 = 5;

pub type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// Per-backend shape of the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    /// Camera type identifier used in events and metrics labels
    pub camera_type: String,
    /// Run depth filtering on its own thread
    pub processing_stage: bool,
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

struct Shared {
    spec: PipelineSpec,
    services: Services,

    status: AtomicCell<CameraStatus>,
    last_error: Mutex<Option<CameraError>>,
    /// Set when a thread stopped the session on a safety error
    halted: AtomicBool,

    store: FrameStore,
    counters: FrameCounters,
    tracker: Mutex<MetricsTracker>,
    metrics: ArcSwap<PerformanceMetrics>,
    watchdog: Watchdog,

    timeout: AtomicCell<Duration>,
    filter_level: AtomicCell<u8>,
    power_scale: AtomicCell<f32>,
    temperature: AtomicCell<Option<f32>>,

    caps: Mutex<Option<CameraCapabilities>>,
    calibrated: Mutex<Option<(u32, u32, Intrinsics)>>,

    frame_cb: ArcSwapOption<FrameCallback>,
    error_cb: ArcSwapOption<ErrorCallback>,
    status_cb: ArcSwapOption<StatusCallback>,
}

impl Shared {
    fn record(&self, event: Event) {
        self.services.record(event.with("camera", &self.spec.camera_type));
    }

    fn set_status(&self, status: CameraStatus, reason: &str) {
        let previous = self.status.swap(status);
        if previous == status {
            return;
        }

        debug!(camera = %self.spec.camera_type, from = %previous, to = %status, "{}", reason);
        let severity = match status {
            CameraStatus::Fault => Severity::Error,
            CameraStatus::Error => Severity::Warning,
            _ => Severity::Info,
        };
        self.record(
            Event::new(severity, "camera", format!("status {previous} -> {status}"))
                .with("reason", reason),
        );

        if let Some(cb) = self.status_cb.load_full() {
            (*cb)(status, reason);
        }
    }

    fn report_error(&self, error: &CameraError, message: String, recovered: bool) {
        if !recovered {
            *self.last_error.lock() = Some(error.clone());
        }
        if let Some(cb) = self.error_cb.load_full() {
            (*cb)(&ErrorReport {
                error: error.clone(),
                message,
                recovered,
            });
        }
    }

    /// Stop the session for good. Only `disconnect` leaves the resulting FAULT.
    fn halt(&self, error: CameraError) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }

        error!(camera = %self.spec.camera_type, code = error.code(), "Safety stop: {}", error);
        self.set_status(CameraStatus::Fault, &error.to_string());
        self.record(
            Event::new(Severity::Critical, "safety", format!("capture halted: {error}"))
                .with("error", error.name())
                .with("code", error.code()),
        );
        self.report_error(&error, format!("capture halted: {error}"), false);
        self.store.close(error);
    }
}

/// Capture engine wrapped by each backend
pub struct CapturePipeline {
    shared: Arc<Shared>,
    source: SharedSource,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
    session: Option<Session>,
    last_config: Option<CameraConfig>,
}

struct Session {
    shutdown: Sender<()>,
    threads: Vec<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn new(spec: PipelineSpec, source: Box<dyn FrameSource>, services: Services) -> Self {
        let defaults = CameraConfig::default();
        let shared = Shared {
            counters: FrameCounters::new(&spec.camera_type),
            tracker: Mutex::new(MetricsTracker::new(&spec.camera_type)),
            spec,
            services,
            status: AtomicCell::new(CameraStatus::Disconnected),
            last_error: Mutex::new(None),
            halted: AtomicBool::new(false),
            store: FrameStore::new(defaults.buffer_size, defaults.sync_tolerance()),
            metrics: ArcSwap::from_pointee(PerformanceMetrics::default()),
            watchdog: Watchdog::new(defaults.watchdog_timeout()),
            timeout: AtomicCell::new(defaults.timeout()),
            filter_level: AtomicCell::new(defaults.filter_level),
            power_scale: AtomicCell::new(1.0),
            temperature: AtomicCell::new(None),
            caps: Mutex::new(None),
            calibrated: Mutex::new(None),
            frame_cb: ArcSwapOption::empty(),
            error_cb: ArcSwapOption::empty(),
            status_cb: ArcSwapOption::empty(),
        };

        Self {
            shared: Arc::new(shared),
            source: Arc::new(Mutex::new(source)),
            control: Mutex::new(Control::default()),
        }
    }

    pub fn camera_type(&self) -> &str {
        &self.shared.spec.camera_type
    }

    pub fn services(&self) -> &Services {
        &self.shared.services
    }

    pub fn record(&self, severity: Severity, component: &str, message: impl Into<String>) {
        self.shared.record(Event::new(severity, component, message));
    }

    pub fn status(&self) -> CameraStatus {
        self.shared.status.load()
    }

    pub fn last_error(&self) -> Option<CameraError> {
        self.shared.last_error.lock().clone()
    }

    pub fn capabilities(&self) -> Option<CameraCapabilities> {
        self.shared.caps.lock().clone()
    }

    /// Run `f` against the frame source, e.g. to set a device option
    pub fn with_source<R>(&self, f: impl FnOnce(&mut dyn FrameSource) -> R) -> R {
        let mut source = self.source.lock();
        f(source.as_mut())
    }

    /// Config of the running session, or of the last one
    pub fn session_config(&self) -> Option<CameraConfig> {
        self.control.lock().last_config.clone()
    }

    /// Live threads of the current session
    pub fn active_workers(&self) -> usize {
        self.control
            .lock()
            .session
            .as_ref()
            .map(|s| s.threads.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    pub fn filter_level(&self) -> u8 {
        self.shared.filter_level.load()
    }

    /// Takes effect from the next depth frame
    pub fn set_filter_level(&self, level: u8) {
        self.shared.filter_level.store(level.min(super::filters::MAX_FILTER_LEVEL));
    }

    /// Scale applied to the nominal power draw in metrics
    pub fn set_power_scale(&self, scale: f32) {
        self.shared.power_scale.store(scale);
    }

    #[instrument(skip(self), fields(camera = %self.camera_type()))]
    pub fn connect(&self) -> Result<()> {
        let _control = self.control.lock();
        if self.status().is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        self.shared.set_status(CameraStatus::Connecting, "connect requested");
        let opened = self.source.lock().open();
        match opened {
            Ok(mut caps) => {
                caps.refresh_calibration_status(today());
                info!(
                    "Connected to {} (serial {}, firmware {})",
                    caps.model_name, caps.serial_number, caps.firmware_version
                );
                if caps.requires_recalibration {
                    warn!("{} requires calibration before capture", caps.model_name);
                }
                *self.shared.caps.lock() = Some(caps);
                self.shared.halted.store(false, Ordering::SeqCst);
                self.shared.set_status(CameraStatus::Connected, "device opened");
                Ok(())
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                *self.shared.last_error.lock() = Some(e.clone());
                self.shared.set_status(CameraStatus::Error, &e.to_string());
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(camera = %self.camera_type()))]
    pub fn disconnect(&self) -> Result<()> {
        self.stop_capture()?;

        let _control = self.control.lock();
        self.source.lock().close();
        *self.shared.caps.lock() = None;
        self.shared.halted.store(false, Ordering::SeqCst);
        self.shared.temperature.store(None);
        self.shared.set_status(CameraStatus::Disconnected, "disconnect requested");
        info!("Disconnected");
        Ok(())
    }

    #[instrument(skip(self, config), fields(camera = %self.camera_type()))]
    pub fn start_capture(&self, config: &CameraConfig) -> Result<()> {
        let mut control = self.control.lock();
        let status = self.status();

        if !status.is_connected() {
            return Err(CameraError::ConnectionFailed("camera not connected".into()));
        }
        if status == CameraStatus::Fault {
            return Err(CameraError::HardwareFault(
                "camera is in FAULT, disconnect before restarting".into(),
            ));
        }
        if control.session.is_some() {
            return Err(CameraError::InvalidConfiguration(
                "capture already running, stop it before reconfiguring".into(),
            ));
        }

        let caps = self
            .capabilities()
            .ok_or_else(|| CameraError::ConnectionFailed("capabilities unavailable".into()))?;
        config.validate_against(&caps)?;
        if caps.requires_recalibration {
            return Err(CameraError::CalibrationError(format!(
                "{} calibration is missing or stale",
                caps.model_name
            )));
        }

        self.shared.set_status(CameraStatus::Initializing, "starting capture");
        let started = {
            let mut source = self.source.lock();
            source.start(config).map(|_| {
                let intrinsics = match &*self.shared.calibrated.lock() {
                    Some((w, h, i)) if *w == config.width && *h == config.height => i.clone(),
                    _ => source.intrinsics(config.width, config.height),
                };
                (source.device_id().to_string(), intrinsics)
            })
        };
        let (device_id, intrinsics) = match started {
            Ok(v) => v,
            Err(e) => {
                warn!("Source failed to start: {}", e);
                *self.shared.last_error.lock() = Some(e.clone());
                self.shared.set_status(status, "start failed");
                return Err(e);
            }
        };

        let shared = &self.shared;
        shared.store.reopen(config.buffer_size, config.sync_tolerance());
        shared.counters.reset();
        *shared.tracker.lock() = MetricsTracker::new(&shared.spec.camera_type);
        shared.metrics.store(Arc::new(PerformanceMetrics::default()));
        shared.watchdog.arm(config.watchdog_timeout());
        shared.timeout.store(config.timeout());
        shared.filter_level.store(config.filter_level);
        shared.halted.store(false, Ordering::SeqCst);

        // Workers may report FAULT as soon as they run
        shared.set_status(CameraStatus::Capturing, "capture started");

        match self.spawn_session(config, &caps, device_id, intrinsics) {
            Ok(session) => {
                control.session = Some(session);
                control.last_config = Some(config.clone());
                info!(
                    "Capturing {}x{} @ {}fps, buffer {}, tolerance {:?}",
                    config.width,
                    config.height,
                    config.fps,
                    config.buffer_size,
                    config.sync_tolerance()
                );
                Ok(())
            }
            Err(e) => {
                shared.store.close(e.clone());
                self.source.lock().stop();
                *shared.last_error.lock() = Some(e.clone());
                shared.set_status(status, "start failed");
                Err(e)
            }
        }
    }

    fn spawn_session(
        &self,
        config: &CameraConfig,
        caps: &CameraCapabilities,
        device_id: String,
        intrinsics: Intrinsics,
    ) -> Result<Session> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let (dispatch_tx, dispatch_rx) = flume::bounded(config.buffer_size.max(1));
        let name = &self.shared.spec.camera_type;

        let publisher = Publisher {
            shared: self.shared.clone(),
            config: config.clone(),
            tolerance: config.sync_tolerance(),
            range_mm: (caps.min_depth_mm, caps.max_depth_mm),
            pairing: Arc::new(Mutex::new(Pairing::default())),
            dispatch: dispatch_tx,
        };

        let mut threads = Vec::with_capacity(3);
        let mut spawn = |role: &str, f: Box<dyn FnOnce() + Send>| -> Result<()> {
            let handle = thread::Builder::new()
                .name(format!("{name}-{role}"))
                .spawn(f)
                .map_err(|e| CameraError::InitializationFailed(format!("spawn {role} thread: {e}")))?;
            threads.push(handle);
            Ok(())
        };

        let chain = || DepthFilterChain::new(config.filter_level, caps.min_depth_mm, caps.max_depth_mm);

        let processing = if self.shared.spec.processing_stage {
            let (tx, rx) = flume::bounded(config.buffer_size.max(1));
            let stage = publisher.clone();
            let filters = chain();
            spawn("proc", Box::new(move || processing_loop(stage, filters, rx)))?;
            Some(tx)
        } else {
            None
        };

        let acquisition = Acquisition {
            publisher,
            source: self.source.clone(),
            shutdown: shutdown_rx,
            processing,
            filters: chain(),
            device_id,
            depth_scale: caps.depth_scale,
            intrinsics,
            nominal_watts: caps.power_consumption_mw as f32 / 1000.0,
            rgb_seq: 0,
            depth_seq: 0,
            corrupt_streak: [0; 2],
        };
        spawn("acq", Box::new(move || acquisition.run()))?;

        let shared = self.shared.clone();
        spawn("dispatch", Box::new(move || dispatch_loop(shared, dispatch_rx)))?;

        Ok(Session {
            shutdown: shutdown_tx,
            threads,
        })
    }

    /// Stop acquisition. Blocked getters wake with `StreamClosed`.
    #[instrument(skip(self), fields(camera = %self.camera_type()))]
    pub fn stop_capture(&self) -> Result<()> {
        let mut control = self.control.lock();
        let Some(session) = control.session.take() else {
            return Ok(());
        };

        drop(session.shutdown);
        self.shared
            .store
            .close(CameraError::StreamClosed("capture stopped".into()));

        for handle in session.threads {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!("{} thread panicked", name);
            }
        }

        self.source.lock().stop();
        if self.status() != CameraStatus::Fault {
            self.shared.set_status(CameraStatus::Ready, "capture stopped");
        }
        info!("Capture stopped");
        Ok(())
    }

    pub fn synchronized_frames(&self) -> Result<(RgbFrame, DepthFrame)> {
        self.shared.store.pop_synchronized(self.shared.timeout.load())
    }

    pub fn rgb_frame(&self) -> Result<RgbFrame> {
        self.shared.store.pop_rgb(self.shared.timeout.load())
    }

    pub fn depth_frame(&self) -> Result<DepthFrame> {
        self.shared.store.pop_depth(self.shared.timeout.load())
    }

    #[instrument(skip(self), fields(camera = %self.camera_type()))]
    pub fn calibrate(&self) -> Result<()> {
        let control = self.control.lock();
        if !self.status().is_connected() {
            return Err(CameraError::CalibrationError("camera not connected".into()));
        }

        let config = control.last_config.clone().unwrap_or_default();
        let intrinsics = self
            .source
            .lock()
            .calibrate(config.width, config.height)?;

        let date = today();
        if let Some(caps) = self.shared.caps.lock().as_mut() {
            caps.record_calibration(date);
        }
        info!(
            "Calibrated at {}x{}: fx={:.1} fy={:.1} cx={:.1} cy={:.1}",
            config.width, config.height, intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy
        );
        *self.shared.calibrated.lock() = Some((config.width, config.height, intrinsics));
        self.shared.record(
            Event::new(Severity::Info, "calibration", "calibration completed").with("date", date),
        );
        Ok(())
    }

    /// Self-diagnostic. On a disconnected camera the link is opened, tested
    /// and closed again without changing status.
    #[instrument(skip(self), fields(camera = %self.camera_type()))]
    pub fn validate(&self) -> Result<()> {
        let control = self.control.lock();
        let config = control.last_config.clone().unwrap_or_default();

        if !self.status().is_connected() {
            let mut source = self.source.lock();
            let result = source.open().and_then(|_| source.self_test());
            source.close();
            return result;
        }

        if self.status() == CameraStatus::Fault {
            return Err(self
                .last_error()
                .unwrap_or_else(|| CameraError::HardwareFault("camera in FAULT".into())));
        }

        let capturing = control.session.is_some();
        drop(control);

        let temperature = if capturing {
            self.shared.temperature.load()
        } else {
            let mut source = self.source.lock();
            source.self_test()?;
            source.temperature()
        };
        if let Some(t) = temperature {
            if t > config.max_temperature {
                return Err(CameraError::TemperatureError(format!(
                    "{t:.1}°C exceeds {:.1}°C",
                    config.max_temperature
                )));
            }
        }

        if capturing && self.shared.watchdog.expired() {
            return Err(CameraError::Timeout(format!(
                "no valid frame for {}ms",
                self.shared.watchdog.since_last_heartbeat().as_millis()
            )));
        }

        let corrupted = self.shared.store.revalidate();
        if let Some(&(stream, frame_number)) = corrupted.first() {
            self.shared.counters.frames_dropped(corrupted.len() as u64);
            self.shared.record(
                Event::new(Severity::Warning, "integrity", "buffered frames failed checksum")
                    .with("count", corrupted.len()),
            );
            if config.enable_checksums {
                return Err(CameraError::ChecksumMismatch {
                    stream,
                    frame_number,
                });
            }
        }
        Ok(())
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let mut metrics = (**self.shared.metrics.load()).clone();
        // Counters move between snapshots
        metrics.dropped_frames = self.shared.counters.dropped();
        metrics.total_frames = self.shared.counters.total();
        metrics.processed_frames = self.shared.counters.processed();
        metrics
    }

    pub fn thermal_status(&self) -> Option<ThermalStatus> {
        let max = self
            .control
            .lock()
            .last_config
            .as_ref()
            .map(|c| c.max_temperature)
            .unwrap_or_else(|| CameraConfig::default().max_temperature);

        let temperature = match self.shared.temperature.load() {
            Some(t) => Some(t),
            None if self.status().is_connected() => self.source.lock().temperature(),
            None => None,
        };
        temperature.map(|t| ThermalStatus::evaluate(t, max))
    }

    pub fn set_frame_callback(&self, callback: Option<FrameCallback>) {
        self.shared.frame_cb.store(callback.map(Arc::new));
    }

    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        self.shared.error_cb.store(callback.map(Arc::new));
    }

    pub fn set_status_callback(&self, callback: Option<StatusCallback>) {
        self.shared.status_cb.store(callback.map(Arc::new));
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if self.control.get_mut().session.is_some() {
            let _ = self.stop_capture();
        }
        self.source.lock().close();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Publishing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Pairing {
    rgb: Option<RgbFrame>,
    depth: Option<DepthFrame>,
}

/// Final stage shared by the acquisition and processing threads
#[derive(Clone)]
struct Publisher {
    shared: Arc<Shared>,
    config: CameraConfig,
    tolerance: Duration,
    range_mm: (f32, f32),
    pairing: Arc<Mutex<Pairing>>,
    dispatch: flume::Sender<(RgbFrame, DepthFrame)>,
}

impl Publisher {
    /// Recompute statistics and validity, then seal the checksum
    fn finish_depth(&self, frame: &mut DepthFrame) {
        frame.update_statistics();
        if self.config.enable_validation {
            let (min, max) = self.range_mm;
            frame.is_valid = frame.valid_pixels > 0
                && frame.fill_ratio() >= self.config.min_confidence
                && frame.average_depth >= min
                && frame.average_depth <= max;
        }
        frame.seal();
    }

    fn intact(&self, valid: bool, checksum_ok: impl FnOnce() -> bool) -> bool {
        valid && (!self.config.enable_checksums || checksum_ok())
    }

    fn publish_rgb(&self, frame: RgbFrame) {
        let shared = &self.shared;
        if !self.intact(frame.is_valid, || frame.verify_checksum()) {
            trace!(frame = frame.frame_number, "colour frame rejected");
            shared.counters.frames_dropped(1);
            return;
        }

        if shared.frame_cb.load().is_some() {
            let mut pairing = self.pairing.lock();
            pairing.rgb = Some(frame.clone());
            self.try_pair(&mut pairing);
        }

        if shared.store.push_rgb(frame) {
            shared.counters.frames_dropped(1);
        }
        shared.watchdog.heartbeat();
    }

    fn publish_depth(&self, frame: DepthFrame) {
        let shared = &self.shared;
        if !self.intact(frame.is_valid, || frame.verify_checksum()) {
            trace!(frame = frame.frame_number, fill = frame.fill_ratio(), "depth frame rejected");
            shared.counters.frames_dropped(1);
            return;
        }

        let latency = frame.timestamp.elapsed();
        if shared.frame_cb.load().is_some() {
            let mut pairing = self.pairing.lock();
            pairing.depth = Some(frame.clone());
            self.try_pair(&mut pairing);
        }

        if shared.store.push_depth(frame) {
            shared.counters.frames_dropped(1);
        }
        shared.counters.frame_processed();
        shared.tracker.lock().record_frame(latency);
        shared.watchdog.heartbeat();
    }

    fn try_pair(&self, pairing: &mut Pairing) {
        match (pairing.rgb.take(), pairing.depth.take()) {
            (Some(rgb), Some(depth)) => {
                let gap = if rgb.timestamp > depth.timestamp {
                    rgb.timestamp - depth.timestamp
                } else {
                    depth.timestamp - rgb.timestamp
                };
                if gap <= self.tolerance {
                    if self.dispatch.try_send((rgb, depth)).is_err() {
                        trace!("Frame callback busy, pair dropped");
                    }
                } else if rgb.timestamp < depth.timestamp {
                    pairing.depth = Some(depth);
                } else {
                    pairing.rgb = Some(rgb);
                }
            }
            (rgb, depth) => {
                pairing.rgb = rgb;
                pairing.depth = depth;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Threads
// ────────────────────────────────────────────────────────────────────────────

struct Acquisition {
    publisher: Publisher,
    source: SharedSource,
    shutdown: Receiver<()>,
    processing: Option<flume::Sender<DepthFrame>>,
    filters: DepthFilterChain,

    device_id: String,
    depth_scale: f32,
    intrinsics: Intrinsics,
    nominal_watts: f32,

    rgb_seq: u64,
    depth_seq: u64,
    /// Consecutive transport mismatches per stream (colour, depth)
    corrupt_streak: [u32; 2],
}

impl Acquisition {
    fn shared(&self) -> &Shared {
        &self.publisher.shared
    }

    fn config(&self) -> &CameraConfig {
        &self.publisher.config
    }

    fn stopping(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn run(mut self) {
        info!(camera = %self.shared().spec.camera_type, device = %self.device_id, "Acquisition started");

        loop {
            if self.stopping() || self.shared().halted.load(Ordering::SeqCst) {
                break;
            }

            match self.acquire_once() {
                Ok(()) => {}
                Err(e) if e.is_safety_critical() => {
                    self.shared().halt(e);
                    break;
                }
                Err(CameraError::StreamClosed(_)) if self.stopping() => break,
                Err(e) if e.is_transient() => {
                    trace!("Transient capture error: {}", e);
                    self.shared().counters.frames_dropped(1);
                }
                Err(e) => {
                    if !self.recover(e) {
                        break;
                    }
                    continue;
                }
            }

            if self.shared().watchdog.expired() {
                let timeout = self.shared().watchdog.timeout();
                let e = CameraError::Timeout(format!(
                    "watchdog: no valid frame within {}ms",
                    timeout.as_millis()
                ));
                if !self.recover(e) {
                    break;
                }
                continue;
            }

            if self.shared().tracker.lock().due() {
                if let Err(e) = self.tick() {
                    self.shared().halt(e);
                    break;
                }
            }
        }

        info!(camera = %self.shared().spec.camera_type, "Acquisition stopped");
    }

    fn acquire_once(&mut self) -> Result<()> {
        let timeout = self.config().timeout();
        let frames = self.source.lock().read(timeout)?;

        if let Some(raw) = frames.depth {
            if self.config().enable_depth {
                self.handle_depth(raw)?;
            }
        }
        if let Some(raw) = frames.color {
            if self.config().enable_color {
                self.handle_color(raw)?;
            }
        }
        Ok(())
    }

    /// Compare the link's CRC with what arrived. Repeated mismatches are a
    /// safety violation.
    fn check_transport(
        &mut self,
        stream: &'static str,
        frame_number: u64,
        expected: Option<u32>,
        actual: impl FnOnce() -> u32,
    ) -> Result<bool> {
        let Some(expected) = expected.filter(|_| self.config().enable_checksums) else {
            return Ok(true);
        };
        let slot = usize::from(stream == "depth");
        if actual() == expected {
            self.corrupt_streak[slot] = 0;
            return Ok(true);
        }

        self.corrupt_streak[slot] += 1;
        let streak = self.corrupt_streak[slot];
        let error = CameraError::ChecksumMismatch {
            stream,
            frame_number,
        };
        warn!("{} (streak {})", error, streak);
        self.shared().counters.frames_dropped(1);
        self.shared().record(
            Event::new(Severity::Warning, "integrity", error.to_string())
                .with("code", error.code())
                .with("streak", streak),
        );

        if streak >= CORRUPTION_ESCALATION {
            return Err(CameraError::SafetyViolation(format!(
                "{} consecutive checksum mismatches, data corruption suspected",
                streak
            )));
        }
        Ok(false)
    }

    fn handle_color(&mut self, raw: RawColor) -> Result<()> {
        self.rgb_seq += 1;
        let frame_number = self.rgb_seq;
        self.shared().counters.frame_acquired();

        let data = &raw.data;
        if !self.check_transport("rgb", frame_number, raw.transport_crc, || crc32fast::hash(data))? {
            return Ok(());
        }

        let order = self.config().color_format;
        let pixels = decoder::decode_color(&raw.data, raw.format, raw.width, raw.height, order)?;

        let mut frame = RgbFrame {
            data: Bytes::from(pixels),
            width: raw.width,
            height: raw.height,
            channels: 3,
            bytes_per_pixel: 3,
            order,
            timestamp: raw.captured_at,
            device_timestamp: raw.device_timestamp,
            frame_number,
            brightness: 0.0,
            contrast: 0.0,
            is_valid: true,
            device_id: self.device_id.clone(),
            checksum: 0,
        };
        frame.update_quality();
        if self.config().enable_validation {
            frame.is_valid = frame.data.len() == frame.expected_len();
        }
        frame.seal();

        self.publisher.publish_rgb(frame);
        Ok(())
    }

    fn handle_depth(&mut self, raw: RawDepth) -> Result<()> {
        self.depth_seq += 1;
        let frame_number = self.depth_seq;
        self.shared().counters.frame_acquired();

        let data = match raw.payload {
            DepthPayload::Packed(bytes, format) => {
                if !self.check_transport("depth", frame_number, raw.transport_crc, || {
                    crc32fast::hash(&bytes)
                })? {
                    return Ok(());
                }
                decoder::decode_depth(&bytes, format, raw.width, raw.height)?
            }
            DepthPayload::Unpacked(values) => {
                if !self.check_transport("depth", frame_number, raw.transport_crc, || {
                    depth_checksum(&values)
                })? {
                    return Ok(());
                }
                values
            }
        };

        if data.len() != (raw.width * raw.height) as usize {
            return Err(CameraError::CaptureFailed(format!(
                "depth frame {} has {} pixels, expected {}x{}",
                frame_number,
                data.len(),
                raw.width,
                raw.height
            )));
        }

        let mut frame = DepthFrame {
            data,
            width: raw.width,
            height: raw.height,
            depth_scale: self.depth_scale,
            timestamp: raw.captured_at,
            device_timestamp: raw.device_timestamp,
            frame_number,
            min_depth: 0.0,
            max_depth: 0.0,
            average_depth: 0.0,
            valid_pixels: 0,
            intrinsics: self.intrinsics.clone(),
            is_valid: true,
            device_id: self.device_id.clone(),
            checksum: 0,
        };

        match &self.processing {
            Some(stage) => {
                if stage.try_send(frame).is_err() {
                    trace!("Processing stage full, depth frame {} dropped", frame_number);
                    self.shared().counters.frames_dropped(1);
                }
            }
            None => {
                let started = Instant::now();
                let level = self.shared().filter_level.load();
                if self.filters.level() != level {
                    self.filters.set_level(level);
                }
                self.filters.apply(&mut frame);
                self.publisher.finish_depth(&mut frame);
                self.shared().tracker.lock().record_processing(started.elapsed());
                self.publisher.publish_depth(frame);
            }
        }
        Ok(())
    }

    /// Metrics cadence and thermal check
    fn tick(&mut self) -> Result<()> {
        let temperature = self.source.lock().temperature();
        let shared = self.shared();
        shared.temperature.store(temperature);

        let power = self.nominal_watts * shared.power_scale.load();
        let snapshot = shared.tracker.lock().snapshot(
            &shared.counters,
            shared.store.stats(),
            temperature.unwrap_or(0.0),
            power,
            self.config().frame_interval(),
        );
        trace!(fps = snapshot.current_fps, dropped = snapshot.dropped_frames, "metrics");
        shared.metrics.store(Arc::new(snapshot));

        let Some(t) = temperature else {
            return Ok(());
        };
        let max = self.config().max_temperature;
        if self.config().enable_safety_monitoring && t > max {
            return Err(CameraError::TemperatureError(format!(
                "sensor at {t:.1}°C, limit {max:.1}°C"
            )));
        }
        let thermal = ThermalStatus::evaluate(t, max);
        if thermal.warning {
            warn!("Sensor at {:.1}°C, throttling level {}", t, thermal.throttling_level);
            shared.record(
                Event::new(Severity::Warning, "thermal", "temperature approaching limit")
                    .with("celsius", format!("{t:.1}")),
            );
        }
        Ok(())
    }

    /// Bounded recovery: close, reopen, restart and probe the source, with
    /// exponential backoff between attempts.
    ///
    /// Returns `true` if capture resumed.
    fn recover(&mut self, cause: CameraError) -> bool {
        let shared = self.publisher.shared.clone();
        let config = self.publisher.config.clone();

        warn!(code = cause.code(), "Capture fault: {}", cause);
        shared.set_status(CameraStatus::Fault, &cause.to_string());
        shared.report_error(&cause, format!("capture fault: {cause}"), false);

        let attempts = config.max_recovery_attempts;
        for attempt in 1..=attempts {
            match self.shutdown.recv_timeout(config.recovery_delay(attempt)) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return false,
            }

            let result = {
                let mut source = self.source.lock();
                source.stop();
                source.close();
                source
                    .open()
                    .and_then(|_| source.start(&config))
                    .and_then(|_| source.read(config.timeout()))
            };

            match result {
                Ok(_) => {
                    info!("Recovered after {} attempt(s)", attempt);
                    self.corrupt_streak = [0; 2];
                    shared.watchdog.heartbeat();
                    shared.set_status(CameraStatus::Capturing, "recovered");
                    shared.record(
                        Event::new(Severity::Info, "recovery", "capture resumed")
                            .with("attempts", attempt)
                            .with("cause", cause.name()),
                    );
                    shared.report_error(
                        &cause,
                        format!("recovered after {attempt} attempt(s)"),
                        true,
                    );
                    return true;
                }
                Err(e) if e.is_safety_critical() => {
                    shared.halt(e);
                    return false;
                }
                Err(e) => {
                    debug!("Recovery attempt {}/{} failed: {}", attempt, attempts, e);
                }
            }
        }

        error!("Recovery exhausted after {} attempts", attempts);
        shared.record(
            Event::new(Severity::Critical, "recovery", "recovery budget exhausted")
                .with("attempts", attempts)
                .with("cause", cause.name()),
        );
        shared.report_error(
            &cause,
            format!("recovery exhausted after {attempts} attempts"),
            false,
        );
        shared.store.close(cause);
        false
    }
}

fn processing_loop(publisher: Publisher, mut filters: DepthFilterChain, rx: flume::Receiver<DepthFrame>) {
    debug!("Processing stage started");
    while let Ok(mut frame) = rx.recv() {
        let level = publisher.shared.filter_level.load();
        if filters.level() != level {
            filters.set_level(level);
        }

        let started = Instant::now();
        filters.apply(&mut frame);
        publisher.finish_depth(&mut frame);
        publisher
            .shared
            .tracker
            .lock()
            .record_processing(started.elapsed());
        publisher.publish_depth(frame);
    }
    debug!("Processing stage stopped");
}

fn dispatch_loop(shared: Arc<Shared>, rx: flume::Receiver<(RgbFrame, DepthFrame)>) {
    while let Ok((rgb, depth)) = rx.recv() {
        if let Some(cb) = shared.frame_cb.load_full() {
            (*cb)(&rgb, &depth);
        }
    }
}
