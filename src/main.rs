//! depthcam capture runner
//!
//! Picks the best available camera, streams synchronized pairs and logs
//! performance once a second until Ctrl-C or `frame_limit`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use depthcam::{Camera, CameraError, ErrorReport, HardwareFactory, Services, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("depthcam launching...");

    let services = Services::default();
    let factory = HardwareFactory::new(settings.factory.clone(), services);
    let camera: Arc<dyn Camera> = factory
        .create_best_camera()
        .map(Arc::from)
        .ok_or_else(|| eyre!("no camera available: {:?}", factory.factory_status().error_messages))?;

    info!("Using camera {}", camera.id());
    camera.connect()?;
    if camera.capabilities().is_some_and(|caps| caps.requires_recalibration) {
        info!("Calibrating {}", camera.id());
        camera.calibrate()?;
    }
    camera.set_error_callback(Some(Box::new(|report: &ErrorReport| {
        if report.recovered {
            info!("Capture recovered: {}", report.message);
        } else {
            warn!("Camera error {}: {}", report.error.name(), report.message);
        }
    })));
    camera.start_capture(&settings.camera)?;

    let running = Arc::new(AtomicBool::new(true));
    let worker = {
        let camera = camera.clone();
        let running = running.clone();
        let limit = settings.frame_limit;
        tokio::task::spawn_blocking(move || pull_frames(camera.as_ref(), &running, limit))
    };

    let pulled = tokio::select! {
        result = worker => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received");
            running.store(false, Ordering::SeqCst);
            // Unblocks a getter waiting on the store
            camera.stop_capture()?;
            0
        }
    };

    if camera.is_capturing() {
        camera.stop_capture()?;
    }
    camera.disconnect()?;

    let metrics = camera.performance_metrics();
    info!(
        pulled,
        total = metrics.total_frames,
        dropped = metrics.dropped_frames,
        "depthcam shutting down"
    );
    Ok(())
}

/// Pull pairs until stopped; returns the number received
fn pull_frames(camera: &dyn Camera, running: &AtomicBool, limit: u64) -> u64 {
    let mut pulled = 0u64;
    let mut last_report = Instant::now();

    while running.load(Ordering::SeqCst) && (limit == 0 || pulled < limit) {
        match camera.synchronized_frames() {
            Ok((rgb, depth)) => {
                pulled += 1;
                tracing::trace!(
                    rgb = rgb.frame_number,
                    depth = depth.frame_number,
                    valid = depth.valid_pixels,
                    "pair"
                );
            }
            Err(CameraError::StreamClosed(_)) => break,
            Err(e) if e.is_transient() => warn!("{}", e),
            Err(e) => {
                error!("Capture stopped: {}", e);
                break;
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let m = camera.performance_metrics();
            info!(
                fps = format_args!("{:.1}", m.current_fps),
                latency_ms = format_args!("{:.2}", m.average_latency_ms),
                p99_ms = format_args!("{:.2}", m.p99_latency_ms),
                dropped = m.dropped_frames,
                temp_c = format_args!("{:.1}", m.temperature_celsius),
                status = %camera.status(),
                "capture"
            );
            last_report = Instant::now();
        }
    }
    pulled
}
