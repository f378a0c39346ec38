//! Rolling performance metrics
//!
//! Per-frame counters are atomics written by the pipeline threads. The
//! acquisition thread folds them into a [`PerformanceMetrics`] snapshot once
//! per cadence tick, and mirrors them through the `metrics` facade.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

use crate::camera::PerformanceMetrics;
use crate::pipeline::store::StoreStats;

/// How often the snapshot is refreshed
pub const METRICS_CADENCE: Duration = Duration::from_secs(1);

const LATENCY_WINDOW: usize = 256;

#[derive(Default)]
struct Counts {
    total: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
}

/// Frame counters shared between pipeline threads
pub struct FrameCounters {
    camera: String,
    counts: CachePadded<Counts>,
}

impl FrameCounters {
    pub fn new(camera: &str) -> Self {
        Self {
            camera: camera.to_string(),
            counts: CachePadded::new(Counts::default()),
        }
    }

    pub fn reset(&self) {
        self.counts.total.store(0, Ordering::Relaxed);
        self.counts.processed.store(0, Ordering::Relaxed);
        self.counts.dropped.store(0, Ordering::Relaxed);
    }

    pub fn frame_acquired(&self) {
        self.counts.total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("depthcam_frames_total", "camera" => self.camera.clone()).increment(1);
    }

    pub fn frame_processed(&self) {
        self.counts.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_dropped(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.counts.dropped.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("depthcam_frames_dropped_total", "camera" => self.camera.clone())
            .increment(n);
    }

    pub fn total(&self) -> u64 {
        self.counts.total.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.counts.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counts.dropped.load(Ordering::Relaxed)
    }
}

/// CPU and memory of this process, from `getrusage`
pub struct ProcessLoad {
    last_wall: Instant,
    last_cpu: Duration,
}

impl ProcessLoad {
    pub fn new() -> Self {
        Self {
            last_wall: Instant::now(),
            last_cpu: rusage().map(|(cpu, _)| cpu).unwrap_or_default(),
        }
    }

    /// (CPU percent of one core since the last sample, peak RSS in MB)
    pub fn sample(&mut self) -> (f32, f32) {
        let Some((cpu, maxrss_kb)) = rusage() else {
            return (0.0, 0.0);
        };

        let wall = self.last_wall.elapsed();
        let used = cpu.saturating_sub(self.last_cpu);
        self.last_wall = Instant::now();
        self.last_cpu = cpu;

        let percent = if wall.is_zero() {
            0.0
        } else {
            (used.as_secs_f64() / wall.as_secs_f64() * 100.0) as f32
        };
        (percent, maxrss_kb as f32 / 1024.0)
    }
}

impl Default for ProcessLoad {
    fn default() -> Self {
        Self::new()
    }
}

fn rusage() -> Option<(Duration, i64)> {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: `usage` is a valid, writable rusage struct
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }

    let tv = |t: libc::timeval| Duration::new(t.tv_sec as u64, (t.tv_usec as u32) * 1000);
    Some((tv(usage.ru_utime) + tv(usage.ru_stime), usage.ru_maxrss as i64))
}

/// Rolling fps and latency, owned by the acquisition thread
pub struct MetricsTracker {
    camera: String,
    window_start: Instant,
    frames_in_window: u32,
    current_fps: f32,
    latencies_ms: VecDeque<f32>,
    average_latency_ms: f32,
    processing_ms: f32,
    load: ProcessLoad,
    last_publish: Instant,
}

impl MetricsTracker {
    pub fn new(camera: &str) -> Self {
        Self {
            camera: camera.to_string(),
            window_start: Instant::now(),
            frames_in_window: 0,
            current_fps: 0.0,
            latencies_ms: VecDeque::with_capacity(LATENCY_WINDOW),
            average_latency_ms: 0.0,
            processing_ms: 0.0,
            load: ProcessLoad::new(),
            last_publish: Instant::now(),
        }
    }

    /// Count one published frame and its capture-to-publish latency
    pub fn record_frame(&mut self, latency: Duration) {
        self.frames_in_window += 1;

        let ms = latency.as_secs_f32() * 1000.0;
        if self.latencies_ms.len() == LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(ms);
        self.average_latency_ms = if self.average_latency_ms == 0.0 {
            ms
        } else {
            0.9 * self.average_latency_ms + 0.1 * ms
        };
        metrics::histogram!("depthcam_frame_latency_ms", "camera" => self.camera.clone())
            .record(ms as f64);
    }

    pub fn record_processing(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f32() * 1000.0;
        self.processing_ms = 0.9 * self.processing_ms + 0.1 * ms;
    }

    pub fn due(&self) -> bool {
        self.last_publish.elapsed() >= METRICS_CADENCE
    }

    fn p99(&self) -> f32 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f32> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = ((sorted.len() * 99 + 99) / 100).clamp(1, sorted.len()) - 1;
        sorted[idx]
    }

    /// Close the fps window and build a snapshot
    pub fn snapshot(
        &mut self,
        counters: &FrameCounters,
        store: StoreStats,
        temperature: f32,
        power_watts: f32,
        frame_interval: Duration,
    ) -> PerformanceMetrics {
        let elapsed = self.window_start.elapsed().as_secs_f32();
        if elapsed > 0.0 {
            self.current_fps = self.frames_in_window as f32 / elapsed;
        }
        self.window_start = Instant::now();
        self.frames_in_window = 0;
        self.last_publish = Instant::now();

        let (cpu, memory_mb) = self.load.sample();
        let interval_ms = frame_interval.as_secs_f32() * 1000.0;
        let processing_share = if interval_ms > 0.0 {
            (self.processing_ms / interval_ms * 100.0).min(100.0)
        } else {
            0.0
        };

        let snapshot = PerformanceMetrics {
            current_fps: self.current_fps,
            average_latency_ms: self.average_latency_ms,
            p99_latency_ms: self.p99(),
            dropped_frames: counters.dropped(),
            total_frames: counters.total(),
            processed_frames: counters.processed(),
            sync_discards: store.sync_discards,
            cpu_usage_percent: cpu,
            gpu_usage_percent: processing_share,
            memory_usage_mb: memory_mb,
            temperature_celsius: temperature,
            power_consumption_watts: power_watts,
        };

        let camera = self.camera.clone();
        metrics::gauge!("depthcam_fps", "camera" => camera.clone()).set(snapshot.current_fps as f64);
        metrics::gauge!("depthcam_temperature_celsius", "camera" => camera.clone())
            .set(temperature as f64);
        metrics::gauge!("depthcam_cpu_percent", "camera" => camera).set(cpu as f64);

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fps_over_window() {
        let counters = FrameCounters::new("test");
        let mut tracker = MetricsTracker::new("test");
        for _ in 0..10 {
            tracker.record_frame(Duration::from_millis(2));
        }
        thread::sleep(Duration::from_millis(100));

        let snap = tracker.snapshot(
            &counters,
            StoreStats::default(),
            35.0,
            2.8,
            Duration::from_millis(33),
        );
        // 10 frames in a bit over 100ms
        assert!(snap.current_fps > 10.0 && snap.current_fps <= 100.0);
        assert!((snap.average_latency_ms - 2.0).abs() < 0.01);
        assert_eq!(snap.temperature_celsius, 35.0);
    }

    #[test]
    fn p99_picks_tail() {
        let mut tracker = MetricsTracker::new("test");
        for _ in 0..99 {
            tracker.record_frame(Duration::from_millis(1));
        }
        tracker.record_frame(Duration::from_millis(50));
        assert!(tracker.p99() < 2.0);

        tracker.record_frame(Duration::from_millis(50));
        assert!(tracker.p99() >= 49.0);
    }

    #[test]
    fn counters_accumulate() {
        let counters = FrameCounters::new("test");
        counters.frame_acquired();
        counters.frame_acquired();
        counters.frames_dropped(3);
        counters.frames_dropped(0);
        assert_eq!((counters.total(), counters.dropped()), (2, 3));

        counters.reset();
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn process_load_reads_rusage() {
        let mut load = ProcessLoad::new();
        let (_, memory) = load.sample();
        assert!(memory > 0.0);
    }
}
