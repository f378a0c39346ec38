//! Frame buffer shared between the acquisition thread and consumers
//!
//! Two bounded FIFOs (colour, depth) behind one lock plus a condition
//! variable. Getters wait on the condvar until a frame arrives, their
//! deadline passes or the store is closed. Closing wakes every waiter.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::ringbuf::FrameRingBuffer;
use crate::capture::{DepthFrame, RgbFrame};
use crate::error::{CameraError, Result};

struct Streams {
    rgb: FrameRingBuffer<RgbFrame>,
    depth: FrameRingBuffer<DepthFrame>,
    closed: Option<CameraError>,
    tolerance: Duration,
    sync_discards: u64,
    invalid_skipped: u64,
}

impl Streams {
    fn new(capacity: usize, tolerance: Duration) -> Self {
        Self {
            rgb: FrameRingBuffer::new(capacity),
            depth: FrameRingBuffer::new(capacity),
            closed: Some(CameraError::StreamClosed("capture not started".into())),
            tolerance,
            sync_discards: 0,
            invalid_skipped: 0,
        }
    }

    fn skip_invalid(&mut self) {
        while self.rgb.front().is_some_and(|f| !f.is_valid) {
            self.rgb.discard();
            self.invalid_skipped += 1;
        }
        while self.depth.front().is_some_and(|f| !f.is_valid) {
            self.depth.discard();
            self.invalid_skipped += 1;
        }
    }

    /// Pair the oldest frames, discarding toward a match. Never forces a
    /// pair outside the tolerance.
    fn try_pair(&mut self) -> Option<(RgbFrame, DepthFrame)> {
        loop {
            self.skip_invalid();
            let rgb_ts = self.rgb.front()?.timestamp;
            let depth_ts = self.depth.front()?.timestamp;

            let gap = if rgb_ts > depth_ts {
                rgb_ts - depth_ts
            } else {
                depth_ts - rgb_ts
            };

            if gap <= self.tolerance {
                let rgb = self.rgb.pop()?;
                let depth = self.depth.pop()?;
                return Some((rgb, depth));
            }

            // The older frame can never match anything newer
            if rgb_ts < depth_ts {
                self.rgb.discard();
            } else {
                self.depth.discard();
            }
            self.sync_discards += 1;
        }
    }

    fn try_rgb(&mut self) -> Option<RgbFrame> {
        self.skip_invalid();
        self.rgb.pop()
    }

    fn try_depth(&mut self) -> Option<DepthFrame> {
        self.skip_invalid();
        self.depth.pop()
    }
}

/// Counters exported to the metrics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub buffered_rgb: usize,
    pub buffered_depth: usize,
    pub overflow_drops: u64,
    pub sync_discards: u64,
    pub invalid_skipped: u64,
}

pub struct FrameStore {
    inner: Mutex<Streams>,
    ready: Condvar,
}

impl FrameStore {
    /// Create a closed store; [`FrameStore::reopen`] arms it for a session
    pub fn new(capacity: usize, tolerance: Duration) -> Self {
        Self {
            inner: Mutex::new(Streams::new(capacity, tolerance)),
            ready: Condvar::new(),
        }
    }

    /// Flush and re-arm for a new capture session
    pub fn reopen(&self, capacity: usize, tolerance: Duration) {
        let mut streams = self.inner.lock();
        *streams = Streams::new(capacity, tolerance);
        streams.closed = None;
    }

    /// Flush buffered frames and wake all waiters with `reason`
    pub fn close(&self, reason: CameraError) {
        let mut streams = self.inner.lock();
        streams.rgb.clear();
        streams.depth.clear();
        streams.closed = Some(reason);
        drop(streams);
        self.ready.notify_all();
    }

    /// Returns `true` if the oldest frame was evicted to make room
    pub fn push_rgb(&self, frame: RgbFrame) -> bool {
        let evicted = {
            let mut streams = self.inner.lock();
            if streams.closed.is_some() {
                return false;
            }
            streams.rgb.push(frame).is_some()
        };
        self.ready.notify_all();
        evicted
    }

    pub fn push_depth(&self, frame: DepthFrame) -> bool {
        let evicted = {
            let mut streams = self.inner.lock();
            if streams.closed.is_some() {
                return false;
            }
            streams.depth.push(frame).is_some()
        };
        self.ready.notify_all();
        evicted
    }

    pub fn pop_synchronized(&self, timeout: Duration) -> Result<(RgbFrame, DepthFrame)> {
        self.wait_for(timeout, "synchronized pair", Streams::try_pair)
    }

    pub fn pop_rgb(&self, timeout: Duration) -> Result<RgbFrame> {
        self.wait_for(timeout, "colour frame", Streams::try_rgb)
    }

    pub fn pop_depth(&self, timeout: Duration) -> Result<DepthFrame> {
        self.wait_for(timeout, "depth frame", Streams::try_depth)
    }

    fn wait_for<T>(
        &self,
        timeout: Duration,
        what: &str,
        mut take: impl FnMut(&mut Streams) -> Option<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut streams = self.inner.lock();

        loop {
            if let Some(reason) = &streams.closed {
                return Err(reason.clone());
            }
            if let Some(item) = take(&mut *streams) {
                return Ok(item);
            }
            if Instant::now() >= deadline {
                return Err(CameraError::Timeout(format!(
                    "no {what} within {}ms",
                    timeout.as_millis()
                )));
            }
            self.ready.wait_until(&mut streams, deadline);
        }
    }

    /// Re-verify every buffered checksum and mark mismatches invalid.
    ///
    /// Returns `(stream, frame_number)` of each frame newly marked invalid.
    pub fn revalidate(&self) -> Vec<(&'static str, u64)> {
        let mut streams = self.inner.lock();
        let mut corrupted = Vec::new();

        for frame in streams.rgb.iter_mut() {
            if frame.is_valid && !frame.verify_checksum() {
                frame.is_valid = false;
                corrupted.push(("rgb", frame.frame_number));
            }
        }
        for frame in streams.depth.iter_mut() {
            if frame.is_valid && !frame.verify_checksum() {
                frame.is_valid = false;
                corrupted.push(("depth", frame.frame_number));
            }
        }
        corrupted
    }

    pub fn stats(&self) -> StoreStats {
        let streams = self.inner.lock();
        StoreStats {
            buffered_rgb: streams.rgb.len(),
            buffered_depth: streams.depth.len(),
            overflow_drops: streams.rgb.stats().2 + streams.depth.stats().2,
            sync_discards: streams.sync_discards,
            invalid_skipped: streams.invalid_skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::test_frames;
    use std::sync::Arc;
    use std::thread;

    const TOL: Duration = Duration::from_millis(20);

    fn open_store(capacity: usize) -> FrameStore {
        let store = FrameStore::new(capacity, TOL);
        store.reopen(capacity, TOL);
        store
    }

    #[test]
    fn new_store_is_closed() {
        let store = FrameStore::new(2, TOL);
        assert!(matches!(
            store.pop_rgb(Duration::from_millis(1)),
            Err(CameraError::StreamClosed(_))
        ));
    }

    #[test]
    fn pairs_within_tolerance() {
        let store = open_store(4);
        let t0 = Instant::now();
        store.push_rgb(test_frames::rgb(1, t0));
        store.push_depth(test_frames::depth(1, t0 + Duration::from_millis(5)));

        let (rgb, depth) = store.pop_synchronized(Duration::from_millis(10)).unwrap();
        assert_eq!((rgb.frame_number, depth.frame_number), (1, 1));
    }

    #[test]
    fn out_of_tolerance_frames_are_discarded_not_forced() {
        let store = open_store(4);
        let t0 = Instant::now();
        // Depth frame 1 has no colour partner
        store.push_depth(test_frames::depth(1, t0));
        store.push_rgb(test_frames::rgb(1, t0 + Duration::from_millis(100)));
        store.push_depth(test_frames::depth(2, t0 + Duration::from_millis(105)));

        let (rgb, depth) = store.pop_synchronized(Duration::from_millis(10)).unwrap();
        assert_eq!(rgb.frame_number, 1);
        assert_eq!(depth.frame_number, 2);
        assert_eq!(store.stats().sync_discards, 1);

        store.push_rgb(test_frames::rgb(2, t0 + Duration::from_millis(200)));
        store.push_depth(test_frames::depth(3, t0 + Duration::from_millis(300)));
        assert!(matches!(
            store.pop_synchronized(Duration::from_millis(10)),
            Err(CameraError::Timeout(_))
        ));
    }

    #[test]
    fn overflow_evicts_oldest() {
        let store = open_store(2);
        let t0 = Instant::now();
        assert!(!store.push_rgb(test_frames::rgb(1, t0)));
        assert!(!store.push_rgb(test_frames::rgb(2, t0)));
        assert!(store.push_rgb(test_frames::rgb(3, t0)));

        assert_eq!(store.pop_rgb(Duration::ZERO).unwrap().frame_number, 2);
        assert_eq!(store.stats().overflow_drops, 1);
    }

    #[test]
    fn close_wakes_blocked_getter() {
        let store = Arc::new(open_store(2));
        let waiter = {
            let store = store.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let result = store.pop_synchronized(Duration::from_secs(5));
                (result, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        store.close(CameraError::StreamClosed("stopped".into()));

        let (result, waited) = waiter.join().unwrap();
        assert!(matches!(result, Err(CameraError::StreamClosed(_))));
        assert!(waited < Duration::from_secs(1));
    }

    #[test]
    fn corrupted_payload_is_caught_on_revalidation() {
        let store = open_store(4);
        let t0 = Instant::now();
        store.push_depth(test_frames::depth(1, t0));
        store.push_depth(test_frames::depth(2, t0));
        assert!(store.revalidate().is_empty());

        {
            let mut streams = store.inner.lock();
            let frame = streams.depth.iter_mut().next().unwrap();
            frame.data[3] ^= 0x00ff;
        }

        assert_eq!(store.revalidate(), vec![("depth", 1)]);
        // Invalid frames are skipped by getters
        assert_eq!(store.pop_depth(Duration::ZERO).unwrap().frame_number, 2);
        assert_eq!(store.stats().invalid_skipped, 1);
    }
}
