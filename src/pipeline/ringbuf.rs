//! Bounded frame FIFO

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Fixed-capacity FIFO that evicts the oldest frame when full
pub struct FrameRingBuffer<T> {
    ring: HeapRb<T>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
}

impl<T> FrameRingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Push a frame, returning the evicted oldest frame if the ring was full
    pub fn push(&mut self, frame: T) -> Option<T> {
        let evicted = self.ring.push_overwrite(frame);
        if evicted.is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        let frame = self.ring.try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Remove the oldest frame without counting it as read
    pub fn discard(&mut self) -> Option<T> {
        self.ring.try_pop()
    }

    pub fn front(&self) -> Option<&T> {
        self.ring.try_peek()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.ring.iter_mut()
    }

    pub fn clear(&mut self) -> usize {
        self.ring.clear()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    /// (written, read, dropped)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.frames_written.load(Ordering::Relaxed),
            self.stats.frames_read.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let mut ring = FrameRingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), Some(4));
        assert_eq!(ring.pop(), None);
        assert_eq!(ring.stats(), (5, 3, 2));
    }

    #[test]
    fn push_returns_evicted_frame() {
        let mut ring = FrameRingBuffer::new(1);
        assert_eq!(ring.push("a"), None);
        assert_eq!(ring.push("b"), Some("a"));
        assert_eq!(ring.front(), Some(&"b"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let ring: FrameRingBuffer<u8> = FrameRingBuffer::new(0);
        assert_eq!(ring.capacity(), 1);
    }
}
