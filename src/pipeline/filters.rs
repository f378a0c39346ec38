//! Depth post-processing
//!
//! Filter strength runs 0 (off) to 5. Each level adds one stage on top of
//! the previous one:
//!
//! 1. range threshold
//! 2. speckle removal
//! 3. edge-preserving smoothing
//! 4. temporal smoothing (stateful across frames)
//! 5. hole filling

use tracing::trace;

use crate::capture::DepthFrame;

pub const MAX_FILTER_LEVEL: u8 = 5;

/// Neighbouring readings further apart than this belong to different surfaces
const EDGE_DELTA_MM: f32 = 20.0;
const SPECKLE_DELTA_MM: f32 = 50.0;
const TEMPORAL_ALPHA: f32 = 0.4;

pub struct DepthFilterChain {
    level: u8,
    min_mm: f32,
    max_mm: f32,
    history: Vec<f32>,
    history_dims: (u32, u32),
    scratch: Vec<u16>,
}

impl DepthFilterChain {
    pub fn new(level: u8, min_mm: f32, max_mm: f32) -> Self {
        Self {
            level: level.min(MAX_FILTER_LEVEL),
            min_mm,
            max_mm,
            history: Vec::new(),
            history_dims: (0, 0),
            scratch: Vec::new(),
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn set_level(&mut self, level: u8) {
        self.level = level.min(MAX_FILTER_LEVEL);
        self.reset();
    }

    /// Forget temporal state, e.g. after a restart
    pub fn reset(&mut self) {
        self.history.clear();
        self.history_dims = (0, 0);
    }

    /// Filter `frame` in place. Statistics and checksum are the caller's job.
    pub fn apply(&mut self, frame: &mut DepthFrame) {
        if self.level == 0 || frame.data.is_empty() || frame.data.len() != frame.pixel_count() {
            return;
        }

        let scale = if frame.depth_scale > 0.0 { frame.depth_scale } else { 1.0 };
        let (w, h) = (frame.width as usize, frame.height as usize);

        threshold(&mut frame.data, self.min_mm / scale, self.max_mm / scale);
        if self.level >= 2 {
            self.remove_speckles(&mut frame.data, w, h, SPECKLE_DELTA_MM / scale);
        }
        if self.level >= 3 {
            self.smooth_edges(&mut frame.data, w, h, EDGE_DELTA_MM / scale);
        }
        if self.level >= 4 {
            self.temporal(&mut frame.data, (frame.width, frame.height), EDGE_DELTA_MM / scale);
        }
        if self.level >= 5 {
            fill_holes(&mut frame.data, w);
        }

        trace!(frame = frame.frame_number, level = self.level, "depth filtered");
    }

    /// Zero isolated readings with fewer than two agreeing 4-neighbours
    fn remove_speckles(&mut self, data: &mut [u16], w: usize, h: usize, delta: f32) {
        self.scratch.clear();
        self.scratch.extend_from_slice(data);
        let src = &self.scratch;

        for y in 0..h {
            for x in 0..w {
                let d = src[y * w + x];
                if d == 0 {
                    continue;
                }
                let agreeing = neighbours4(x, y, w, h)
                    .filter(|&(nx, ny)| {
                        let n = src[ny * w + nx];
                        n != 0 && (n as f32 - d as f32).abs() <= delta
                    })
                    .count();
                if agreeing < 2 {
                    data[y * w + x] = 0;
                }
            }
        }
    }

    /// 3x3 mean over neighbours on the same surface as the centre pixel
    fn smooth_edges(&mut self, data: &mut [u16], w: usize, h: usize, delta: f32) {
        self.scratch.clear();
        self.scratch.extend_from_slice(data);
        let src = &self.scratch;

        for y in 0..h {
            for x in 0..w {
                let center = src[y * w + x];
                if center == 0 {
                    continue;
                }
                let mut sum = 0f32;
                let mut n = 0f32;
                for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                        let d = src[ny * w + nx];
                        if d != 0 && (d as f32 - center as f32).abs() <= delta {
                            sum += d as f32;
                            n += 1.0;
                        }
                    }
                }
                data[y * w + x] = (sum / n).round() as u16;
            }
        }
    }

    /// Exponential moving average per pixel, reset where the surface jumped
    fn temporal(&mut self, data: &mut [u16], dims: (u32, u32), delta: f32) {
        if self.history_dims != dims || self.history.len() != data.len() {
            self.history = data.iter().map(|&d| d as f32).collect();
            self.history_dims = dims;
            return;
        }

        for (d, prev) in data.iter_mut().zip(self.history.iter_mut()) {
            let cur = *d as f32;
            if *d == 0 || *prev == 0.0 || (cur - *prev).abs() > delta {
                *prev = cur;
                continue;
            }
            *prev = TEMPORAL_ALPHA * cur + (1.0 - TEMPORAL_ALPHA) * *prev;
            *d = prev.round() as u16;
        }
    }
}

fn threshold(data: &mut [u16], min: f32, max: f32) {
    for d in data.iter_mut() {
        let v = *d as f32;
        if v < min || v > max {
            *d = 0;
        }
    }
}

/// Fill each hole from the nearest valid pixel to its left on the same row
fn fill_holes(data: &mut [u16], w: usize) {
    for row in data.chunks_exact_mut(w) {
        let mut last = 0u16;
        for d in row.iter_mut() {
            if *d == 0 {
                *d = last;
            } else {
                last = *d;
            }
        }
    }
}

fn neighbours4(x: usize, y: usize, w: usize, h: usize) -> impl Iterator<Item = (usize, usize)> {
    let left = (x > 0).then(|| (x - 1, y));
    let right = (x + 1 < w).then(|| (x + 1, y));
    let up = (y > 0).then(|| (x, y - 1));
    let down = (y + 1 < h).then(|| (x, y + 1));
    [left, right, up, down].into_iter().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::test_frames;
    use std::time::Instant;

    fn frame_with(data: Vec<u16>) -> DepthFrame {
        let mut frame = test_frames::depth(1, Instant::now());
        frame.data = data;
        frame
    }

    #[test]
    fn level_zero_is_passthrough() {
        let mut chain = DepthFilterChain::new(0, 300.0, 5000.0);
        let mut frame = frame_with(vec![100; 16]);
        chain.apply(&mut frame);
        assert!(frame.data.iter().all(|&d| d == 100));
    }

    #[test]
    fn threshold_clears_out_of_range() {
        let mut chain = DepthFilterChain::new(1, 300.0, 5000.0);
        let mut data = vec![1000; 16];
        data[0] = 100;
        data[1] = 9000;
        let mut frame = frame_with(data);
        chain.apply(&mut frame);
        assert_eq!(&frame.data[..3], &[0, 0, 1000]);
    }

    #[test]
    fn isolated_speckle_is_removed() {
        let mut chain = DepthFilterChain::new(2, 300.0, 5000.0);
        let mut data = vec![0; 16];
        data[5] = 1500;
        data[10] = 1000;
        data[11] = 1000;
        data[14] = 1000;
        data[15] = 1000;
        let mut frame = frame_with(data);
        chain.apply(&mut frame);
        assert_eq!(frame.data[5], 0);
        assert_eq!(frame.data[15], 1000);
    }

    #[test]
    fn smoothing_keeps_edges() {
        let mut chain = DepthFilterChain::new(3, 300.0, 5000.0);
        // Left half near, right half far
        let data = (0..16).map(|i| if i % 4 < 2 { 1000 } else { 3000 }).collect();
        let mut frame = frame_with(data);
        chain.apply(&mut frame);
        assert_eq!(frame.data[0], 1000);
        assert_eq!(frame.data[3], 3000);
    }

    #[test]
    fn temporal_pulls_toward_history() {
        let mut chain = DepthFilterChain::new(4, 300.0, 5000.0);
        let mut first = frame_with(vec![1000; 16]);
        chain.apply(&mut first);

        let mut second = frame_with(vec![1010; 16]);
        chain.apply(&mut second);
        assert_eq!(second.data[5], 1004);
    }

    #[test]
    fn holes_fill_from_left() {
        let mut chain = DepthFilterChain::new(5, 300.0, 5000.0);
        let mut data = vec![1000; 16];
        data[6] = 0;
        let mut frame = frame_with(data);
        chain.apply(&mut frame);
        assert!(frame.data.iter().all(|&d| d != 0));
    }
}
