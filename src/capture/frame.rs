use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pixel formats we accept from a sensor link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    /// 16-bit little-endian depth (RealSense `Z16`)
    Z16,
    /// 16-bit little-endian grey/depth (Orbbec `Y16`)
    Y16,
}

impl PixelFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, PixelFormat::Z16 | PixelFormat::Y16)
    }
}

/// Channel order of the RGB payload handed to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorOrder {
    #[default]
    Bgr,
    Rgb,
}

/// Pinhole intrinsics plus Brown-Conrady distortion
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub distortion: Vec<f32>,
}

impl Intrinsics {
    /// Ideal pinhole model from a field of view in degrees
    pub fn from_fov(width: u32, height: u32, hfov_deg: f32, vfov_deg: f32) -> Self {
        let fx = width as f32 / 2.0 / (hfov_deg.to_radians() / 2.0).tan();
        let fy = height as f32 / 2.0 / (vfov_deg.to_radians() / 2.0).tan();
        Self {
            fx,
            fy,
            cx: width as f32 / 2.0,
            cy: height as f32 / 2.0,
            distortion: vec![0.0; 5],
        }
    }
}

/// Colour frame owned by the consumer once handed out
#[derive(Debug, Clone)]
pub struct RgbFrame {
    /// Packed 8-bit pixels in `order`
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub bytes_per_pixel: u32,
    pub order: ColorOrder,

    /// Host monotonic capture time; synchronisation runs on this clock
    pub timestamp: Instant,
    /// Sensor clock, when the link provides one
    pub device_timestamp: Option<Duration>,
    pub frame_number: u64,

    pub brightness: f32,
    pub contrast: f32,
    pub is_valid: bool,

    pub device_id: String,
    pub checksum: u32,
}

impl RgbFrame {
    pub fn expected_len(&self) -> usize {
        (self.width * self.height * self.bytes_per_pixel) as usize
    }

    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.data)
    }

    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    /// Fills in brightness (mean luma) and contrast (luma std deviation)
    pub fn update_quality(&mut self) {
        let (brightness, contrast) = luma_stats(&self.data, self.order);
        self.brightness = brightness;
        self.contrast = contrast;
    }
}

/// Depth frame in sensor units (`depth_scale` millimetres per unit)
#[derive(Debug, Clone)]
pub struct DepthFrame {
    pub data: Vec<u16>,
    pub width: u32,
    pub height: u32,
    pub depth_scale: f32,

    pub timestamp: Instant,
    pub device_timestamp: Option<Duration>,
    pub frame_number: u64,

    pub min_depth: f32,
    pub max_depth: f32,
    pub average_depth: f32,
    pub valid_pixels: u32,

    pub intrinsics: Intrinsics,
    pub is_valid: bool,
    pub device_id: String,
    pub checksum: u32,
}

impl DepthFrame {
    pub fn pixel_count(&self) -> usize {
        (self.width * self.height) as usize
    }

    pub fn compute_checksum(&self) -> u32 {
        depth_checksum(&self.data)
    }

    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    /// Share of pixels carrying a depth reading
    pub fn fill_ratio(&self) -> f32 {
        match self.pixel_count() {
            0 => 0.0,
            n => self.valid_pixels as f32 / n as f32,
        }
    }

    /// Recomputes min/max/average (in millimetres) over non-zero pixels
    pub fn update_statistics(&mut self) {
        let mut min = u16::MAX;
        let mut max = 0u16;
        let mut sum = 0u64;
        let mut valid = 0u32;
        for &d in &self.data {
            if d == 0 {
                continue;
            }
            min = min.min(d);
            max = max.max(d);
            sum += d as u64;
            valid += 1;
        }

        self.valid_pixels = valid;
        if valid == 0 {
            self.min_depth = 0.0;
            self.max_depth = 0.0;
            self.average_depth = 0.0;
        } else {
            self.min_depth = min as f32 * self.depth_scale;
            self.max_depth = max as f32 * self.depth_scale;
            self.average_depth = (sum as f64 / valid as f64) as f32 * self.depth_scale;
        }
    }
}

/// CRC32 over the little-endian byte image of a depth buffer
pub fn depth_checksum(data: &[u16]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    let mut chunk = [0u8; 512];
    for block in data.chunks(chunk.len() / 2) {
        for (i, d) in block.iter().enumerate() {
            chunk[i * 2..i * 2 + 2].copy_from_slice(&d.to_le_bytes());
        }
        hasher.update(&chunk[..block.len() * 2]);
    }
    hasher.finalize()
}

fn luma_stats(data: &[u8], order: ColorOrder) -> (f32, f32) {
    let pixels = data.len() / 3;
    if pixels == 0 {
        return (0.0, 0.0);
    }

    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    for px in data.chunks_exact(3) {
        let (r, g, b) = match order {
            ColorOrder::Rgb => (px[0], px[1], px[2]),
            ColorOrder::Bgr => (px[2], px[1], px[0]),
        };
        // BT.601 luma
        let y = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
        sum += y;
        sum_sq += y * y;
    }

    let mean = sum / pixels as f64;
    let variance = (sum_sq / pixels as f64 - mean * mean).max(0.0);
    (mean as f32, variance.sqrt() as f32)
}

#[cfg(test)]
pub(crate) mod test_frames {
    use super::*;

    pub fn rgb(frame_number: u64, timestamp: Instant) -> RgbFrame {
        let mut frame = RgbFrame {
            data: Bytes::from(vec![128u8; 4 * 4 * 3]),
            width: 4,
            height: 4,
            channels: 3,
            bytes_per_pixel: 3,
            order: ColorOrder::Bgr,
            timestamp,
            device_timestamp: None,
            frame_number,
            brightness: 0.0,
            contrast: 0.0,
            is_valid: true,
            device_id: "test".into(),
            checksum: 0,
        };
        frame.seal();
        frame
    }

    pub fn depth(frame_number: u64, timestamp: Instant) -> DepthFrame {
        let mut frame = DepthFrame {
            data: vec![1000u16; 16],
            width: 4,
            height: 4,
            depth_scale: 1.0,
            timestamp,
            device_timestamp: None,
            frame_number,
            min_depth: 0.0,
            max_depth: 0.0,
            average_depth: 0.0,
            valid_pixels: 0,
            intrinsics: Intrinsics::default(),
            is_valid: true,
            device_id: "test".into(),
            checksum: 0,
        };
        frame.update_statistics();
        frame.seal();
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::test_frames;
    use super::*;

    #[test]
    fn checksum_detects_payload_change() {
        let mut frame = test_frames::depth(1, Instant::now());
        assert!(frame.verify_checksum());
        frame.data[3] = 999;
        assert!(!frame.verify_checksum());
    }

    #[test]
    fn depth_checksum_spans_chunk_boundaries() {
        let data: Vec<u16> = (0..1000).collect();
        let mut bytes = Vec::with_capacity(2000);
        for d in &data {
            bytes.extend_from_slice(&d.to_le_bytes());
        }
        assert_eq!(depth_checksum(&data), crc32fast::hash(&bytes));
    }

    #[test]
    fn statistics_ignore_holes() {
        let mut frame = test_frames::depth(1, Instant::now());
        frame.data = vec![0, 500, 1500, 0];
        frame.width = 2;
        frame.height = 2;
        frame.depth_scale = 1.0;
        frame.update_statistics();

        assert_eq!(frame.valid_pixels, 2);
        assert_eq!(frame.min_depth, 500.0);
        assert_eq!(frame.max_depth, 1500.0);
        assert_eq!(frame.average_depth, 1000.0);
        assert!((frame.fill_ratio() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn quality_of_flat_grey_frame() {
        let mut frame = test_frames::rgb(1, Instant::now());
        frame.update_quality();
        assert!((frame.brightness - 128.0).abs() < 0.5);
        assert!(frame.contrast < 0.01);
    }

    #[test]
    fn intrinsics_from_fov_centre_principal_point() {
        let k = Intrinsics::from_fov(640, 480, 90.0, 90.0);
        assert!((k.fx - 320.0).abs() < 0.01);
        assert!((k.fy - 240.0).abs() < 0.01);
        assert_eq!(k.cx, 320.0);
        assert_eq!(k.cy, 240.0);
    }
}
