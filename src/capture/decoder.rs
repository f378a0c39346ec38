use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use super::frame::{ColorOrder, PixelFormat};
use crate::error::{CameraError, Result};

/// Decode a colour payload into packed 8-bit pixels in `order`
pub fn decode_color(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
    order: ColorOrder,
) -> Result<Vec<u8>> {
    let expected = (width * height * 3) as usize;
    let mut pixels = match format {
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let pixels = decoder
                .decode()
                .map_err(|e| CameraError::CaptureFailed(format!("MJPEG decode: {e}")))?;
            match decoder.info().map(|info| info.pixel_format) {
                Some(JpegPixelFormat::RGB24) => pixels,
                other => {
                    return Err(CameraError::CaptureFailed(format!(
                        "unexpected JPEG pixel format {other:?}"
                    )))
                }
            }
        }
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => data.to_vec(),
        PixelFormat::Yuyv4 => yuyv_to_rgb(data, width, height),
        PixelFormat::Z16 | PixelFormat::Y16 => {
            return Err(CameraError::InvalidConfiguration(format!(
                "{format:?} is a depth format"
            )))
        }
    };

    if pixels.len() != expected {
        return Err(CameraError::CaptureFailed(format!(
            "colour payload is {} bytes, expected {expected}",
            pixels.len()
        )));
    }

    let source_order = match format {
        PixelFormat::Bgr24 => ColorOrder::Bgr,
        _ => ColorOrder::Rgb,
    };
    if source_order != order {
        swap_red_blue(&mut pixels);
    }
    Ok(pixels)
}

/// Decode a 16-bit little-endian depth payload
pub fn decode_depth(data: &[u8], format: PixelFormat, width: u32, height: u32) -> Result<Vec<u16>> {
    if !format.is_depth() {
        return Err(CameraError::InvalidConfiguration(format!(
            "{format:?} is not a depth format"
        )));
    }

    let expected = (width * height) as usize * 2;
    if data.len() < expected {
        return Err(CameraError::CaptureFailed(format!(
            "depth payload is {} bytes, expected {expected}",
            data.len()
        )));
    }

    Ok(data[..expected]
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect())
}

/// YUYV (YUV 4:2:2, Y0 U Y1 V) to packed RGB, BT.601
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixel_count = (width * height) as usize;
    let mut rgb = Vec::with_capacity(pixel_count * 3);

    for chunk in data.chunks_exact(4) {
        let y0 = chunk[0] as f32;
        let u = chunk[1] as f32 - 128.0;
        let y1 = chunk[2] as f32;
        let v = chunk[3] as f32 - 128.0;

        for y in [y0, y1] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }

        if rgb.len() >= pixel_count * 3 {
            break;
        }
    }

    rgb
}

fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}
