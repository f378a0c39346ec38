use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::{PixelFormat, SensorModel};

/// Detected V4L2 capture node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub driver: String,
    pub bus_info: String,
    pub formats: Vec<PixelFormat>,
}

impl FoundDevice {
    pub fn supports(&self, format: PixelFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn is_depth_node(&self) -> bool {
        self.formats.iter().any(|f| f.is_depth())
    }

    pub fn color_format(&self) -> Option<PixelFormat> {
        [PixelFormat::Yuyv4, PixelFormat::Rgb24, PixelFormat::Bgr24, PixelFormat::Mjpeg]
            .into_iter()
            .find(|f| self.supports(*f))
    }

    pub fn depth_format(&self) -> Option<PixelFormat> {
        [PixelFormat::Z16, PixelFormat::Y16]
            .into_iter()
            .find(|f| self.supports(*f))
    }

    /// `video3` from `/dev/video3`
    pub fn node_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// The colour and depth nodes one physical camera exposes
#[derive(Debug, Clone, PartialEq)]
pub struct SensorNodes {
    pub model: SensorModel,
    pub bus_info: String,
    pub serial: String,
    pub color: Option<FoundDevice>,
    pub depth: Option<FoundDevice>,
}

impl SensorNodes {
    pub fn is_complete(&self) -> bool {
        self.color.is_some() && self.depth.is_some()
    }
}

/// Group capture nodes belonging to `model` by USB bus position
pub fn find_sensors(model: SensorModel, devices: &[FoundDevice]) -> Vec<SensorNodes> {
    let mut sensors: Vec<SensorNodes> = Vec::new();

    for dev in devices.iter().filter(|d| model.matches_card(&d.card)) {
        let idx = match sensors.iter().position(|s| s.bus_info == dev.bus_info) {
            Some(idx) => idx,
            None => {
                sensors.push(SensorNodes {
                    model,
                    bus_info: dev.bus_info.clone(),
                    serial: read_usb_serial(dev.node_name()).unwrap_or_else(|| dev.bus_info.clone()),
                    color: None,
                    depth: None,
                });
                sensors.len() - 1
            }
        };

        let entry = &mut sensors[idx];
        if dev.is_depth_node() {
            entry.depth.get_or_insert_with(|| dev.clone());
        } else if dev.color_format().is_some() {
            entry.color.get_or_insert_with(|| dev.clone());
        }
    }

    sensors
}

/// USB serial string from sysfs, when the node sits on a USB device
pub fn read_usb_serial(node: &str) -> Option<String> {
    let path = format!("/sys/class/video4linux/{node}/device/../serial");
    let serial = std::fs::read_to_string(path).ok()?;
    let serial = serial.trim();
    (!serial.is_empty()).then(|| serial.to_string())
}

/// Scan `/dev/video*` for capture nodes
#[cfg(feature = "v4l2")]
pub fn enumerate_devices() -> Vec<FoundDevice> {
    use std::path::Path;
    use v4l::{capability::Flags, video::Capture, Device};

    debug!("Scanning V4L2 capture devices...");

    let mut found = Vec::new();
    for i in 0..64 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        let formats = dev
            .enum_formats()
            .map(|formats| {
                formats
                    .iter()
                    .filter_map(|fmt| match &fmt.fourcc.repr {
                        b"MJPG" => Some(PixelFormat::Mjpeg),
                        b"YUYV" => Some(PixelFormat::Yuyv4),
                        b"RGB3" => Some(PixelFormat::Rgb24),
                        b"BGR3" => Some(PixelFormat::Bgr24),
                        b"Z16 " => Some(PixelFormat::Z16),
                        b"Y16 " => Some(PixelFormat::Y16),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!("Found {} - {} ({:?})", path, caps.card, formats);
        found.push(FoundDevice {
            path,
            card: caps.card,
            driver: caps.driver,
            bus_info: caps.bus,
            formats,
        });
    }

    found
}

#[cfg(not(feature = "v4l2"))]
pub fn enumerate_devices() -> Vec<FoundDevice> {
    debug!("V4L2 support not compiled in, no devices to scan");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(path: &str, card: &str, bus: &str, formats: Vec<PixelFormat>) -> FoundDevice {
        FoundDevice {
            path: path.into(),
            card: card.into(),
            driver: "uvcvideo".into(),
            bus_info: bus.into(),
            formats,
        }
    }

    #[test]
    fn groups_colour_and_depth_nodes_by_bus() {
        let card = "Intel(R) RealSense(TM) Depth Ca 435";
        let devices = vec![
            node("/dev/video0", "Integrated Camera", "usb-0000:00:14.0-5", vec![PixelFormat::Mjpeg]),
            node("/dev/video2", card, "usb-0000:00:14.0-1", vec![PixelFormat::Z16]),
            node("/dev/video4", card, "usb-0000:00:14.0-1", vec![PixelFormat::Yuyv4]),
            node("/dev/video8", card, "usb-0000:00:14.0-2", vec![PixelFormat::Z16]),
        ];

        let sensors = find_sensors(SensorModel::D435, &devices);
        assert_eq!(sensors.len(), 2);
        assert!(sensors[0].is_complete());
        assert_eq!(sensors[0].depth.as_ref().unwrap().path, "/dev/video2");
        assert_eq!(sensors[0].color.as_ref().unwrap().path, "/dev/video4");
        assert!(!sensors[1].is_complete());

        assert!(find_sensors(SensorModel::FemtoMega, &devices).is_empty());
    }

    #[test]
    fn colour_format_preference() {
        let dev = node("/dev/video1", "x", "y", vec![PixelFormat::Mjpeg, PixelFormat::Yuyv4]);
        assert_eq!(dev.color_format(), Some(PixelFormat::Yuyv4));
        assert_eq!(dev.depth_format(), None);
        assert_eq!(dev.node_name(), "video1");
    }
}
