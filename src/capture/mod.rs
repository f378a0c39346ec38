pub mod capabilities;
pub mod decoder;
pub mod frame;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use capabilities::{CameraCapabilities, SensorModel, RECALIBRATION_INTERVAL_DAYS};
pub use frame::{ColorOrder, DepthFrame, Intrinsics, PixelFormat, RgbFrame};
pub use source::{DepthPayload, FrameSource, OfflineSource, RawColor, RawDepth, RawFrameset};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;
