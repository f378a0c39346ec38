pub mod backends;
pub mod camera;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod pipeline;
pub mod utils;

use std::sync::Arc;

pub use backends::{D435Camera, FemtoMegaCamera, PowerMode, SimulationCamera, SimulationOptions, SimulationProfile};
pub use camera::{Camera, CameraStatus, ErrorReport, PerformanceMetrics, ThermalStatus};
pub use capture::{CameraCapabilities, DepthFrame, RgbFrame};
pub use config::{CameraConfig, FactoryConfig, Settings};
pub use error::{CameraError, Result};
pub use events::{Event, EventSink, RecordingSink, Severity, TracingSink};
pub use factory::{FactoryStatus, HardwareDetectionResult, HardwareFactory};

/// Collaborators handed to the factory and every camera.
///
/// Constructed once at startup and cloned; there is no global state.
#[derive(Clone)]
pub struct Services {
    pub events: Arc<dyn EventSink>,
}

impl Services {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }

    pub fn record(&self, event: Event) {
        self.events.record(&event);
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}
