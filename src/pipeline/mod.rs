pub mod engine;
pub mod filters;
pub mod metrics;
pub mod ringbuf;
pub mod store;
pub mod watchdog;

pub use engine::{CapturePipeline, PipelineSpec, CORRUPTION_ESCALATION};
pub use filters::{DepthFilterChain, MAX_FILTER_LEVEL};
pub use metrics::{FrameCounters, MetricsTracker, METRICS_CADENCE};
pub use ringbuf::FrameRingBuffer;
pub use store::{FrameStore, StoreStats};
pub use watchdog::{ComponentHealth, Watchdog};
