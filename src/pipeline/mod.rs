// src/pipeline/mod.rs

pub mod control_loop;
pub mod event_bus;
pub mod metrics;
pub mod status;

pub use control_loop::{ControlHandle, ControlLoop, LoopOutcome};
pub use event_bus::{ControlEvent, EventBus};
pub use metrics::{ControlMetrics, MetricsSummary};
pub use status::{StatusReport, TrafficCore};
