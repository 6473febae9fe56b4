//! meshward-metrics: observability for the probe scheduler.
//!
//! # Architecture
//!
//! ```text
//! ProbeMetrics (atomics, shared with the scheduler)
//!   ├── probe_submitted() / probe_skipped() / probe_completed()
//!   ├── enter() → InFlightGuard (released on drop)
//!   └── snapshot() → ProbeMetricsSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{InFlightGuard, ProbeMetrics, ProbeMetricsSnapshot};
pub use prometheus::render_prometheus;
