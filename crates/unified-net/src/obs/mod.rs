//! Lightweight in-process metrics (dependency-free).
//!
//! Counters and gauges are atomics keyed by label sets and rendered in
//! Prometheus text format on demand. Every adapter owns one
//! `FabricMetrics`, shared with its background tasks.

pub mod metrics;

pub use metrics::FabricMetrics;
