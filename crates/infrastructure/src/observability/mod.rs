//! Observability module
//!
//! - Metrics collection ([`MetricsCollector`])
//! - Prometheus exporter installation

pub mod metrics_collector;

pub use metrics_collector::{init_metrics, MetricsCollector};
