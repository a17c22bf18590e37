//! Metrics collector for the task pool
//!
//! Unlabelled series are registered once as handles; series labelled by
//! worker or error type are emitted through the macros at call time.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use taskpool_core::{SchedulerError, SchedulerResult};

/// Metrics collector for the task pool
#[derive(Clone)]
pub struct MetricsCollector {
    // Task metrics
    tasks_submitted_total: Counter,
    tasks_assigned_total: Counter,
    task_retries_total: Counter,
    task_execution_duration: Histogram,

    // Queue metrics
    queue_pending: Gauge,
    queue_in_flight: Gauge,
    queue_stalled: Gauge,

    // Dispatcher metrics
    scheduling_duration: Histogram,
    pool_size: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_submitted_total: counter!("taskpool_tasks_submitted_total"),
            tasks_assigned_total: counter!("taskpool_tasks_assigned_total"),
            task_retries_total: counter!("taskpool_task_retries_total"),
            task_execution_duration: histogram!("taskpool_task_execution_duration_seconds"),
            queue_pending: gauge!("taskpool_queue_pending"),
            queue_in_flight: gauge!("taskpool_queue_in_flight"),
            queue_stalled: gauge!("taskpool_queue_stalled"),
            scheduling_duration: histogram!("taskpool_scheduling_duration_seconds"),
            pool_size: gauge!("taskpool_local_workers"),
        }
    }

    // Task metrics

    pub fn record_task_submitted(&self) {
        self.tasks_submitted_total.increment(1);
    }

    pub fn record_task_assigned(&self) {
        self.tasks_assigned_total.increment(1);
    }

    /// Record a finished attempt with its terminal label (`succeeded`, `failed`, ...)
    pub fn record_task_finished(&self, status: &str, duration_seconds: f64) {
        counter!("taskpool_tasks_finished_total", "status" => status.to_string()).increment(1);
        self.task_execution_duration.record(duration_seconds);
    }

    pub fn record_task_retry(&self, error_type: &str) {
        self.task_retries_total.increment(1);
        counter!("taskpool_task_attempt_errors_total", "error_type" => error_type.to_string())
            .increment(1);
    }

    pub fn record_task_failure(&self, error_type: &str) {
        counter!("taskpool_task_failures_total", "error_type" => error_type.to_string())
            .increment(1);
    }

    // Queue metrics

    pub fn update_queue_depth(&self, pending: usize, in_flight: usize, stalled: usize) {
        self.queue_pending.set(pending as f64);
        self.queue_in_flight.set(in_flight as f64);
        self.queue_stalled.set(stalled as f64);
    }

    pub fn record_scheduling_duration(&self, duration_seconds: f64) {
        self.scheduling_duration.record(duration_seconds);
    }

    // Worker metrics

    pub fn update_workers_by_status(&self, status: &str, count: usize) {
        gauge!("taskpool_workers", "status" => status.to_string()).set(count as f64);
    }

    pub fn update_performance_factor(&self, worker_id: &str, factor: f64) {
        gauge!("taskpool_worker_performance_factor", "worker_id" => worker_id.to_string())
            .set(factor);
    }

    pub fn record_probe(&self, worker_id: &str, ok: bool, latency_ms: Option<f64>) {
        let outcome = if ok { "ok" } else { "failed" };
        counter!("taskpool_health_probes_total", "outcome" => outcome).increment(1);
        if let Some(latency) = latency_ms {
            histogram!("taskpool_worker_latency_ms", "worker_id" => worker_id.to_string())
                .record(latency);
        }
    }

    // Pool metrics

    pub fn record_scaling(&self, action: &str, pool_size: usize) {
        counter!("taskpool_scaling_actions_total", "action" => action.to_string()).increment(1);
        self.pool_size.set(pool_size as f64);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder and its HTTP listener
pub fn init_metrics(bind: &str) -> SchedulerResult<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| SchedulerError::Configuration(format!("无效的指标导出地址 {bind}: {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| SchedulerError::Configuration(format!("安装Prometheus导出器失败: {e}")))?;

    info!("Prometheus指标导出已启动: {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let collector = MetricsCollector::new();
        collector.record_task_submitted();
        collector.record_task_retry("timeout");
        collector.update_queue_depth(3, 1, 2);
        collector.record_probe("w-1", false, None);
    }

    #[test]
    fn test_invalid_bind_address() {
        assert!(matches!(
            init_metrics("not-an-address"),
            Err(SchedulerError::Configuration(_))
        ));
    }
}
