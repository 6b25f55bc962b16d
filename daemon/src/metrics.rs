/// Prometheus metrics for the daemon.
use crate::errors::{DaemonError, DaemonResult};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct MetricsCollector {
    registry: Registry,
    pub tasks_created: IntCounter,
    pub tasks_completed: IntCounter,
    pub tasks_failed: IntCounter,
    pub tasks_cancelled: IntCounter,
    pub workers_running: IntGauge,
    pub http_requests: IntCounter,
}

impl MetricsCollector {
    pub fn new() -> DaemonResult<Self> {
        let registry = Registry::new();

        let tasks_created =
            IntCounter::new("triage_tasks_created_total", "Tasks admitted to the queue")
                .map_err(|e| DaemonError::ServerError(e.to_string()))?;
        let tasks_completed =
            IntCounter::new("triage_tasks_completed_total", "Tasks finished in done")
                .map_err(|e| DaemonError::ServerError(e.to_string()))?;
        let tasks_failed = IntCounter::new("triage_tasks_failed_total", "Tasks finished in failed")
            .map_err(|e| DaemonError::ServerError(e.to_string()))?;
        let tasks_cancelled =
            IntCounter::new("triage_tasks_cancelled_total", "Tasks finished in cancelled")
                .map_err(|e| DaemonError::ServerError(e.to_string()))?;
        let workers_running = IntGauge::new("triage_workers_running", "Pipelines currently running")
            .map_err(|e| DaemonError::ServerError(e.to_string()))?;
        let http_requests = IntCounter::new("triage_http_requests_total", "HTTP requests served")
            .map_err(|e| DaemonError::ServerError(e.to_string()))?;

        for collector in [
            Box::new(tasks_created.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tasks_completed.clone()),
            Box::new(tasks_failed.clone()),
            Box::new(tasks_cancelled.clone()),
            Box::new(workers_running.clone()),
            Box::new(http_requests.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| DaemonError::ServerError(e.to_string()))?;
        }

        Ok(Self {
            registry,
            tasks_created,
            tasks_completed,
            tasks_failed,
            tasks_cancelled,
            workers_running,
            http_requests,
        })
    }

    /// Render the registry in Prometheus text format.
    pub fn gather(&self) -> DaemonResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| DaemonError::ServerError(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| DaemonError::ServerError(e.to_string()))
    }
}
