//! Prometheus counters for the status pipeline.
//!
//! The recorder itself is installed by the application
//! (`metrics_exporter_prometheus::PrometheusBuilder`); these helpers only
//! record. Without an installed recorder they are no-ops.

use crate::events::WorkerEvent;
use crate::models::UpdateType;
use metrics::counter;

fn event_kind(event: &WorkerEvent) -> &'static str {
    match event {
        WorkerEvent::Registered(_) => "worker_registered",
        WorkerEvent::StatusChanged(_) => "worker_status_changed",
        WorkerEvent::ConnectorStatusChanged(_) => "connector_status_changed",
        WorkerEvent::JobStarted { .. } => "job_started",
        WorkerEvent::JobCompleted { .. } => "job_completed",
        WorkerEvent::JobFailed { .. } => "job_failed",
    }
}

fn update_type_label(update_type: UpdateType) -> &'static str {
    match update_type {
        UpdateType::Initial => "initial",
        UpdateType::Periodic => "periodic",
        UpdateType::EventDriven => "event_driven",
        UpdateType::Shutdown => "shutdown",
        UpdateType::MachineReady => "machine_ready",
    }
}

pub fn record_event(event: &WorkerEvent) {
    counter!("machine_status_events_total", "kind" => event_kind(event)).increment(1);
}

pub fn record_event_error() {
    counter!("machine_status_event_errors_total").increment(1);
}

pub fn record_publish(update_type: UpdateType) {
    counter!("machine_status_publishes_total", "update_type" => update_type_label(update_type))
        .increment(1);
}

pub fn record_publish_error() {
    counter!("machine_status_publish_errors_total").increment(1);
}

pub fn record_poll_cycle() {
    counter!("machine_status_poll_cycles_total").increment(1);
}
