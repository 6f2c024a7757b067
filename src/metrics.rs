//! Prometheus-compatible metrics for tupleflow.
//!
//! Records tuple throughput, ack outcomes, queue depth and backpressure
//! transitions through the `metrics` facade. Use [`install_prometheus_recorder`]
//! at startup to expose them for scraping; without a recorder every call is a
//! no-op.
//!
//! - **Throughput:** [`record_emitted`] / [`record_executed`] feed
//!   `tupleflow_emitted_total` and `tupleflow_executed_total`.
//! - **Reliability:** [`record_acked`] / [`record_failed`] feed
//!   `tupleflow_acked_total` and `tupleflow_failed_total` (labelled by reason).
//! - **Backpressure:** [`record_queue_depth`] sets `tupleflow_queue_depth`;
//!   [`record_backpressure_transition`] counts pause and resume events.

use crate::backpressure::LinkId;
use crate::error::Error;
use crate::tuple::TaskId;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Installs the Prometheus recorder as the global metrics recorder.
///
/// Spawns an HTTP listener on the exporter's default address. Call once at
/// startup, from within a tokio runtime.
pub fn install_prometheus_recorder() -> Result<(), Error> {
  PrometheusBuilder::new().install()?;
  Ok(())
}

/// Installs the Prometheus recorder serving on the given address.
pub fn install_prometheus_recorder_on(addr: std::net::SocketAddr) -> Result<(), Error> {
  PrometheusBuilder::new().with_http_listener(addr).install()?;
  Ok(())
}

/// Records tuples handed to the dispatcher by a task.
pub fn record_emitted(component: &str, stream: &str, count: u64) {
  counter!(
    "tupleflow_emitted_total",
    "component" => component.to_string(),
    "stream" => stream.to_string()
  )
  .increment(count);
}

/// Records one input tuple processed by a bolt.
pub fn record_executed(component: &str, task: TaskId) {
  counter!(
    "tupleflow_executed_total",
    "component" => component.to_string(),
    "task" => task.0.to_string()
  )
  .increment(1);
}

/// Records a root whose ack tree completed.
pub fn record_acked(task: TaskId) {
  counter!("tupleflow_acked_total", "task" => task.0.to_string()).increment(1);
}

/// Records a root whose ack tree failed.
pub fn record_failed(task: TaskId, reason: &str) {
  counter!(
    "tupleflow_failed_total",
    "task" => task.0.to_string(),
    "reason" => reason.to_string()
  )
  .increment(1);
}

/// Records the current depth of a link.
pub fn record_queue_depth(link: LinkId, depth: usize) {
  gauge!("tupleflow_queue_depth", "link" => link.to_string()).set(depth as f64);
}

/// Records a pause or resume of a link.
pub fn record_backpressure_transition(link: LinkId, paused: bool) {
  counter!(
    "tupleflow_backpressure_transitions_total",
    "link" => link.to_string(),
    "state" => if paused { "paused" } else { "resumed" }
  )
  .increment(1);
}

/// Records a task failure reported to supervision.
pub fn record_task_failure(component: &str, task: TaskId) {
  counter!(
    "tupleflow_task_failures_total",
    "component" => component.to_string(),
    "task" => task.0.to_string()
  )
  .increment(1);
}

/// Records a remote batch that could not be delivered.
pub fn record_transport_failure(worker: u32) {
  counter!("tupleflow_transport_failures_total", "worker" => worker.to_string()).increment(1);
}
