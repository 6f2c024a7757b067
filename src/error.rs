//! # Error Types
//!
//! Errors raised by the execution core, one enum per concern:
//!
//! - **TopologyError**: malformed declaration, raised while building the
//!   [`TopologyGraph`](crate::topology::TopologyGraph). Fatal: the topology
//!   never starts.
//! - **RoutingError**: an emission could not be resolved to destinations (for
//!   example a direct grouping naming a dead task). The tuple's roots fail.
//! - **TransportError**: a routed tuple could not be handed to its destination
//!   queue or remote worker after bounded retries. The tuple's roots fail.
//! - **TaskFailure**: user logic returned an error or panicked. The executor
//!   stops and reports upward; supervision decides about a restart.
//! - **ConfigError**: configuration could not be loaded or is inconsistent.
//!
//! [`Error`] wraps all of them for callers that do not care which layer failed.

use crate::tuple::{TaskId, WorkerId};
use thiserror::Error;

/// Malformed topology declaration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
  /// The declaration has no components.
  #[error("invalid topology: no components declared")]
  Empty,
  /// Two components share a name.
  #[error("invalid topology: duplicate component '{0}'")]
  DuplicateComponent(String),
  /// A component declared parallelism below one.
  #[error("invalid topology: component '{component}' has parallelism {parallelism}, must be >= 1")]
  InvalidParallelism {
    /// Component name.
    component: String,
    /// Declared parallelism.
    parallelism: u32,
  },
  /// An edge references a component that was never declared.
  #[error("invalid topology: '{destination}' subscribes to undeclared component '{referenced}'")]
  UnknownComponent {
    /// Referenced component.
    referenced: String,
    /// Subscribing component.
    destination: String,
  },
  /// An edge references a stream the source does not declare.
  #[error("invalid topology: component '{component}' does not declare stream '{stream}'")]
  UnknownStream {
    /// Source component.
    component: String,
    /// Referenced stream.
    stream: String,
  },
  /// A fields grouping names a field missing from the source stream's schema.
  #[error("invalid topology: stream '{component}:{stream}' has no field '{field}'")]
  UnknownField {
    /// Source component.
    component: String,
    /// Source stream.
    stream: String,
    /// Missing field.
    field: String,
  },
  /// A fields grouping was declared with no key fields.
  #[error("invalid topology: fields grouping from '{component}:{stream}' names no fields")]
  EmptyGroupingFields {
    /// Source component.
    component: String,
    /// Source stream.
    stream: String,
  },
  /// A spout was declared with inputs.
  #[error("invalid topology: spout '{0}' cannot subscribe to streams")]
  SpoutWithInputs(String),
  /// The component graph is not acyclic.
  #[error("invalid topology: cycle through components {0:?}")]
  Cycle(Vec<String>),
  /// The worker count cannot host the declared instances.
  #[error("invalid topology: {workers} workers for {instances} task instances")]
  InvalidWorkerCount {
    /// Declared workers.
    workers: u32,
    /// Total task instances.
    instances: u32,
  },
  /// The placement returned the wrong number of assignments.
  #[error("invalid topology: placement assigned {assigned} of {instances} instances")]
  InvalidPlacement {
    /// Assignments returned.
    assigned: usize,
    /// Instances expected.
    instances: usize,
  },
}

/// Failure to resolve an emission to destination tasks.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
  /// The emitting component does not declare the stream.
  #[error("stream '{stream}' is not declared by '{component}'")]
  UnknownStream {
    /// Emitting component.
    component: String,
    /// Stream emitted on.
    stream: String,
  },
  /// The number of values does not match the stream schema.
  #[error("stream '{stream}' expects {expected} values, got {actual}")]
  ArityMismatch {
    /// Stream emitted on.
    stream: String,
    /// Schema width.
    expected: usize,
    /// Values supplied.
    actual: usize,
  },
  /// A direct-grouped stream was emitted without naming a destination.
  #[error("stream '{stream}' is direct-grouped but no destination task was named")]
  MissingDirectTarget {
    /// Stream emitted on.
    stream: String,
  },
  /// The named direct destination is not live.
  #[error("direct destination {task} is not live")]
  DeadTarget {
    /// Named task.
    task: TaskId,
  },
  /// The named destination does not belong to the subscribing component.
  #[error("{task} is not an instance of subscriber '{component}'")]
  NotASubscriber {
    /// Named task.
    task: TaskId,
    /// Subscribing component.
    component: String,
  },
  /// The subscribing component has no live instance.
  #[error("component '{component}' has no live instances")]
  NoLiveInstances {
    /// Subscribing component.
    component: String,
  },
}

/// Failure to hand a routed tuple to its destination.
#[derive(Debug, Error)]
pub enum TransportError {
  /// The destination task is not part of the topology.
  #[error("unknown destination {0}")]
  UnknownTask(TaskId),
  /// The destination's inbound queue has been closed.
  #[error("inbound queue of {0} is closed")]
  ChannelClosed(TaskId),
  /// No transport is configured to reach a remote worker.
  #[error("no transport to reach {0}")]
  NoRoute(WorkerId),
  /// Network I/O failed. Considered transient.
  #[error("network error: {0}")]
  Io(#[from] std::io::Error),
  /// Connecting to a peer timed out. Considered transient.
  #[error("connection to {0} timed out")]
  Timeout(WorkerId),
  /// A frame could not be encoded or decoded.
  #[error("codec error: {0}")]
  Codec(String),
  /// A remote send failed after every retry.
  #[error("send to {worker} failed after {attempts} attempts: {reason}")]
  SendFailed {
    /// Remote worker.
    worker: WorkerId,
    /// Attempts made.
    attempts: u32,
    /// Last error observed.
    reason: String,
  },
}

impl TransportError {
  /// True for errors worth retrying.
  pub fn is_transient(&self) -> bool {
    matches!(self, TransportError::Io(_) | TransportError::Timeout(_))
  }
}

/// Terminal failure of a task executor.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TaskFailure {
  /// User logic returned an error.
  #[error("{task} ({component}) failed in {phase}: {message}")]
  Callback {
    /// Failed task.
    task: TaskId,
    /// Component name.
    component: String,
    /// Lifecycle phase that failed (`open`, `next_tuple`, `execute`, ...).
    phase: &'static str,
    /// Error description.
    message: String,
  },
  /// User logic panicked.
  #[error("{task} ({component}) panicked in {phase}: {message}")]
  Panicked {
    /// Failed task.
    task: TaskId,
    /// Component name.
    component: String,
    /// Lifecycle phase that panicked.
    phase: &'static str,
    /// Panic payload, when it was a string.
    message: String,
  },
}

impl TaskFailure {
  /// Task that failed.
  pub fn task(&self) -> TaskId {
    match self {
      TaskFailure::Callback { task, .. } | TaskFailure::Panicked { task, .. } => *task,
    }
  }

  /// Component of the failed task.
  pub fn component(&self) -> &str {
    match self {
      TaskFailure::Callback { component, .. } | TaskFailure::Panicked { component, .. } => {
        component
      }
    }
  }
}

/// Configuration could not be loaded or validated.
#[derive(Debug, Error)]
pub enum ConfigError {
  /// Reading the configuration file failed.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// The configuration document is malformed.
  #[error("parse error: {0}")]
  Parse(#[from] serde_json::Error),
  /// The configuration is internally inconsistent.
  #[error("invalid configuration: {0}")]
  Invalid(String),
}

/// Any error raised by the execution core.
#[derive(Debug, Error)]
pub enum Error {
  /// See [`TopologyError`].
  #[error(transparent)]
  Topology(#[from] TopologyError),
  /// See [`RoutingError`].
  #[error(transparent)]
  Routing(#[from] RoutingError),
  /// See [`TransportError`].
  #[error(transparent)]
  Transport(#[from] TransportError),
  /// See [`TaskFailure`].
  #[error(transparent)]
  Task(#[from] TaskFailure),
  /// See [`ConfigError`].
  #[error(transparent)]
  Config(#[from] ConfigError),
  /// The Prometheus exporter could not be installed.
  #[error("failed to install Prometheus recorder: {0}")]
  Metrics(#[from] metrics_exporter_prometheus::BuildError),
  /// No factory was registered for a component placed on this worker.
  #[error("no factory registered for component '{0}'")]
  MissingFactory(String),
  /// The task is not hosted by this worker.
  #[error("{task} is not hosted by {worker}")]
  NotHosted {
    /// Requested task.
    task: TaskId,
    /// This worker.
    worker: WorkerId,
  },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_topology_error_messages() {
    let e = TopologyError::UnknownField {
      component: "spout".into(),
      stream: "default".into(),
      field: "word".into(),
    };
    assert_eq!(
      e.to_string(),
      "invalid topology: stream 'spout:default' has no field 'word'"
    );
  }

  #[test]
  fn test_transport_error_transience() {
    let io = TransportError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
    assert!(io.is_transient());
    assert!(TransportError::Timeout(WorkerId(1)).is_transient());
    assert!(!TransportError::ChannelClosed(TaskId(1)).is_transient());
  }

  #[test]
  fn test_task_failure_accessors() {
    let f = TaskFailure::Panicked {
      task: TaskId(5),
      component: "count".into(),
      phase: "execute",
      message: "boom".into(),
    };
    assert_eq!(f.task(), TaskId(5));
    assert_eq!(f.component(), "count");
    let wrapped: Error = f.into();
    assert!(wrapped.to_string().contains("boom"));
  }

  #[test]
  fn test_metrics_build_error_converts() {
    let build = metrics_exporter_prometheus::BuildError::FailedToCreateHTTPListener("address in use".into());
    let e: Error = build.into();
    assert!(matches!(e, Error::Metrics(_)));
    assert!(e.to_string().starts_with("failed to install Prometheus recorder"));
  }
}
