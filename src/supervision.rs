//! Supervision of failed task executors.
//!
//! When user logic returns an error or panics, the executor ends with a
//! [`TaskFailure`] and the runtime reports it to the worker's
//! [`WorkerSupervisor`]. The supervisor decides whether the task is restarted
//! with a fresh component instance, stays stopped, or takes the whole worker
//! down.

use crate::error::TaskFailure;
use crate::tuple::TaskId;
use dashmap::DashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Report of a task failure sent to the supervisor.
#[derive(Clone, Debug)]
pub struct FailureReport {
  /// Task that failed.
  pub task: TaskId,
  /// Component of the task.
  pub component: String,
  /// What went wrong.
  pub failure: TaskFailure,
}

impl From<TaskFailure> for FailureReport {
  fn from(failure: TaskFailure) -> Self {
    Self {
      task: failure.task(),
      component: failure.component().to_string(),
      failure,
    }
  }
}

/// Action to take when a task fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureAction {
  /// Restart the task with a fresh instance. Limited by `max_restarts`.
  Restart,
  /// Leave the task stopped; routing skips it from now on.
  Stop,
  /// Shut the worker down.
  Escalate,
}

/// Policy applied by [`RestartingSupervisor`].
#[derive(Clone, Debug)]
pub struct SupervisionPolicy {
  /// Action to take on failure.
  pub on_failure: FailureAction,
  /// Restarts per task before it is stopped. None = unbounded.
  pub max_restarts: Option<u32>,
  /// Delay before a restarted task is spawned again.
  pub restart_backoff: Duration,
}

impl SupervisionPolicy {
  /// Creates a new policy with the given action and defaults.
  pub fn new(on_failure: FailureAction) -> Self {
    Self {
      on_failure,
      ..Self::default()
    }
  }

  /// Sets max restarts (None = unbounded).
  pub fn with_max_restarts(mut self, n: Option<u32>) -> Self {
    self.max_restarts = n;
    self
  }

  /// Sets restart backoff.
  pub fn with_restart_backoff(mut self, d: Duration) -> Self {
    self.restart_backoff = d;
    self
  }
}

impl Default for SupervisionPolicy {
  fn default() -> Self {
    Self {
      on_failure: FailureAction::Restart,
      max_restarts: Some(3),
      restart_backoff: Duration::from_secs(1),
    }
  }
}

/// Receives task failures and decides on restarts.
pub trait WorkerSupervisor: Send + Sync {
  /// Decides what happens to a failed task.
  fn report_failure(&self, report: &FailureReport) -> FailureAction;

  /// Asks to restart `task`. Returns the delay to wait before the restart,
  /// or `None` when the restart is refused.
  fn request_restart(&self, task: TaskId) -> Option<Duration>;
}

/// In-process supervisor driven by a [`SupervisionPolicy`].
///
/// Counts restarts per task; once a task has used up `max_restarts` its
/// failures stop it instead.
#[derive(Debug, Default)]
pub struct RestartingSupervisor {
  policy: SupervisionPolicy,
  restarts: DashMap<TaskId, u32>,
}

impl RestartingSupervisor {
  /// Creates a supervisor applying `policy`.
  pub fn new(policy: SupervisionPolicy) -> Self {
    Self {
      policy,
      restarts: DashMap::new(),
    }
  }

  /// The applied policy.
  pub fn policy(&self) -> &SupervisionPolicy {
    &self.policy
  }

  /// Restarts granted to `task` so far.
  pub fn restarts(&self, task: TaskId) -> u32 {
    self.restarts.get(&task).map(|r| *r).unwrap_or(0)
  }

  fn exhausted(&self, task: TaskId) -> bool {
    self
      .policy
      .max_restarts
      .is_some_and(|max| self.restarts(task) >= max)
  }
}

impl WorkerSupervisor for RestartingSupervisor {
  fn report_failure(&self, report: &FailureReport) -> FailureAction {
    match self.policy.on_failure {
      FailureAction::Restart if self.exhausted(report.task) => {
        warn!(
          task = %report.task,
          component = %report.component,
          restarts = self.restarts(report.task),
          "restart limit reached, stopping task"
        );
        FailureAction::Stop
      }
      action => action,
    }
  }

  fn request_restart(&self, task: TaskId) -> Option<Duration> {
    if self.exhausted(task) {
      return None;
    }
    let mut count = self.restarts.entry(task).or_insert(0);
    *count += 1;
    info!(task = %task, attempt = *count, "restart granted");
    Some(self.policy.restart_backoff)
  }
}
