//! # Task Executors
//!
//! User logic plugs into the runtime through two traits:
//!
//! - [`Spout`]: a source of root tuples. `next_tuple` is called in a loop and
//!   emits through a [`SpoutOutput`]; the runtime later calls `ack` or `fail`
//!   with the root id once the tuple's ack tree has finished.
//! - [`Bolt`]: a consumer. `execute` receives one input tuple, emits through a
//!   [`BoltOutput`] and returns an [`AckDecision`] for the input.
//!
//! A [`ComponentFactory`] creates a fresh instance per task, which is also how
//! a failed task is restarted with clean state.
//!
//! Every instance runs inside a [`TaskExecutor`] on its own tokio task. The
//! executor routes and dispatches emissions, registers them with the ack
//! machinery *before* acking the input, stops pulling work while any
//! downstream link is paused, and turns user errors and panics into a
//! [`TaskFailure`](crate::error::TaskFailure).

pub mod output;
pub mod task;


pub use output::{BoltOutput, SpoutOutput};
pub use task::{ExecutorServices, TaskExecutor};

use crate::topology::{ComponentConfig, TopologyGraph};
use crate::tuple::{RootId, TaskId, Tuple, WorkerId};
use async_trait::async_trait;
use std::sync::Arc;

/// Error returned by user logic.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// What to do with a bolt's input once `execute` returns.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AckDecision {
  /// The input is fully processed.
  #[default]
  Ack,
  /// The input failed; its roots fail.
  Fail,
  /// The bolt holds on to the input and acks or fails it later through
  /// [`BoltOutput::ack`] / [`BoltOutput::fail`].
  Defer,
}

/// Identity and environment of one task instance.
#[derive(Clone, Debug)]
pub struct TaskContext {
  /// Global task id.
  pub task: TaskId,
  /// Component name.
  pub component: String,
  /// Instance index within the component.
  pub index: u32,
  /// Number of instances of the component.
  pub parallelism: u32,
  /// Hosting worker.
  pub worker: WorkerId,
  /// Component configuration.
  pub config: ComponentConfig,
  graph: Arc<TopologyGraph>,
}

impl TaskContext {
  /// Builds the context of `task`, if the graph has it.
  pub fn new(graph: Arc<TopologyGraph>, task: TaskId) -> Option<Self> {
    let instance = graph.task(task)?;
    let component = graph.component(&instance.component)?;
    Some(Self {
      task,
      component: component.name.clone(),
      index: instance.index,
      parallelism: component.parallelism,
      worker: instance.worker,
      config: component.config.clone(),
      graph: graph.clone(),
    })
  }

  /// Task ids of every instance of `component`, e.g. to pick direct targets.
  pub fn tasks_of(&self, component: &str) -> &[TaskId] {
    self
      .graph
      .component(component)
      .map(|c| c.tasks.as_slice())
      .unwrap_or(&[])
  }

  /// A free-form component setting.
  pub fn setting(&self, key: &str) -> Option<&str> {
    self.config.settings.get(key).map(String::as_str)
  }
}

/// A source of root tuples.
#[async_trait]
pub trait Spout: Send {
  /// Called once before the first `next_tuple`.
  async fn open(&mut self, _ctx: &TaskContext) -> Result<(), TaskError> {
    Ok(())
  }

  /// Emits zero or more tuples. Emitting nothing makes the executor back off
  /// briefly before calling again.
  async fn next_tuple(&mut self, out: &mut SpoutOutput) -> Result<(), TaskError>;

  /// The tree of `root` completed.
  async fn ack(&mut self, _root: RootId) {}

  /// The tree of `root` failed or timed out.
  async fn fail(&mut self, _root: RootId) {}

  /// Called on graceful shutdown.
  async fn close(&mut self) {}
}

/// A consumer of tuples.
#[async_trait]
pub trait Bolt: Send {
  /// Called once before the first `execute`.
  async fn prepare(&mut self, _ctx: &TaskContext) -> Result<(), TaskError> {
    Ok(())
  }

  /// Processes one input. Tick tuples arrive here too (see [`Tuple::is_tick`]);
  /// their decision is ignored.
  async fn execute(&mut self, input: &Tuple, out: &mut BoltOutput) -> Result<AckDecision, TaskError>;

  /// Called on graceful shutdown.
  async fn cleanup(&mut self) {}
}

/// A freshly created component instance.
pub enum Component {
  /// Spout instance.
  Spout(Box<dyn Spout>),
  /// Bolt instance.
  Bolt(Box<dyn Bolt>),
}

impl Component {
  /// Boxes a spout.
  pub fn spout<S: Spout + 'static>(spout: S) -> Self {
    Component::Spout(Box::new(spout))
  }

  /// Boxes a bolt.
  pub fn bolt<B: Bolt + 'static>(bolt: B) -> Self {
    Component::Bolt(Box::new(bolt))
  }
}

/// Creates component instances.
pub trait ComponentFactory: Send + Sync {
  /// Creates the instance running as `ctx.task`.
  fn create(&self, ctx: &TaskContext) -> Component;
}

impl<F> ComponentFactory for F
where
  F: Fn(&TaskContext) -> Component + Send + Sync,
{
  fn create(&self, ctx: &TaskContext) -> Component {
    self(ctx)
  }
}
