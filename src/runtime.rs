//! # Topology Runtime
//!
//! Wires the execution core together for one worker.
//!
//! [`TopologyRuntime::launch`] builds the worker's [`AckTracker`],
//! [`BackpressureController`], [`RoutingTable`] and [`Dispatcher`], creates
//! one component instance per task placed on the worker and spawns an
//! executor for each. Background tasks sweep expired ack trees, flush remote
//! batches, accept peer connections and supervise failed executors.
//!
//! A failed task is marked dead in the routing table, its queue is dropped
//! and the [`WorkerSupervisor`] decides whether it is restarted from its
//! component factory.
//!
//! [`TopologyHandle::shutdown`] signals every executor, joins them, flushes
//! what is still buffered and fails every in-flight ack tree.

use crate::ack::{AckTracker, FailureReason};
use crate::backpressure::{BackpressureController, LinkId};
use crate::config::TopologyConfig;
use crate::dispatcher::{Dispatcher, Transport, serve_inbound};
use crate::error::{Error, TaskFailure};
use crate::executor::{
  Bolt, Component, ComponentFactory, ExecutorServices, Spout, TaskContext, TaskExecutor,
};
use crate::metrics;
use crate::router::RoutingTable;
use crate::supervision::{
  FailureAction, FailureReport, RestartingSupervisor, SupervisionPolicy, WorkerSupervisor,
};
use crate::topology::{ComponentKind, TopologyGraph};
use crate::tuple::{IdGenerator, TaskId, WorkerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Component factories by component name.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
  factories: HashMap<String, Arc<dyn ComponentFactory>>,
}

impl ComponentRegistry {
  /// Creates an empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers the factory of `component`, replacing any previous one.
  pub fn register<F: ComponentFactory + 'static>(&mut self, component: impl Into<String>, factory: F) {
    self.factories.insert(component.into(), Arc::new(factory));
  }

  /// Builder form of [`register`](Self::register).
  pub fn with_factory<F: ComponentFactory + 'static>(
    mut self,
    component: impl Into<String>,
    factory: F,
  ) -> Self {
    self.register(component, factory);
    self
  }

  /// Registers a spout constructor.
  pub fn with_spout<S, F>(self, component: impl Into<String>, make: F) -> Self
  where
    S: Spout + 'static,
    F: Fn(&TaskContext) -> S + Send + Sync + 'static,
  {
    self.with_factory(component, move |ctx: &TaskContext| Component::spout(make(ctx)))
  }

  /// Registers a bolt constructor.
  pub fn with_bolt<B, F>(self, component: impl Into<String>, make: F) -> Self
  where
    B: Bolt + 'static,
    F: Fn(&TaskContext) -> B + Send + Sync + 'static,
  {
    self.with_factory(component, move |ctx: &TaskContext| Component::bolt(make(ctx)))
  }

  /// Factory of `component`.
  pub fn get(&self, component: &str) -> Option<&Arc<dyn ComponentFactory>> {
    self.factories.get(component)
  }

  /// True if `component` has a factory.
  pub fn contains(&self, component: &str) -> bool {
    self.factories.contains_key(component)
  }
}

/// Worker-specific launch options.
pub struct RuntimeOptions {
  /// This worker.
  pub worker: WorkerId,
  /// Transport to remote workers; `None` for single-worker topologies.
  pub transport: Option<Arc<dyn Transport>>,
  /// Listener accepting tuples and ack traffic from peers.
  pub listener: Option<TcpListener>,
  /// Failure handling; defaults to a [`RestartingSupervisor`] with the
  /// default [`SupervisionPolicy`].
  pub supervisor: Option<Arc<dyn WorkerSupervisor>>,
}

impl RuntimeOptions {
  /// Options for `worker` with no transport and the default supervisor.
  pub fn new(worker: WorkerId) -> Self {
    Self {
      worker,
      transport: None,
      listener: None,
      supervisor: None,
    }
  }

  /// Sets the transport to remote workers.
  pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
    self.transport = Some(transport);
    self
  }

  /// Accepts peer connections on `listener`.
  pub fn with_listener(mut self, listener: TcpListener) -> Self {
    self.listener = Some(listener);
    self
  }

  /// Sets the supervisor.
  pub fn with_supervisor(mut self, supervisor: Arc<dyn WorkerSupervisor>) -> Self {
    self.supervisor = Some(supervisor);
    self
  }

  /// Supervises with a [`RestartingSupervisor`] applying `policy`.
  pub fn with_policy(self, policy: SupervisionPolicy) -> Self {
    self.with_supervisor(Arc::new(RestartingSupervisor::new(policy)))
  }
}

/// Entry point launching a topology on one worker.
pub struct TopologyRuntime;

impl TopologyRuntime {
  /// Launches the tasks `graph` places on `worker`, with default options.
  ///
  /// Must be called from within a tokio runtime.
  pub fn launch(
    graph: Arc<TopologyGraph>,
    components: ComponentRegistry,
    config: TopologyConfig,
    worker: WorkerId,
  ) -> Result<TopologyHandle, Error> {
    Self::launch_with(graph, components, config, RuntimeOptions::new(worker))
  }

  /// Launches with explicit options.
  pub fn launch_with(
    graph: Arc<TopologyGraph>,
    components: ComponentRegistry,
    config: TopologyConfig,
    options: RuntimeOptions,
  ) -> Result<TopologyHandle, Error> {
    config.validate()?;
    let worker = options.worker;

    let mut hosted: Vec<(TaskId, bool)> = graph
      .tasks_on(worker)
      .map(|t| {
        let spout = graph
          .component(&t.component)
          .is_some_and(|c| c.kind == ComponentKind::Spout);
        (t.id, spout)
      })
      .collect();
    for instance in graph.tasks_on(worker) {
      if !components.contains(&instance.component) {
        return Err(Error::MissingFactory(instance.component.clone()));
      }
    }
    // Bolts first, so their queues exist before any spout emits.
    hosted.sort_by_key(|(task, spout)| (*spout, *task));

    let config = Arc::new(config);
    let backpressure = Arc::new(BackpressureController::from_config(&config)?);
    let tracker = config
      .is_acking()
      .then(|| Arc::new(AckTracker::from_config(&config)));
    let remote = options.transport.is_some();
    let dispatcher = Arc::new(Dispatcher::new(
      worker,
      graph.clone(),
      &config,
      backpressure.clone(),
      tracker.clone(),
      options.transport,
    ));
    let services = ExecutorServices {
      graph: graph.clone(),
      config: config.clone(),
      table: Arc::new(RoutingTable::new(graph.clone())),
      ids: Arc::new(IdGenerator::new(worker)),
      dispatcher: dispatcher.clone(),
      backpressure,
      tracker: tracker.clone(),
    };
    let supervisor = options
      .supervisor
      .unwrap_or_else(|| Arc::new(RestartingSupervisor::new(SupervisionPolicy::default())));
    let (shutdown, _) = watch::channel(false);
    let (failures, failure_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(Shared {
      worker,
      services,
      components,
      supervisor,
      shutdown,
      failures,
      executors: Mutex::new(HashMap::new()),
    });
    for (task, _) in &hosted {
      shared.spawn_task(*task)?;
    }

    let mut background = Vec::new();
    if let Some(tracker) = &tracker {
      background.push(tracker.spawn_sweeper(config.ack_sweep_interval, shared.shutdown.subscribe()));
    }
    if remote {
      background.push(dispatcher.spawn_flusher(config.flush_interval, shared.shutdown.subscribe()));
    }
    if let Some(listener) = options.listener {
      background.push(serve_inbound(listener, dispatcher, shared.shutdown.subscribe()));
    }
    background.push(tokio::spawn(supervise(shared.clone(), failure_rx)));

    info!(
      topology = graph.name(),
      worker = %worker,
      tasks = hosted.len(),
      acking = tracker.is_some(),
      "topology launched"
    );
    Ok(TopologyHandle { shared, background })
  }
}

struct Shared {
  worker: WorkerId,
  services: ExecutorServices,
  components: ComponentRegistry,
  supervisor: Arc<dyn WorkerSupervisor>,
  shutdown: watch::Sender<bool>,
  failures: mpsc::UnboundedSender<TaskFailure>,
  executors: Mutex<HashMap<TaskId, JoinHandle<()>>>,
}

impl Shared {
  fn executors(&self) -> MutexGuard<'_, HashMap<TaskId, JoinHandle<()>>> {
    match self.executors.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn is_stopping(&self) -> bool {
    *self.shutdown.borrow()
  }

  fn is_running(&self, task: TaskId) -> bool {
    self
      .executors()
      .get(&task)
      .is_some_and(|handle| !handle.is_finished())
  }

  /// Creates a fresh instance of `task` and spawns its executor.
  fn spawn_task(&self, task: TaskId) -> Result<(), Error> {
    let not_hosted = Error::NotHosted {
      task,
      worker: self.worker,
    };
    let Some(ctx) = TaskContext::new(self.services.graph.clone(), task) else {
      return Err(not_hosted);
    };
    if ctx.worker != self.worker {
      return Err(not_hosted);
    }
    if self.is_stopping() {
      debug!(task = %task, "not spawning during shutdown");
      return Ok(());
    }
    let factory = self
      .components
      .get(&ctx.component)
      .ok_or_else(|| Error::MissingFactory(ctx.component.clone()))?;
    let component = factory.create(&ctx);

    let (queue, inbound) = mpsc::channel(self.services.config.queue_capacity);
    self.services.backpressure.reset(LinkId::Task(task));
    if matches!(component, Component::Bolt(_)) {
      self.services.dispatcher.register_local(task, queue);
    }

    let name = ctx.component.clone();
    let executor = TaskExecutor::new(
      ctx,
      component,
      self.services.clone(),
      inbound,
      self.shutdown.subscribe(),
    );
    let failures = self.failures.clone();
    let handle = tokio::spawn(async move {
      if let Err(failure) = executor.run().await {
        let _ = failures.send(failure);
      }
    });
    if let Some(previous) = self.executors().insert(task, handle) {
      previous.abort();
    }
    self.services.table.mark_live(task);
    debug!(task = %task, component = %name, "executor spawned");
    Ok(())
  }

  fn on_failure(self: &Arc<Self>, failure: TaskFailure) {
    let report = FailureReport::from(failure);
    let task = report.task;
    error!(task = %task, component = %report.component, error = %report.failure, "task failed");
    metrics::record_task_failure(&report.component, task);

    self.services.table.mark_dead(task);
    self.services.dispatcher.unregister_local(task);
    self.services.backpressure.reset(LinkId::Task(task));

    match self.supervisor.report_failure(&report) {
      FailureAction::Restart => self.schedule_restart(task),
      FailureAction::Stop => warn!(task = %task, "task stopped"),
      FailureAction::Escalate => {
        error!(task = %task, worker = %self.worker, "failure escalated, stopping worker");
        self.shutdown.send_replace(true);
      }
    }
  }

  fn schedule_restart(self: &Arc<Self>, task: TaskId) {
    let Some(delay) = self.supervisor.request_restart(task) else {
      warn!(task = %task, "restart refused");
      return;
    };
    let shared = Arc::clone(self);
    let mut shutdown = self.shutdown.subscribe();
    tokio::spawn(async move {
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = stopped(&mut shutdown) => return,
      }
      match shared.spawn_task(task) {
        Ok(()) => info!(task = %task, "task restarted"),
        Err(e) => error!(task = %task, error = %e, "restart failed"),
      }
    });
  }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
  let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn supervise(shared: Arc<Shared>, mut failures: mpsc::UnboundedReceiver<TaskFailure>) {
  let mut shutdown = shared.shutdown.subscribe();
  loop {
    let failure = tokio::select! {
      failure = failures.recv() => failure,
      _ = stopped(&mut shutdown) => break,
    };
    match failure {
      Some(failure) => shared.on_failure(failure),
      None => break,
    }
  }
  debug!("supervisor stopped");
}

/// Handle to a launched topology.
pub struct TopologyHandle {
  shared: Arc<Shared>,
  background: Vec<JoinHandle<()>>,
}

impl TopologyHandle {
  /// Worker the handle controls.
  pub fn worker(&self) -> WorkerId {
    self.shared.worker
  }

  /// Physical topology.
  pub fn graph(&self) -> &Arc<TopologyGraph> {
    &self.shared.services.graph
  }

  /// Effective configuration.
  pub fn config(&self) -> &TopologyConfig {
    &self.shared.services.config
  }

  /// Ack tracker of this worker; `None` when acking is off.
  pub fn tracker(&self) -> Option<&Arc<AckTracker>> {
    self.shared.services.tracker.as_ref()
  }

  /// Link state of this worker.
  pub fn backpressure(&self) -> &Arc<BackpressureController> {
    &self.shared.services.backpressure
  }

  /// Dispatcher of this worker.
  pub fn dispatcher(&self) -> &Arc<Dispatcher> {
    &self.shared.services.dispatcher
  }

  /// Live-instance table.
  pub fn routing_table(&self) -> &Arc<RoutingTable> {
    &self.shared.services.table
  }

  /// Tasks placed on this worker.
  pub fn hosted_tasks(&self) -> Vec<TaskId> {
    let mut tasks: Vec<TaskId> = self.graph().tasks_on(self.worker()).map(|t| t.id).collect();
    tasks.sort();
    tasks
  }

  /// True while the executor of `task` is running.
  pub fn is_running(&self, task: TaskId) -> bool {
    self.shared.is_running(task)
  }

  /// Open ack trees.
  pub fn in_flight(&self) -> usize {
    self.tracker().map_or(0, |t| t.in_flight())
  }

  /// Respawns a stopped task from its component factory, bypassing the
  /// supervisor's restart budget. Returns false if the task is running.
  pub fn restart_task(&self, task: TaskId) -> Result<bool, Error> {
    if !self.graph().task(task).is_some_and(|t| t.worker == self.worker()) {
      return Err(Error::NotHosted {
        task,
        worker: self.worker(),
      });
    }
    if self.is_running(task) {
      return Ok(false);
    }
    self.shared.spawn_task(task)?;
    info!(task = %task, "task restarted on request");
    Ok(true)
  }

  /// True once shutdown was requested, by [`shutdown`](Self::shutdown) or an
  /// escalated failure.
  pub fn is_stopping(&self) -> bool {
    self.shared.is_stopping()
  }

  /// Resolves once shutdown was requested.
  pub async fn stopped(&self) {
    let mut shutdown = self.shared.shutdown.subscribe();
    stopped(&mut shutdown).await;
  }

  /// Stops the worker: signals and joins every executor, flushes remote
  /// batches and fails every in-flight tree.
  ///
  /// Returns the number of trees failed.
  pub async fn shutdown(self) -> usize {
    self.shared.shutdown.send_replace(true);
    let executors: Vec<(TaskId, JoinHandle<()>)> = self.shared.executors().drain().collect();
    for (task, handle) in executors {
      if let Err(e) = handle.await {
        warn!(task = %task, error = %e, "executor did not stop cleanly");
      }
    }
    let grace = self.shared.services.config.shutdown_timeout;
    match timeout(grace, self.shared.services.dispatcher.flush()).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(error = %e, "final flush failed"),
      Err(_) => warn!(timeout_ms = grace.as_millis() as u64, "final flush timed out"),
    }
    for mut handle in self.background {
      if timeout(grace, &mut handle).await.is_err() {
        warn!("background task did not stop in time, aborting");
        handle.abort();
      }
    }
    let failed = self
      .shared
      .services
      .tracker
      .as_ref()
      .map_or(0, |t| t.fail_all(FailureReason::Shutdown));
    info!(worker = %self.shared.worker, failed, "topology stopped");
    failed
  }
}
