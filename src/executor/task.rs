//! Executor loops for spout and bolt tasks.

use crate::ack::{AckOutcome, AckSink, AckTracker, FailureReason};
use crate::backpressure::{BackpressureController, LinkId};
use crate::config::TopologyConfig;
use crate::dispatcher::Dispatcher;
use crate::error::TaskFailure;
use crate::executor::output::{BoltOutput, SpoutOutput};
use crate::executor::{AckDecision, Bolt, Component, Spout, TaskContext, TaskError};
use crate::metrics;
use crate::router::{RoutingTable, TupleRouter};
use crate::topology::TopologyGraph;
use crate::tuple::{Emission, IdGenerator, RootId, TICK_STREAM, TaskId, Tuple, TupleId};
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

/// Worker-level services every executor of the worker shares.
#[derive(Clone)]
pub struct ExecutorServices {
  /// Physical topology.
  pub graph: Arc<TopologyGraph>,
  /// Topology configuration.
  pub config: Arc<TopologyConfig>,
  /// Live-instance table read by every router.
  pub table: Arc<RoutingTable>,
  /// Tuple id source of this worker.
  pub ids: Arc<IdGenerator>,
  /// Delivery and remote ack forwarding.
  pub dispatcher: Arc<Dispatcher>,
  /// Link state.
  pub backpressure: Arc<BackpressureController>,
  /// Ack trees of this worker's roots; `None` when acking is off.
  pub tracker: Option<Arc<AckTracker>>,
}

impl ExecutorServices {
  fn acking(&self) -> bool {
    self.config.is_acking() && self.tracker.is_some()
  }
}

/// Runs one task instance until shutdown or failure.
pub struct TaskExecutor {
  runner: Runner,
}

enum Runner {
  Spout(SpoutRunner),
  Bolt(BoltRunner),
}

impl TaskExecutor {
  /// Creates the executor of a freshly created component instance.
  ///
  /// `inbound` is the task's queue and is only read by bolts. A spout
  /// subscribes to its ack outcomes here, before it can emit anything.
  pub fn new(
    ctx: TaskContext,
    component: Component,
    services: ExecutorServices,
    inbound: mpsc::Receiver<Tuple>,
    shutdown: watch::Receiver<bool>,
  ) -> Self {
    let emitter = Emitter::new(ctx.task, &services, shutdown.clone());
    let runner = match component {
      Component::Spout(spout) => {
        let tracking = services.acking();
        let outcomes = if tracking {
          services.tracker.as_ref().map(|t| t.subscribe(ctx.task))
        } else {
          None
        };
        let max_pending = ctx
          .config
          .max_spout_pending
          .or(services.config.max_spout_pending);
        Runner::Spout(SpoutRunner {
          ctx,
          spout,
          services,
          emitter,
          outcomes,
          shutdown,
          tracking,
          max_pending,
          pending: 0,
        })
      }
      Component::Bolt(bolt) => Runner::Bolt(BoltRunner {
        ctx,
        bolt,
        services,
        emitter,
        inbound,
        output: BoltOutput::default(),
        shutdown,
      }),
    };
    Self { runner }
  }

  /// Task this executor runs.
  pub fn task(&self) -> TaskId {
    match &self.runner {
      Runner::Spout(r) => r.ctx.task,
      Runner::Bolt(r) => r.ctx.task,
    }
  }

  /// Runs the task. Returns `Ok` on graceful shutdown.
  pub async fn run(self) -> Result<(), TaskFailure> {
    match self.runner {
      Runner::Spout(r) => r.run().await,
      Runner::Bolt(r) => r.run().await,
    }
  }
}

/// Routes emissions, dispatches the copies and forwards ack bookkeeping.
struct Emitter {
  router: TupleRouter,
  dispatcher: Arc<Dispatcher>,
  acker: Option<Arc<dyn AckSink>>,
  backpressure: Arc<BackpressureController>,
  downstream: Vec<LinkId>,
  shutdown: watch::Receiver<bool>,
}

impl Emitter {
  fn new(task: TaskId, services: &ExecutorServices, shutdown: watch::Receiver<bool>) -> Self {
    let acker = services
      .acking()
      .then(|| services.dispatcher.clone() as Arc<dyn AckSink>);
    let router = TupleRouter::new(
      task,
      services.graph.clone(),
      services.table.clone(),
      services.ids.clone(),
      acker.clone(),
    );
    Self {
      router,
      dispatcher: services.dispatcher.clone(),
      acker,
      backpressure: services.backpressure.clone(),
      downstream: services.dispatcher.downstream_links(task),
      shutdown,
    }
  }

  /// Routes and delivers one emission. A routing or delivery error fails
  /// the emission's roots; the executor keeps going. A delivery blocked on a
  /// paused link is abandoned at shutdown.
  async fn emit(&mut self, emission: &Emission) {
    let deliveries = match self.router.route(emission) {
      Ok(deliveries) => deliveries,
      Err(e) => {
        warn!(task = %self.router.task(), stream = %emission.stream, error = %e, "routing failed");
        self.fail(&emission.roots, FailureReason::Routing);
        return;
      }
    };
    metrics::record_emitted(
      self.router.component(),
      &emission.stream,
      deliveries.len() as u64,
    );
    for delivery in deliveries {
      let destination = delivery.destination;
      let sent = tokio::select! {
        sent = self.dispatcher.send(delivery) => sent,
        _ = stopped(&mut self.shutdown) => {
          self.fail(&emission.roots, FailureReason::Shutdown);
          return;
        }
      };
      if let Err(e) = sent {
        warn!(task = %self.router.task(), destination = %destination, error = %e, "delivery failed");
        self.fail(&emission.roots, FailureReason::Transport);
        return;
      }
    }
  }

  fn ack(&self, tuple: TupleId, roots: &BTreeSet<RootId>) {
    match &self.acker {
      Some(acker) if !roots.is_empty() => acker.ack(tuple, roots),
      _ => {}
    }
  }

  fn fail(&self, roots: &BTreeSet<RootId>, reason: FailureReason) {
    match &self.acker {
      Some(acker) if !roots.is_empty() => acker.fail(roots, reason),
      _ => {}
    }
  }

  fn downstream_paused(&self) -> bool {
    self.backpressure.any_paused(&self.downstream)
  }

  async fn wait_downstream(&self) {
    self
      .backpressure
      .wait_until_all_resumed(&self.downstream)
      .await;
  }
}

struct SpoutRunner {
  ctx: TaskContext,
  spout: Box<dyn Spout>,
  services: ExecutorServices,
  emitter: Emitter,
  outcomes: Option<mpsc::UnboundedReceiver<AckOutcome>>,
  shutdown: watch::Receiver<bool>,
  tracking: bool,
  max_pending: Option<usize>,
  pending: usize,
}

impl SpoutRunner {
  async fn run(mut self) -> Result<(), TaskFailure> {
    let task = self.ctx.task;
    guard(task, &self.ctx.component, "open", self.spout.open(&self.ctx)).await?;
    info!(task = %task, component = %self.ctx.component, "spout opened");

    while !is_shutdown(&self.shutdown) {
      self.drain_outcomes().await?;

      if self.emitter.downstream_paused() {
        debug!(task = %task, "downstream paused");
        tokio::select! {
          _ = self.emitter.wait_downstream() => {}
          _ = self.shutdown.changed() => {}
        }
        continue;
      }

      if self.at_pending_limit() {
        let Some(outcomes) = self.outcomes.as_mut() else {
          break;
        };
        let outcome = tokio::select! {
          outcome = outcomes.recv() => outcome,
          _ = self.shutdown.changed() => continue,
        };
        match outcome {
          Some(outcome) => self.on_outcome(outcome).await?,
          None => break,
        }
        continue;
      }

      let mut out = SpoutOutput::new(self.services.ids.clone(), self.tracking);
      guard(
        task,
        &self.ctx.component,
        "next_tuple",
        self.spout.next_tuple(&mut out),
      )
      .await?;

      let emitted = out.take();
      if emitted.is_empty() {
        let idle = self.services.config.idle_backoff;
        tokio::select! {
          _ = tokio::time::sleep(idle) => {}
          _ = self.shutdown.changed() => {}
        }
        continue;
      }
      for (root, emission) in emitted {
        self.emit_root(root, emission).await;
      }
    }

    let spout = &mut self.spout;
    guard(task, &self.ctx.component, "close", async move {
      spout.close().await;
      Ok::<(), TaskError>(())
    })
    .await?;
    info!(task = %task, component = %self.ctx.component, "spout closed");
    Ok(())
  }

  /// Opens the tree, routes the root tuple, then credits the root's own unit.
  async fn emit_root(&mut self, root: RootId, emission: Emission) {
    if self.tracking {
      if let Some(tracker) = &self.services.tracker {
        tracker.register_root(root, self.ctx.task);
      }
      self.pending += 1;
    }
    self.emitter.emit(&emission).await;
    if self.tracking {
      self.emitter.ack(root.as_tuple_id(), &emission.roots);
    }
  }

  fn at_pending_limit(&self) -> bool {
    self.tracking && self.max_pending.is_some_and(|max| self.pending >= max)
  }

  async fn drain_outcomes(&mut self) -> Result<(), TaskFailure> {
    while let Some(outcome) = self.outcomes.as_mut().and_then(|rx| rx.try_recv().ok()) {
      self.on_outcome(outcome).await?;
    }
    Ok(())
  }

  async fn on_outcome(&mut self, outcome: AckOutcome) -> Result<(), TaskFailure> {
    self.pending = self.pending.saturating_sub(1);
    let spout = &mut self.spout;
    let component = &self.ctx.component;
    match outcome {
      AckOutcome::Succeeded { root } => {
        guard(self.ctx.task, component, "ack", async move {
          spout.ack(root).await;
          Ok::<(), TaskError>(())
        })
        .await
      }
      AckOutcome::Failed { root, reason } => {
        debug!(task = %self.ctx.task, root = ?root, reason = %reason, "root failed");
        guard(self.ctx.task, component, "fail", async move {
          spout.fail(root).await;
          Ok::<(), TaskError>(())
        })
        .await
      }
    }
  }
}

struct BoltRunner {
  ctx: TaskContext,
  bolt: Box<dyn Bolt>,
  services: ExecutorServices,
  emitter: Emitter,
  inbound: mpsc::Receiver<Tuple>,
  output: BoltOutput,
  shutdown: watch::Receiver<bool>,
}

impl BoltRunner {
  async fn run(mut self) -> Result<(), TaskFailure> {
    let task = self.ctx.task;
    guard(task, &self.ctx.component, "prepare", self.bolt.prepare(&self.ctx)).await?;
    info!(task = %task, component = %self.ctx.component, "bolt prepared");

    let mut ticks = self.ctx.config.tick_interval.map(tick_interval);
    while !is_shutdown(&self.shutdown) {
      let input = tokio::select! {
        biased;
        _ = self.shutdown.changed() => continue,
        _ = next_tick(&mut ticks) => self.tick_tuple(),
        received = recv_when_open(&self.emitter, &mut self.inbound) => match received {
          Some(tuple) => {
            self.services.backpressure.record_dequeue(LinkId::Task(task));
            tuple
          }
          None => break,
        },
      };
      self.process(input).await?;
    }

    let bolt = &mut self.bolt;
    guard(task, &self.ctx.component, "cleanup", async move {
      bolt.cleanup().await;
      Ok::<(), TaskError>(())
    })
    .await?;
    info!(task = %task, component = %self.ctx.component, "bolt stopped");
    Ok(())
  }

  fn tick_tuple(&self) -> Tuple {
    Tuple {
      id: self.services.ids.next_id(),
      source_task: self.ctx.task,
      stream: TICK_STREAM.to_string(),
      values: Vec::new(),
      roots: BTreeSet::new(),
    }
  }

  async fn process(&mut self, input: Tuple) -> Result<(), TaskFailure> {
    let tick = input.is_tick();
    self.output.begin(&input);
    let result = guard(
      self.ctx.task,
      &self.ctx.component,
      "execute",
      self.bolt.execute(&input, &mut self.output),
    )
    .await;
    let batch = self.output.take();

    let decision = match result {
      Ok(decision) => decision,
      Err(failure) => {
        if !tick {
          self.emitter.fail(&input.roots, FailureReason::Explicit);
        }
        return Err(failure);
      }
    };

    // Children are registered by the router before the input is credited.
    for emission in &batch.emissions {
      self.emitter.emit(emission).await;
    }
    for (id, roots) in &batch.acks {
      self.emitter.ack(*id, roots);
    }
    for roots in &batch.fails {
      self.emitter.fail(roots, FailureReason::Explicit);
    }
    if !tick {
      match decision {
        AckDecision::Ack => self.emitter.ack(input.id, &input.roots),
        AckDecision::Fail => self.emitter.fail(&input.roots, FailureReason::Explicit),
        AckDecision::Defer => {}
      }
    }
    metrics::record_executed(&self.ctx.component, self.ctx.task);
    Ok(())
  }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
  let _ = shutdown.wait_for(|stop| *stop).await;
}

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
  *shutdown.borrow() || shutdown.has_changed().is_err()
}

fn tick_interval(period: Duration) -> Interval {
  let mut interval = interval_at(Instant::now() + period, period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
  interval
}

async fn next_tick(ticks: &mut Option<Interval>) {
  match ticks {
    Some(interval) => {
      interval.tick().await;
    }
    None => futures::future::pending::<()>().await,
  }
}

/// Waits for every downstream link to be open, then pulls the next input.
async fn recv_when_open(emitter: &Emitter, inbound: &mut mpsc::Receiver<Tuple>) -> Option<Tuple> {
  emitter.wait_downstream().await;
  inbound.recv().await
}

/// Runs a user callback, turning its error or panic into a [`TaskFailure`].
async fn guard<T, F>(
  task: TaskId,
  component: &str,
  phase: &'static str,
  callback: F,
) -> Result<T, TaskFailure>
where
  F: Future<Output = Result<T, TaskError>>,
{
  match AssertUnwindSafe(callback).catch_unwind().await {
    Ok(Ok(value)) => Ok(value),
    Ok(Err(e)) => Err(TaskFailure::Callback {
      task,
      component: component.to_string(),
      phase,
      message: e.to_string(),
    }),
    Err(payload) => Err(TaskFailure::Panicked {
      task,
      component: component.to_string(),
      phase,
      message: panic_message(payload.as_ref()),
    }),
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
