//! # Dispatcher
//!
//! Hands routed tuples to their destination task.
//!
//! - **Co-located destination**: awaits the destination link's resumption,
//!   records the enqueue and sends into the task's bounded inbound queue.
//! - **Remote destination**: appends a [`WireMessage::Tuple`] to the batch of
//!   the destination worker. A batch is flushed when it reaches `batch_size`,
//!   on [`Dispatcher::flush`] and on the periodic flusher. The worker channel
//!   is a backpressure link whose depth is the number of buffered messages.
//!
//! Failed remote sends are retried with backoff while the error is
//! transient. Once the attempts are exhausted every root carried by the batch
//! is failed and the caller gets a [`TransportError`].
//!
//! The dispatcher is also the worker's [`AckSink`]: bookkeeping for roots
//! owned by this worker goes straight to the local [`AckTracker`], bookkeeping
//! for remote roots is queued as control messages to the owning worker.
//! Control messages skip backpressure and ride along with the next flush.

pub mod transport;
pub mod wire;

#[cfg(test)]
mod dispatcher_test;

pub use transport::{TcpTransport, Transport, serve_inbound};
pub use wire::{Frame, WireMessage, WireVersion};

use crate::ack::{AckSink, AckTracker, FailureReason};
use crate::backpressure::{BackpressureController, LinkId};
use crate::config::TopologyConfig;
use crate::error::TransportError;
use crate::metrics;
use crate::router::Delivery;
use crate::topology::TopologyGraph;
use crate::tuple::{RootId, TaskId, Tuple, TupleId, WorkerId};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Buffered messages bound for one remote worker.
#[derive(Default)]
struct Outbound {
  data: Mutex<Vec<WireMessage>>,
  control: std::sync::Mutex<Vec<WireMessage>>,
}

impl Outbound {
  fn push_control(&self, message: WireMessage) {
    match self.control.lock() {
      Ok(mut control) => control.push(message),
      Err(poisoned) => poisoned.into_inner().push(message),
    }
  }

  fn take_control(&self) -> Vec<WireMessage> {
    match self.control.lock() {
      Ok(mut control) => std::mem::take(&mut *control),
      Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
  }

  fn has_control(&self) -> bool {
    match self.control.lock() {
      Ok(control) => !control.is_empty(),
      Err(poisoned) => !poisoned.into_inner().is_empty(),
    }
  }
}

/// Delivers tuples to local queues and remote workers.
pub struct Dispatcher {
  worker: WorkerId,
  graph: Arc<TopologyGraph>,
  backpressure: Arc<BackpressureController>,
  tracker: Option<Arc<AckTracker>>,
  transport: Option<Arc<dyn Transport>>,
  local: DashMap<TaskId, mpsc::Sender<Tuple>>,
  outbound: DashMap<WorkerId, Arc<Outbound>>,
  batch_size: usize,
  max_send_attempts: u32,
  retry_backoff: Duration,
}

impl Dispatcher {
  /// Creates the dispatcher of `worker`.
  ///
  /// `tracker` is `None` for at-most-once topologies; `transport` may be
  /// `None` when every task runs on this worker.
  pub fn new(
    worker: WorkerId,
    graph: Arc<TopologyGraph>,
    config: &TopologyConfig,
    backpressure: Arc<BackpressureController>,
    tracker: Option<Arc<AckTracker>>,
    transport: Option<Arc<dyn Transport>>,
  ) -> Self {
    Self {
      worker,
      graph,
      backpressure,
      tracker,
      transport,
      local: DashMap::new(),
      outbound: DashMap::new(),
      batch_size: config.batch_size.max(1),
      max_send_attempts: config.max_send_attempts.max(1),
      retry_backoff: config.retry_backoff,
    }
  }

  /// Worker this dispatcher runs on.
  pub fn worker(&self) -> WorkerId {
    self.worker
  }

  /// Registers (or replaces) the inbound queue of a local task.
  pub fn register_local(&self, task: TaskId, queue: mpsc::Sender<Tuple>) {
    self.local.insert(task, queue);
  }

  /// Removes the inbound queue of a local task.
  pub fn unregister_local(&self, task: TaskId) {
    self.local.remove(&task);
  }

  /// Backpressure link a tuple for `task` goes through, from this worker.
  pub fn link_for(&self, task: TaskId) -> Option<LinkId> {
    let instance = self.graph.task(task)?;
    if instance.worker == self.worker {
      Some(LinkId::Task(task))
    } else {
      Some(LinkId::Worker(instance.worker))
    }
  }

  /// Every link `task`'s emissions may go through.
  pub fn downstream_links(&self, task: TaskId) -> Vec<LinkId> {
    let Some(instance) = self.graph.task(task) else {
      return Vec::new();
    };
    let links: BTreeSet<LinkId> = instance
      .outbound
      .iter()
      .filter_map(|edge| self.graph.edge(*edge))
      .filter_map(|edge| self.graph.component(&edge.destination))
      .flat_map(|component| component.tasks.iter())
      .filter_map(|t| self.link_for(*t))
      .collect();
    links.into_iter().collect()
  }

  /// Delivers one routed copy.
  pub async fn send(&self, delivery: Delivery) -> Result<(), TransportError> {
    let Delivery { destination, tuple } = delivery;
    let instance = self
      .graph
      .task(destination)
      .ok_or(TransportError::UnknownTask(destination))?;
    if instance.worker == self.worker {
      self.send_local(destination, tuple).await
    } else {
      self.send_remote(instance.worker, destination, tuple).await
    }
  }

  async fn send_local(&self, destination: TaskId, tuple: Tuple) -> Result<(), TransportError> {
    let link = LinkId::Task(destination);
    self.backpressure.wait_until_resumed(link).await;
    let queue = self
      .local
      .get(&destination)
      .map(|q| q.value().clone())
      .ok_or(TransportError::ChannelClosed(destination))?;
    self.backpressure.record_enqueue(link);
    if queue.send(tuple).await.is_err() {
      self.backpressure.record_dequeue(link);
      return Err(TransportError::ChannelClosed(destination));
    }
    Ok(())
  }

  async fn send_remote(
    &self,
    worker: WorkerId,
    destination: TaskId,
    tuple: Tuple,
  ) -> Result<(), TransportError> {
    if self.transport.is_none() {
      return Err(TransportError::NoRoute(worker));
    }
    let link = LinkId::Worker(worker);
    self.backpressure.wait_until_resumed(link).await;
    let outbound = self.outbound(worker);
    let full = {
      let mut data = outbound.data.lock().await;
      data.push(WireMessage::tuple(destination, tuple));
      self.backpressure.record_enqueue(link);
      data.len() >= self.batch_size
    };
    if full {
      self.flush_worker(worker).await?;
    }
    Ok(())
  }

  /// Hands a message received from a peer to the local side.
  pub async fn accept_remote(&self, message: WireMessage) {
    match message {
      WireMessage::Register { root, tuple_ids } => {
        if let Some(tracker) = &self.tracker {
          tracker.register_children(root, &tuple_ids);
        }
      }
      WireMessage::Ack { tuple_id, roots } => {
        if let Some(tracker) = &self.tracker {
          tracker.ack(tuple_id, &roots);
        }
      }
      WireMessage::Fail { roots, reason } => {
        if let Some(tracker) = &self.tracker {
          tracker.fail(&roots, reason);
        }
      }
      message @ WireMessage::Tuple { .. } => {
        let Some((destination, tuple)) = message.into_delivery() else {
          return;
        };
        let hosted = self
          .graph
          .task(destination)
          .is_some_and(|t| t.worker == self.worker);
        let roots = tuple.roots.clone();
        let result = if hosted {
          self.send_local(destination, tuple).await
        } else {
          Err(TransportError::UnknownTask(destination))
        };
        if let Err(e) = result {
          warn!(task = %destination, error = %e, "dropping inbound tuple");
          self.fail(&roots, FailureReason::Transport);
        }
      }
    }
  }

  /// Flushes every buffered batch.
  ///
  /// Returns the first error; the roots of every failed batch have already
  /// been failed.
  pub async fn flush(&self) -> Result<(), TransportError> {
    let workers: Vec<WorkerId> = self.outbound.iter().map(|e| *e.key()).collect();
    let mut first_error = None;
    for worker in workers {
      if let Err(e) = self.flush_worker(worker).await {
        first_error.get_or_insert(e);
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  /// Flushes the batch of one worker, retrying transient failures.
  pub async fn flush_worker(&self, worker: WorkerId) -> Result<(), TransportError> {
    let Some(outbound) = self.outbound.get(&worker).map(|o| o.value().clone()) else {
      return Ok(());
    };
    let Some(transport) = self.transport.clone() else {
      return Ok(());
    };
    let link = LinkId::Worker(worker);

    // Holding the data lock across the send keeps batches to one worker in order.
    let failed: Vec<WireMessage> = {
      let mut data = outbound.data.lock().await;
      if data.is_empty() && !outbound.has_control() {
        return Ok(());
      }
      let data_batch = std::mem::take(&mut *data);
      let mut batch = outbound.take_control();
      let data_count = data_batch.len();
      batch.extend(data_batch);

      let result = self.send_with_retry(transport.as_ref(), worker, &batch).await;
      for _ in 0..data_count {
        self.backpressure.record_dequeue(link);
      }
      match result {
        Ok(()) => {
          debug!(worker = %worker, messages = batch.len(), "flushed batch");
          return Ok(());
        }
        Err(_) => batch,
      }
    };

    metrics::record_transport_failure(worker.0);
    let mut roots: BTreeSet<RootId> = BTreeSet::new();
    for message in &failed {
      roots.extend(message.roots());
    }
    // Roots owned by the unreachable worker time out there.
    roots.retain(|r| r.owner() != worker);
    error!(
      worker = %worker,
      messages = failed.len(),
      roots = roots.len(),
      "remote send failed, failing roots"
    );
    self.fail(&roots, FailureReason::Transport);
    Err(TransportError::SendFailed {
      worker,
      attempts: self.max_send_attempts,
      reason: "retries exhausted".to_string(),
    })
  }

  async fn send_with_retry(
    &self,
    transport: &dyn Transport,
    worker: WorkerId,
    batch: &[WireMessage],
  ) -> Result<(), TransportError> {
    let mut attempt = 1;
    loop {
      match transport.send_batch(worker, batch).await {
        Ok(()) => return Ok(()),
        Err(e) if e.is_transient() && attempt < self.max_send_attempts => {
          warn!(worker = %worker, attempt, error = %e, "remote send failed, retrying");
          attempt += 1;
          tokio::time::sleep(self.retry_backoff).await;
        }
        Err(e) => {
          warn!(worker = %worker, attempt, error = %e, "remote send failed");
          return Err(e);
        }
      }
    }
  }

  /// Flushes all batches every `interval` until `shutdown` turns true.
  pub fn spawn_flusher(
    self: &Arc<Self>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    let dispatcher = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = ticker.tick() => {
            // Failed batches already failed their roots.
            let _ = dispatcher.flush().await;
          }
          changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
              break;
            }
          }
        }
      }
      let _ = dispatcher.flush().await;
      debug!("flusher stopped");
    })
  }

  fn outbound(&self, worker: WorkerId) -> Arc<Outbound> {
    self
      .outbound
      .entry(worker)
      .or_default()
      .value()
      .clone()
  }

  /// Splits `roots` into local ones and remote ones grouped by owner.
  fn by_owner(&self, roots: &BTreeSet<RootId>) -> (BTreeSet<RootId>, BTreeMap<WorkerId, BTreeSet<RootId>>) {
    let mut local = BTreeSet::new();
    let mut remote: BTreeMap<WorkerId, BTreeSet<RootId>> = BTreeMap::new();
    for root in roots {
      let owner = root.owner();
      if owner == self.worker {
        local.insert(*root);
      } else {
        remote.entry(owner).or_default().insert(*root);
      }
    }
    (local, remote)
  }
}

impl AckSink for Dispatcher {
  fn register_children(&self, root: RootId, children: &[TupleId]) {
    let owner = root.owner();
    if owner == self.worker {
      if let Some(tracker) = &self.tracker {
        tracker.register_children(root, children);
      }
    } else {
      self.outbound(owner).push_control(WireMessage::Register {
        root,
        tuple_ids: children.to_vec(),
      });
    }
  }

  fn ack(&self, tuple: TupleId, roots: &BTreeSet<RootId>) {
    let (local, remote) = self.by_owner(roots);
    if let Some(tracker) = &self.tracker {
      if !local.is_empty() {
        tracker.ack(tuple, &local);
      }
    }
    for (owner, roots) in remote {
      self.outbound(owner).push_control(WireMessage::Ack {
        tuple_id: tuple,
        roots,
      });
    }
  }

  fn fail(&self, roots: &BTreeSet<RootId>, reason: FailureReason) {
    let (local, remote) = self.by_owner(roots);
    if let Some(tracker) = &self.tracker {
      if !local.is_empty() {
        tracker.fail(&local, reason);
      }
    }
    for (owner, roots) in remote {
      self
        .outbound(owner)
        .push_control(WireMessage::Fail { roots, reason });
    }
  }
}
