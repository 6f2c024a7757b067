//! # Ack Tracker
//!
//! Per-root acknowledgment trees deciding when a spout's root tuple has been
//! fully processed.
//!
//! ## Lifecycle of a tree
//!
//! 1. A spout emits: [`AckTracker::register_root`] opens a tree whose single
//!    pending unit is the root emission itself.
//! 2. Every routed copy of a tuple descending from the root registers one
//!    more pending unit ([`AckSink::register_children`]), *before* the task
//!    that produced it acks its own input.
//! 3. Every processed copy is acked ([`AckSink::ack`]).
//! 4. The tree ends in exactly one outcome: `Succeeded` once nothing is
//!    pending, `Failed` on an explicit fail, a routing or transport failure,
//!    the message timeout, or shutdown.
//!
//! Outcomes go to the originating spout task through its subscription
//! channel. Acks and fails of finished trees are no-ops.
//!
//! Trees live in a sharded [`DashMap`]: operations on one root are atomic and
//! different roots do not contend. Removal goes through `remove_if`, so two
//! racing completions cannot both report an outcome.

mod tree;

#[cfg(test)]
mod ack_test;

use crate::config::TopologyConfig;
use crate::metrics;
use crate::tuple::{RootId, TaskId, TupleId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tree::AckTree;

/// Why a tree failed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
  /// A bolt failed one of the tree's tuples.
  Explicit,
  /// The message timeout elapsed.
  Timeout,
  /// An emission anchored on the tree could not be routed.
  Routing,
  /// A routed tuple could not be delivered.
  Transport,
  /// The topology shut down with the tree in flight.
  Shutdown,
}

impl FailureReason {
  /// Label used in logs and metrics.
  pub fn as_str(&self) -> &'static str {
    match self {
      FailureReason::Explicit => "explicit",
      FailureReason::Timeout => "timeout",
      FailureReason::Routing => "routing",
      FailureReason::Transport => "transport",
      FailureReason::Shutdown => "shutdown",
    }
  }
}

impl fmt::Display for FailureReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Terminal outcome of a tree, delivered to its spout task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckOutcome {
  /// Every tuple of the tree was acked.
  Succeeded {
    /// Root of the tree.
    root: RootId,
  },
  /// The tree failed.
  Failed {
    /// Root of the tree.
    root: RootId,
    /// Failure cause.
    reason: FailureReason,
  },
}

impl AckOutcome {
  /// Root of the finished tree.
  pub fn root(&self) -> RootId {
    match self {
      AckOutcome::Succeeded { root } | AckOutcome::Failed { root, .. } => *root,
    }
  }
}

/// Receiver of ack bookkeeping calls.
///
/// Implemented by [`AckTracker`] for trees owned by this worker and by the
/// dispatcher, which forwards calls for remotely owned roots to their owner.
pub trait AckSink: Send + Sync {
  /// Adds one pending unit per id to the tree of `root`.
  fn register_children(&self, root: RootId, children: &[TupleId]);

  /// Credits delivery `tuple` in the tree of every root in `roots`.
  fn ack(&self, tuple: TupleId, roots: &BTreeSet<RootId>);

  /// Fails the tree of every root in `roots`.
  fn fail(&self, roots: &BTreeSet<RootId>, reason: FailureReason);
}

/// Tracks the ack trees of the roots emitted by this worker's spouts.
#[derive(Debug)]
pub struct AckTracker {
  trees: DashMap<RootId, AckTree>,
  subscribers: DashMap<TaskId, mpsc::UnboundedSender<AckOutcome>>,
  timeout: Duration,
}

impl AckTracker {
  /// Creates a tracker failing trees older than `timeout`.
  pub fn new(timeout: Duration) -> Self {
    Self {
      trees: DashMap::new(),
      subscribers: DashMap::new(),
      timeout,
    }
  }

  /// Creates a tracker with the configured message timeout.
  pub fn from_config(config: &TopologyConfig) -> Self {
    Self::new(config.message_timeout)
  }

  /// Message timeout.
  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Subscribes `task` to the outcomes of the roots it registers.
  ///
  /// A second subscription for the same task replaces the first, which is
  /// what a restarted spout needs.
  pub fn subscribe(&self, task: TaskId) -> mpsc::UnboundedReceiver<AckOutcome> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.subscribers.insert(task, tx);
    rx
  }

  /// Opens the tree of a new root emitted by `spout_task`.
  pub fn register_root(&self, root: RootId, spout_task: TaskId) {
    self.register_root_at(root, spout_task, Instant::now());
  }

  /// Opens a tree created at `now`.
  pub fn register_root_at(&self, root: RootId, spout_task: TaskId, now: Instant) {
    self
      .trees
      .insert(root, AckTree::new(root, spout_task, now, self.timeout));
  }

  /// Fails the tree of a single root.
  pub fn fail_root(&self, root: RootId, reason: FailureReason) {
    if let Some((_, tree)) = self.trees.remove(&root) {
      self.finish(tree, Some(reason));
    }
  }

  /// Fails every tree whose deadline is at or before `now`.
  ///
  /// Returns the number of trees failed.
  pub fn sweep_expired(&self, now: Instant) -> usize {
    let expired: Vec<RootId> = self
      .trees
      .iter()
      .filter(|entry| entry.value().is_expired(now))
      .map(|entry| *entry.key())
      .collect();
    let mut failed = 0;
    for root in expired {
      if let Some((_, tree)) = self.trees.remove_if(&root, |_, t| t.is_expired(now)) {
        self.finish(tree, Some(FailureReason::Timeout));
        failed += 1;
      }
    }
    if failed > 0 {
      warn!(failed, "ack trees timed out");
    }
    failed
  }

  /// Fails every open tree. Returns the number of trees failed.
  pub fn fail_all(&self, reason: FailureReason) -> usize {
    let roots: Vec<RootId> = self.trees.iter().map(|entry| *entry.key()).collect();
    let mut failed = 0;
    for root in roots {
      if let Some((_, tree)) = self.trees.remove(&root) {
        self.finish(tree, Some(reason));
        failed += 1;
      }
    }
    if failed > 0 {
      info!(failed, reason = %reason, "failed in-flight ack trees");
    }
    failed
  }

  /// Number of open trees.
  pub fn in_flight(&self) -> usize {
    self.trees.len()
  }

  /// True if the tree of `root` is still open.
  pub fn is_open(&self, root: RootId) -> bool {
    self.trees.contains_key(&root)
  }

  /// Runs [`sweep_expired`](Self::sweep_expired) every `interval` until
  /// `shutdown` turns true.
  pub fn spawn_sweeper(
    self: &Arc<Self>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    let tracker = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = ticker.tick() => {
            tracker.sweep_expired(Instant::now());
          }
          changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
              break;
            }
          }
        }
      }
      debug!("ack sweeper stopped");
    })
  }

  fn complete_if_done(&self, root: RootId) {
    if let Some((_, tree)) = self.trees.remove_if(&root, |_, t| t.is_complete()) {
      self.finish(tree, None);
    }
  }

  fn finish(&self, tree: AckTree, failure: Option<FailureReason>) {
    let outcome = match failure {
      None => {
        metrics::record_acked(tree.spout_task);
        debug!(
          root = %tree.root,
          task = %tree.spout_task,
          units = tree.expected,
          latency_ms = tree.created.elapsed().as_millis() as u64,
          "ack tree completed"
        );
        AckOutcome::Succeeded { root: tree.root }
      }
      Some(reason) => {
        metrics::record_failed(tree.spout_task, reason.as_str());
        debug!(
          root = %tree.root,
          task = %tree.spout_task,
          reason = %reason,
          acked = tree.acked,
          pending = tree.pending(),
          "ack tree failed"
        );
        AckOutcome::Failed {
          root: tree.root,
          reason,
        }
      }
    };
    match self.subscribers.get(&tree.spout_task) {
      Some(tx) => {
        if tx.send(outcome).is_err() {
          debug!(task = %tree.spout_task, "outcome subscriber gone");
        }
      }
      None => debug!(task = %tree.spout_task, "no outcome subscriber"),
    }
  }
}

impl AckSink for AckTracker {
  fn register_children(&self, root: RootId, children: &[TupleId]) {
    let registered = match self.trees.get_mut(&root) {
      Some(mut tree) => {
        tree.register(children);
        true
      }
      None => false,
    };
    if registered {
      self.complete_if_done(root);
    }
  }

  fn ack(&self, tuple: TupleId, roots: &BTreeSet<RootId>) {
    for root in roots {
      let complete = match self.trees.get_mut(root) {
        Some(mut tree) => {
          tree.ack(tuple);
          tree.is_complete()
        }
        None => false,
      };
      if complete {
        self.complete_if_done(*root);
      }
    }
  }

  fn fail(&self, roots: &BTreeSet<RootId>, reason: FailureReason) {
    for root in roots {
      self.fail_root(*root, reason);
    }
  }
}
