//! Per-grouping routing policies.
//!
//! A [`Grouping`] is resolved into a [`RoutePolicy`] once, when a router is
//! built for an edge; routing a tuple is then a single match on the policy.

use crate::error::RoutingError;
use crate::router::live::LiveInstances;
use crate::topology::{CustomGrouping, Grouping, StreamEdge, TopologyGraph};
use crate::tuple::{Emission, TaskId, Value, WorkerId};
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

/// Resolved routing function of one edge.
#[derive(Clone)]
pub(crate) enum RoutePolicy {
  /// Round-robin over live instances (also used for `None`).
  Shuffle,
  /// Hash of the key values modulo the live count.
  Fields(Vec<usize>),
  /// Every live instance.
  All,
  /// User-selected instances.
  Custom(Arc<dyn CustomGrouping>),
  /// Emitter-selected instance.
  Direct,
  /// Round-robin over live instances on the emitter's worker.
  LocalOrShuffle,
}

impl RoutePolicy {
  pub(crate) fn resolve(edge: &StreamEdge) -> Self {
    match &edge.grouping {
      Grouping::Shuffle | Grouping::None => RoutePolicy::Shuffle,
      Grouping::Fields(_) => RoutePolicy::Fields(edge.key_indices.clone()),
      Grouping::All => RoutePolicy::All,
      Grouping::Custom(c) => RoutePolicy::Custom(c.clone()),
      Grouping::Direct => RoutePolicy::Direct,
      Grouping::LocalOrShuffle => RoutePolicy::LocalOrShuffle,
    }
  }
}

/// Routing state of one outbound edge of one source task.
pub(crate) struct EdgeRoute {
  pub(crate) stream: String,
  pub(crate) destination: String,
  pub(crate) policy: RoutePolicy,
  /// Round-robin position for shuffle policies.
  pub(crate) cursor: usize,
}

impl EdgeRoute {
  pub(crate) fn new(edge: &StreamEdge, start: usize) -> Self {
    Self {
      stream: edge.stream.clone(),
      destination: edge.destination.clone(),
      policy: RoutePolicy::resolve(edge),
      cursor: start,
    }
  }

  /// Appends the destinations of `emission` on this edge to `out`.
  pub(crate) fn select(
    &mut self,
    emission: &Emission,
    snapshot: &LiveInstances,
    graph: &TopologyGraph,
    local_worker: WorkerId,
    out: &mut Vec<TaskId>,
  ) -> Result<(), RoutingError> {
    let live = snapshot.tasks_of(&self.destination);
    match &self.policy {
      RoutePolicy::Shuffle => {
        let task = self.next_round_robin(live)?;
        out.push(task);
      }
      RoutePolicy::Fields(indices) => {
        if live.is_empty() {
          return Err(self.no_live());
        }
        let hash = fields_hash(&emission.values, indices);
        out.push(live[(hash % live.len() as u64) as usize]);
      }
      RoutePolicy::All => {
        if live.is_empty() {
          return Err(self.no_live());
        }
        out.extend_from_slice(live);
      }
      RoutePolicy::Custom(grouping) => {
        if live.is_empty() {
          return Err(self.no_live());
        }
        for task in grouping.choose_tasks(&emission.values, live) {
          if !live.contains(&task) {
            return Err(self.reject_target(task, snapshot, graph));
          }
          out.push(task);
        }
      }
      RoutePolicy::Direct => {
        let task = emission.direct.ok_or_else(|| RoutingError::MissingDirectTarget {
          stream: self.stream.clone(),
        })?;
        if !live.contains(&task) {
          return Err(self.reject_target(task, snapshot, graph));
        }
        out.push(task);
      }
      RoutePolicy::LocalOrShuffle => {
        let local: Vec<TaskId> = live
          .iter()
          .copied()
          .filter(|t| graph.task(*t).is_some_and(|i| i.worker == local_worker))
          .collect();
        let task = if local.is_empty() {
          self.next_round_robin(live)?
        } else {
          self.next_round_robin(&local)?
        };
        out.push(task);
      }
    }
    Ok(())
  }

  fn next_round_robin(&mut self, pool: &[TaskId]) -> Result<TaskId, RoutingError> {
    if pool.is_empty() {
      return Err(self.no_live());
    }
    let task = pool[self.cursor % pool.len()];
    self.cursor = self.cursor.wrapping_add(1);
    Ok(task)
  }

  fn no_live(&self) -> RoutingError {
    RoutingError::NoLiveInstances {
      component: self.destination.clone(),
    }
  }

  fn reject_target(&self, task: TaskId, snapshot: &LiveInstances, graph: &TopologyGraph) -> RoutingError {
    let member = graph
      .task(task)
      .is_some_and(|t| t.component == self.destination);
    if member && !snapshot.is_live(task) {
      RoutingError::DeadTarget { task }
    } else {
      RoutingError::NotASubscriber {
        task,
        component: self.destination.clone(),
      }
    }
  }
}

/// Seed of the fields hash. Every worker must use the same one.
const FIELDS_HASH_SEED: u64 = 0;

/// Hash of the values at `indices`, identical on every worker and build.
pub(crate) fn fields_hash(values: &[Value], indices: &[usize]) -> u64 {
  let mut hasher = XxHash64::with_seed(FIELDS_HASH_SEED);
  for &i in indices {
    match values.get(i) {
      Some(v) => v.stable_hash(&mut hasher),
      None => Value::Null.stable_hash(&mut hasher),
    }
  }
  hasher.finish()
}
