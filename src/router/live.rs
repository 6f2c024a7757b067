//! Live-instance snapshots.
//!
//! Routers read the set of live destination instances from an immutable
//! [`LiveInstances`] snapshot. A change (task death, restart) builds a new
//! snapshot with the next generation number and swaps it in under a write
//! lock, so a router holding a snapshot always sees a consistent set.

use crate::topology::TopologyGraph;
use crate::tuple::TaskId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::info;

/// An immutable view of the live task instances.
#[derive(Clone, Debug)]
pub struct LiveInstances {
  generation: u64,
  by_component: HashMap<String, Vec<TaskId>>,
  live: HashSet<TaskId>,
}

impl LiveInstances {
  fn all_live(graph: &TopologyGraph) -> Self {
    let by_component: HashMap<String, Vec<TaskId>> = graph
      .components()
      .iter()
      .map(|c| (c.name.clone(), c.tasks.clone()))
      .collect();
    let live = graph.tasks().map(|t| t.id).collect();
    Self {
      generation: 0,
      by_component,
      live,
    }
  }

  /// Generation counter, bumped on every change.
  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Live instances of `component`, sorted by task id.
  pub fn tasks_of(&self, component: &str) -> &[TaskId] {
    self
      .by_component
      .get(component)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// True if `task` is live.
  pub fn is_live(&self, task: TaskId) -> bool {
    self.live.contains(&task)
  }

  /// Number of live instances.
  pub fn len(&self) -> usize {
    self.live.len()
  }

  /// True when no instance is live.
  pub fn is_empty(&self) -> bool {
    self.live.is_empty()
  }
}

/// The shared, atomically swapped live-instance table.
#[derive(Debug)]
pub struct RoutingTable {
  graph: Arc<TopologyGraph>,
  current: RwLock<Arc<LiveInstances>>,
}

impl RoutingTable {
  /// Creates a table with every instance of `graph` live.
  pub fn new(graph: Arc<TopologyGraph>) -> Self {
    let initial = LiveInstances::all_live(&graph);
    Self {
      graph,
      current: RwLock::new(Arc::new(initial)),
    }
  }

  /// The current snapshot.
  pub fn snapshot(&self) -> Arc<LiveInstances> {
    match self.current.read() {
      Ok(guard) => guard.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  /// Removes `task` from the live set. Returns false if it was not live.
  pub fn mark_dead(&self, task: TaskId) -> bool {
    self.update(task, false)
  }

  /// Adds `task` back to the live set. Returns false if it was already live.
  pub fn mark_live(&self, task: TaskId) -> bool {
    self.update(task, true)
  }

  fn update(&self, task: TaskId, live: bool) -> bool {
    let Some(instance) = self.graph.task(task) else {
      return false;
    };
    let mut guard = match self.current.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    if guard.is_live(task) == live {
      return false;
    }
    let mut next = LiveInstances::clone(&guard);
    next.generation += 1;
    let members = next.by_component.entry(instance.component.clone()).or_default();
    if live {
      next.live.insert(task);
      members.push(task);
      members.sort_unstable();
    } else {
      next.live.remove(&task);
      members.retain(|t| *t != task);
    }
    info!(
      task = %task,
      component = %instance.component,
      live,
      generation = next.generation,
      "live instance set changed"
    );
    *guard = Arc::new(next);
    true
  }
}
