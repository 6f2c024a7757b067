//! # Topology Graph
//!
//! The resolved, immutable execution-time form of a [`TopologyDeclaration`]:
//!
//! 1. Validates the declaration (names, parallelism, streams, grouping fields,
//!    acyclicity).
//! 2. Expands every component into `parallelism` task instances with dense
//!    global task ids starting at 1, in declaration order.
//! 3. Places the instances on workers.
//! 4. Resolves every bolt input into a [`StreamEdge`], precomputing the key
//!    field positions of fields groupings.
//!
//! Any topology change requires building a new graph.

use crate::error::TopologyError;
use crate::topology::declaration::{
  ComponentConfig, ComponentKind, Grouping, TopologyDeclaration,
};
use crate::topology::placement::{InstanceSlot, Placement, RoundRobinPlacement};
use crate::tuple::{TaskId, WorkerId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

/// Index of an edge within its graph.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EdgeId(pub usize);

/// One resolved subscription: `source:stream -> destination` under a grouping.
#[derive(Clone, Debug)]
pub struct StreamEdge {
  /// Edge index.
  pub id: EdgeId,
  /// Emitting component.
  pub source: String,
  /// Stream subscribed to.
  pub stream: String,
  /// Subscribing component.
  pub destination: String,
  /// Grouping of the subscription.
  pub grouping: Grouping,
  /// Positions of the grouping fields within the stream schema (fields groupings only).
  pub key_indices: Vec<usize>,
}

/// A concrete instance of a component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInstance {
  /// Global task id.
  pub id: TaskId,
  /// Component the instance belongs to.
  pub component: String,
  /// Index within the component, `0..parallelism`.
  pub index: u32,
  /// Hosting worker.
  pub worker: WorkerId,
  /// Edges delivering to this instance.
  pub inbound: Vec<EdgeId>,
  /// Edges this instance emits on.
  pub outbound: Vec<EdgeId>,
}

/// A component after expansion.
#[derive(Clone, Debug)]
pub struct ComponentInfo {
  /// Component name.
  pub name: String,
  /// Spout or bolt.
  pub kind: ComponentKind,
  /// Number of instances.
  pub parallelism: u32,
  /// Task ids of the instances, by instance index.
  pub tasks: Vec<TaskId>,
  /// Output stream schemas.
  pub streams: HashMap<String, Vec<String>>,
  /// Component configuration.
  pub config: ComponentConfig,
}

/// The immutable execution-time topology.
#[derive(Clone, Debug)]
pub struct TopologyGraph {
  name: String,
  workers: u32,
  components: Vec<ComponentInfo>,
  component_index: HashMap<String, usize>,
  tasks: BTreeMap<TaskId, TaskInstance>,
  edges: Vec<StreamEdge>,
}

impl TopologyGraph {
  /// Builds a graph with round-robin placement.
  pub fn build(decl: &TopologyDeclaration) -> Result<Self, TopologyError> {
    Self::build_with_placement(decl, &RoundRobinPlacement)
  }

  /// Builds a graph, assigning instances to workers with `placement`.
  pub fn build_with_placement(
    decl: &TopologyDeclaration,
    placement: &dyn Placement,
  ) -> Result<Self, TopologyError> {
    if decl.components.is_empty() {
      return Err(TopologyError::Empty);
    }

    let mut component_index: HashMap<String, usize> = HashMap::new();
    let mut components: Vec<ComponentInfo> = Vec::with_capacity(decl.components.len());
    for c in &decl.components {
      if component_index.contains_key(&c.name) {
        return Err(TopologyError::DuplicateComponent(c.name.clone()));
      }
      if c.parallelism < 1 {
        return Err(TopologyError::InvalidParallelism {
          component: c.name.clone(),
          parallelism: c.parallelism,
        });
      }
      if c.kind == ComponentKind::Spout && !c.inputs.is_empty() {
        return Err(TopologyError::SpoutWithInputs(c.name.clone()));
      }
      component_index.insert(c.name.clone(), components.len());
      components.push(ComponentInfo {
        name: c.name.clone(),
        kind: c.kind,
        parallelism: c.parallelism,
        tasks: Vec::new(),
        streams: c
          .effective_streams()
          .into_iter()
          .map(|s| (s.name, s.fields))
          .collect(),
        config: c.config.clone(),
      });
    }

    let mut edges: Vec<StreamEdge> = Vec::new();
    for c in &decl.components {
      for input in &c.inputs {
        let source = component_index
          .get(&input.source)
          .map(|&i| &components[i])
          .ok_or_else(|| TopologyError::UnknownComponent {
            referenced: input.source.clone(),
            destination: c.name.clone(),
          })?;
        let schema =
          source
            .streams
            .get(&input.stream)
            .ok_or_else(|| TopologyError::UnknownStream {
              component: input.source.clone(),
              stream: input.stream.clone(),
            })?;
        let key_indices = match &input.grouping {
          Grouping::Fields(fields) => {
            if fields.is_empty() {
              return Err(TopologyError::EmptyGroupingFields {
                component: input.source.clone(),
                stream: input.stream.clone(),
              });
            }
            fields
              .iter()
              .map(|field| {
                schema
                  .iter()
                  .position(|f| f == field)
                  .ok_or_else(|| TopologyError::UnknownField {
                    component: input.source.clone(),
                    stream: input.stream.clone(),
                    field: field.clone(),
                  })
              })
              .collect::<Result<Vec<_>, _>>()?
          }
          _ => Vec::new(),
        };
        edges.push(StreamEdge {
          id: EdgeId(edges.len()),
          source: input.source.clone(),
          stream: input.stream.clone(),
          destination: c.name.clone(),
          grouping: input.grouping.clone(),
          key_indices,
        });
      }
    }

    let names: Vec<&str> = components.iter().map(|c| c.name.as_str()).collect();
    topological_order(&names, &edges)?;

    let slots: Vec<InstanceSlot> = components
      .iter()
      .flat_map(|c| {
        (0..c.parallelism).map(move |index| InstanceSlot {
          component: c.name.clone(),
          index,
        })
      })
      .collect();
    let instances = slots.len() as u32;
    if decl.workers == 0 || decl.workers > instances {
      return Err(TopologyError::InvalidWorkerCount {
        workers: decl.workers,
        instances,
      });
    }
    let assignment = placement.assign(&slots, decl.workers);
    if assignment.len() != slots.len() {
      return Err(TopologyError::InvalidPlacement {
        assigned: assignment.len(),
        instances: slots.len(),
      });
    }

    let mut tasks: BTreeMap<TaskId, TaskInstance> = BTreeMap::new();
    for (i, (slot, worker)) in slots.iter().zip(assignment).enumerate() {
      let id = TaskId(i as u32 + 1);
      let component = &mut components[component_index[&slot.component]];
      component.tasks.push(id);
      tasks.insert(
        id,
        TaskInstance {
          id,
          component: slot.component.clone(),
          index: slot.index,
          worker,
          inbound: Vec::new(),
          outbound: Vec::new(),
        },
      );
    }

    for edge in &edges {
      for task in &components[component_index[&edge.source]].tasks {
        if let Some(t) = tasks.get_mut(task) {
          t.outbound.push(edge.id);
        }
      }
      for task in &components[component_index[&edge.destination]].tasks {
        if let Some(t) = tasks.get_mut(task) {
          t.inbound.push(edge.id);
        }
      }
    }

    debug!(
      topology = %decl.name,
      components = components.len(),
      tasks = tasks.len(),
      edges = edges.len(),
      workers = decl.workers,
      "built topology graph"
    );

    Ok(Self {
      name: decl.name.clone(),
      workers: decl.workers,
      components,
      component_index,
      tasks,
      edges,
    })
  }

  /// Topology name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Number of workers.
  pub fn workers(&self) -> u32 {
    self.workers
  }

  /// Components in declaration order.
  pub fn components(&self) -> &[ComponentInfo] {
    &self.components
  }

  /// Looks up a component by name.
  pub fn component(&self, name: &str) -> Option<&ComponentInfo> {
    self.component_index.get(name).map(|&i| &self.components[i])
  }

  /// Looks up a task instance.
  pub fn task(&self, id: TaskId) -> Option<&TaskInstance> {
    self.tasks.get(&id)
  }

  /// All task instances, ordered by id.
  pub fn tasks(&self) -> impl Iterator<Item = &TaskInstance> {
    self.tasks.values()
  }

  /// Task instances hosted by `worker`.
  pub fn tasks_on(&self, worker: WorkerId) -> impl Iterator<Item = &TaskInstance> {
    self.tasks.values().filter(move |t| t.worker == worker)
  }

  /// All edges.
  pub fn edges(&self) -> &[StreamEdge] {
    &self.edges
  }

  /// Looks up an edge.
  pub fn edge(&self, id: EdgeId) -> Option<&StreamEdge> {
    self.edges.get(id.0)
  }

  /// Edges subscribed to `component:stream`.
  pub fn subscribers<'a>(
    &'a self,
    component: &'a str,
    stream: &'a str,
  ) -> impl Iterator<Item = &'a StreamEdge> + 'a {
    self
      .edges
      .iter()
      .filter(move |e| e.source == component && e.stream == stream)
  }

  /// Schema of `component:stream`.
  pub fn stream_schema(&self, component: &str, stream: &str) -> Option<&[String]> {
    self
      .component(component)
      .and_then(|c| c.streams.get(stream))
      .map(|s| s.as_slice())
  }

  /// Component names in an order where every component follows its upstreams.
  pub fn topological_order(&self) -> Vec<String> {
    let names: Vec<&str> = self.components.iter().map(|c| c.name.as_str()).collect();
    // Validated acyclic at build time.
    topological_order(&names, &self.edges).unwrap_or_default()
  }
}

/// Kahn's algorithm over component names.
///
/// Returns the components left with a non-zero in-degree as a cycle error.
fn topological_order(names: &[&str], edges: &[StreamEdge]) -> Result<Vec<String>, TopologyError> {
  let mut in_degree: HashMap<&str, usize> = names.iter().map(|n| (*n, 0)).collect();
  let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
  for edge in edges {
    adjacency
      .entry(edge.source.as_str())
      .or_default()
      .push(edge.destination.as_str());
    if let Some(d) = in_degree.get_mut(edge.destination.as_str()) {
      *d += 1;
    }
  }

  let mut queue: VecDeque<&str> = names
    .iter()
    .copied()
    .filter(|n| in_degree.get(n) == Some(&0))
    .collect();
  let mut order = Vec::with_capacity(names.len());
  while let Some(name) = queue.pop_front() {
    order.push(name.to_string());
    for next in adjacency.get(name).into_iter().flatten() {
      if let Some(d) = in_degree.get_mut(*next) {
        *d -= 1;
        if *d == 0 {
          queue.push_back(*next);
        }
      }
    }
  }

  if order.len() != names.len() {
    let cycle = names
      .iter()
      .filter(|n| in_degree.get(*n).is_some_and(|d| *d > 0))
      .map(|n| n.to_string())
      .collect();
    return Err(TopologyError::Cycle(cycle));
  }
  Ok(order)
}
