//! # Tuple Router
//!
//! Resolves an emission into the concrete destination task instances of
//! every edge subscribed to the emitted stream.
//!
//! A [`TupleRouter`] is owned by one executor and bound to its source task.
//! Grouping policies are resolved once, at construction; the live-instance
//! set is read from the shared [`RoutingTable`] on every call, so a task
//! death is honoured by the next routed tuple.
//!
//! ## Policies
//!
//! - **Shuffle / None**: round-robin per (edge, source task), starting at the
//!   source's instance index so sibling sources spread their first tuples.
//! - **Fields**: stable hash of the key values modulo the live count.
//! - **All**: one copy per live instance.
//! - **Direct**: the emitter names the task; it must be a live member of
//!   the subscribing component.
//! - **LocalOrShuffle**: round-robin over live instances on the source's
//!   worker, falling back to every live instance.
//! - **Custom**: user code chooses among the live instances.
//!
//! Every copy gets a fresh tuple id. Before the deliveries are returned, one
//! pending unit per copy is registered with the ack sink for every root the
//! emission is anchored on.

pub mod grouping;
pub mod live;


pub use live::{LiveInstances, RoutingTable};

use crate::ack::AckSink;
use crate::error::RoutingError;
use crate::router::grouping::EdgeRoute;
use crate::topology::TopologyGraph;
use crate::tuple::{Emission, IdGenerator, TaskId, Tuple, TupleId, WorkerId};
use std::sync::Arc;
use tracing::trace;

/// A routed tuple copy and its destination.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
  /// Destination task instance.
  pub destination: TaskId,
  /// The copy to deliver, with a fresh tuple id.
  pub tuple: Tuple,
}

/// Routes the emissions of one source task.
pub struct TupleRouter {
  task: TaskId,
  component: String,
  worker: WorkerId,
  graph: Arc<TopologyGraph>,
  table: Arc<RoutingTable>,
  ids: Arc<IdGenerator>,
  acker: Option<Arc<dyn AckSink>>,
  routes: Vec<EdgeRoute>,
}

impl TupleRouter {
  /// Creates a router for `task`.
  ///
  /// Without an `acker` no pending units are registered, which is how
  /// at-most-once topologies run.
  pub fn new(
    task: TaskId,
    graph: Arc<TopologyGraph>,
    table: Arc<RoutingTable>,
    ids: Arc<IdGenerator>,
    acker: Option<Arc<dyn AckSink>>,
  ) -> Self {
    let (component, worker, index, outbound) = match graph.task(task) {
      Some(t) => (t.component.clone(), t.worker, t.index as usize, t.outbound.clone()),
      None => (String::new(), ids.worker(), 0, Vec::new()),
    };
    let routes = outbound
      .iter()
      .filter_map(|id| graph.edge(*id))
      .map(|edge| EdgeRoute::new(edge, index))
      .collect();
    Self {
      task,
      component,
      worker,
      graph,
      table,
      ids,
      acker,
      routes,
    }
  }

  /// Source task of this router.
  pub fn task(&self) -> TaskId {
    self.task
  }

  /// Component of the source task.
  pub fn component(&self) -> &str {
    &self.component
  }

  /// Resolves `emission` to one delivery per destination copy.
  ///
  /// An emission on a stream nobody subscribes to yields no deliveries. On
  /// error nothing is registered with the ack sink.
  pub fn route(&mut self, emission: &Emission) -> Result<Vec<Delivery>, RoutingError> {
    let schema = self
      .graph
      .stream_schema(&self.component, &emission.stream)
      .ok_or_else(|| RoutingError::UnknownStream {
        component: self.component.clone(),
        stream: emission.stream.clone(),
      })?;
    if !schema.is_empty() && schema.len() != emission.values.len() {
      return Err(RoutingError::ArityMismatch {
        stream: emission.stream.clone(),
        expected: schema.len(),
        actual: emission.values.len(),
      });
    }

    let snapshot = self.table.snapshot();
    let mut targets: Vec<TaskId> = Vec::new();
    for route in self.routes.iter_mut().filter(|r| r.stream == emission.stream) {
      route.select(emission, &snapshot, &self.graph, self.worker, &mut targets)?;
    }

    let deliveries: Vec<Delivery> = targets
      .into_iter()
      .map(|destination| Delivery {
        destination,
        tuple: Tuple {
          id: self.ids.next_id(),
          source_task: self.task,
          stream: emission.stream.clone(),
          values: emission.values.clone(),
          roots: emission.roots.clone(),
        },
      })
      .collect();

    if let Some(acker) = &self.acker {
      if !emission.roots.is_empty() && !deliveries.is_empty() {
        let ids: Vec<TupleId> = deliveries.iter().map(|d| d.tuple.id).collect();
        for root in &emission.roots {
          acker.register_children(*root, &ids);
        }
      }
    }

    trace!(
      task = %self.task,
      stream = %emission.stream,
      copies = deliveries.len(),
      generation = snapshot.generation(),
      "routed emission"
    );
    Ok(deliveries)
  }
}
