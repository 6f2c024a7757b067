//! # Topology Graph Test Suite
//!
//! Covers expansion of components into task instances, placement, edge
//! resolution and every rejection path of the builder.

use super::*;
use crate::error::TopologyError;
use crate::tuple::{TaskId, WorkerId};
use proptest::prelude::*;

// ============================================================================
// Fixtures
// ============================================================================

fn multi_stream(workers: u32) -> TopologyDeclaration {
  TopologyDeclaration::new("multi_stream")
    .with_workers(workers)
    .with_component(
      ComponentDeclaration::spout("spout", 2)
        .with_stream("default", ["word"])
        .with_stream("error", ["message"]),
    )
    .with_component(
      ComponentDeclaration::bolt("count", 2).with_input("spout", Grouping::fields(["word"])),
    )
    .with_component(
      ComponentDeclaration::bolt("aggregate", 1)
        .with_input("spout", Grouping::All)
        .with_stream_input("spout", "error", Grouping::All),
    )
}

// ============================================================================
// Expansion
// ============================================================================

#[test]
fn test_instances_match_parallelism() {
  let graph = TopologyGraph::build(&multi_stream(1)).unwrap();
  assert_eq!(graph.component("spout").unwrap().tasks, vec![TaskId(1), TaskId(2)]);
  assert_eq!(graph.component("count").unwrap().tasks, vec![TaskId(3), TaskId(4)]);
  assert_eq!(graph.component("aggregate").unwrap().tasks, vec![TaskId(5)]);
  assert_eq!(graph.tasks().count(), 5);
  let t4 = graph.task(TaskId(4)).unwrap();
  assert_eq!(t4.component, "count");
  assert_eq!(t4.index, 1);
}

#[test]
fn test_edges_resolved_per_stream() {
  let graph = TopologyGraph::build(&multi_stream(1)).unwrap();
  assert_eq!(graph.edges().len(), 3);
  let default_subs: Vec<&str> = graph
    .subscribers("spout", "default")
    .map(|e| e.destination.as_str())
    .collect();
  assert_eq!(default_subs, vec!["count", "aggregate"]);
  let error_subs: Vec<_> = graph.subscribers("spout", "error").collect();
  assert_eq!(error_subs.len(), 1);
  assert_eq!(error_subs[0].destination, "aggregate");
}

#[test]
fn test_fields_grouping_key_indices() {
  let decl = TopologyDeclaration::new("t")
    .with_component(ComponentDeclaration::spout("s", 1).with_stream("default", ["a", "b", "c"]))
    .with_component(ComponentDeclaration::bolt("b", 1).with_input("s", Grouping::fields(["c", "a"])));
  let graph = TopologyGraph::build(&decl).unwrap();
  assert_eq!(graph.edges()[0].key_indices, vec![2, 0]);
}

#[test]
fn test_task_edge_lists() {
  let graph = TopologyGraph::build(&multi_stream(1)).unwrap();
  let spout_task = graph.task(TaskId(1)).unwrap();
  assert_eq!(spout_task.outbound.len(), 3);
  assert!(spout_task.inbound.is_empty());
  let aggregate = graph.task(TaskId(5)).unwrap();
  assert_eq!(aggregate.inbound.len(), 2);
  assert!(aggregate.outbound.is_empty());
}

#[test]
fn test_round_robin_placement_over_workers() {
  let graph = TopologyGraph::build(&multi_stream(2)).unwrap();
  let on_zero: Vec<TaskId> = graph.tasks_on(WorkerId(0)).map(|t| t.id).collect();
  let on_one: Vec<TaskId> = graph.tasks_on(WorkerId(1)).map(|t| t.id).collect();
  assert_eq!(on_zero, vec![TaskId(1), TaskId(3), TaskId(5)]);
  assert_eq!(on_one, vec![TaskId(2), TaskId(4)]);
}

#[test]
fn test_topological_order() {
  let graph = TopologyGraph::build(&multi_stream(1)).unwrap();
  let order = graph.topological_order();
  let pos = |n: &str| order.iter().position(|c| c == n).unwrap();
  assert!(pos("spout") < pos("count"));
  assert!(pos("spout") < pos("aggregate"));
}

#[test]
fn test_implicit_default_stream() {
  let decl = TopologyDeclaration::new("t")
    .with_component(ComponentDeclaration::spout("s", 1))
    .with_component(ComponentDeclaration::bolt("b", 1).with_input("s", Grouping::Shuffle));
  let graph = TopologyGraph::build(&decl).unwrap();
  assert_eq!(graph.stream_schema("s", "default"), Some(&[][..]));
}

// ============================================================================
// Rejections
// ============================================================================

#[test]
fn test_rejects_empty() {
  let err = TopologyGraph::build(&TopologyDeclaration::new("t")).unwrap_err();
  assert_eq!(err, TopologyError::Empty);
}

#[test]
fn test_rejects_zero_parallelism() {
  let decl = TopologyDeclaration::new("t").with_component(ComponentDeclaration::spout("s", 0));
  assert!(matches!(
    TopologyGraph::build(&decl),
    Err(TopologyError::InvalidParallelism { parallelism: 0, .. })
  ));
}

#[test]
fn test_rejects_unknown_component() {
  let decl = TopologyDeclaration::new("t")
    .with_component(ComponentDeclaration::spout("s", 1))
    .with_component(ComponentDeclaration::bolt("b", 1).with_input("missing", Grouping::Shuffle));
  assert_eq!(
    TopologyGraph::build(&decl).unwrap_err(),
    TopologyError::UnknownComponent {
      referenced: "missing".into(),
      destination: "b".into(),
    }
  );
}

#[test]
fn test_rejects_unknown_stream() {
  let decl = TopologyDeclaration::new("t")
    .with_component(ComponentDeclaration::spout("s", 1).with_stream("default", ["x"]))
    .with_component(ComponentDeclaration::bolt("b", 1).with_stream_input("s", "error", Grouping::All));
  assert!(matches!(
    TopologyGraph::build(&decl),
    Err(TopologyError::UnknownStream { .. })
  ));
}

#[test]
fn test_rejects_unknown_grouping_field() {
  let decl = TopologyDeclaration::new("t")
    .with_component(ComponentDeclaration::spout("s", 1).with_stream("default", ["word"]))
    .with_component(ComponentDeclaration::bolt("b", 1).with_input("s", Grouping::fields(["count"])));
  assert_eq!(
    TopologyGraph::build(&decl).unwrap_err(),
    TopologyError::UnknownField {
      component: "s".into(),
      stream: "default".into(),
      field: "count".into(),
    }
  );
}

#[test]
fn test_rejects_empty_grouping_fields() {
  let decl = TopologyDeclaration::new("t")
    .with_component(ComponentDeclaration::spout("s", 1).with_stream("default", ["word"]))
    .with_component(
      ComponentDeclaration::bolt("b", 1).with_input("s", Grouping::Fields(Vec::new())),
    );
  assert!(matches!(
    TopologyGraph::build(&decl),
    Err(TopologyError::EmptyGroupingFields { .. })
  ));
}

#[test]
fn test_rejects_duplicate_component() {
  let decl = TopologyDeclaration::new("t")
    .with_component(ComponentDeclaration::spout("s", 1))
    .with_component(ComponentDeclaration::bolt("s", 1));
  assert_eq!(
    TopologyGraph::build(&decl).unwrap_err(),
    TopologyError::DuplicateComponent("s".into())
  );
}

#[test]
fn test_rejects_spout_inputs() {
  let decl = TopologyDeclaration::new("t")
    .with_component(ComponentDeclaration::spout("a", 1))
    .with_component(ComponentDeclaration::spout("b", 1).with_input("a", Grouping::Shuffle));
  assert_eq!(
    TopologyGraph::build(&decl).unwrap_err(),
    TopologyError::SpoutWithInputs("b".into())
  );
}

#[test]
fn test_rejects_cycle() {
  let decl = TopologyDeclaration::new("t")
    .with_component(ComponentDeclaration::spout("s", 1))
    .with_component(
      ComponentDeclaration::bolt("x", 1)
        .with_input("s", Grouping::Shuffle)
        .with_input("y", Grouping::Shuffle),
    )
    .with_component(ComponentDeclaration::bolt("y", 1).with_input("x", Grouping::Shuffle));
  assert_eq!(
    TopologyGraph::build(&decl).unwrap_err(),
    TopologyError::Cycle(vec!["x".into(), "y".into()])
  );
}

#[test]
fn test_rejects_self_subscription() {
  let decl = TopologyDeclaration::new("t")
    .with_component(ComponentDeclaration::spout("s", 1))
    .with_component(
      ComponentDeclaration::bolt("x", 2)
        .with_input("s", Grouping::Shuffle)
        .with_input("x", Grouping::Direct),
    );
  assert!(matches!(TopologyGraph::build(&decl), Err(TopologyError::Cycle(_))));
}

#[test]
fn test_rejects_worker_count() {
  assert!(matches!(
    TopologyGraph::build(&multi_stream(0)),
    Err(TopologyError::InvalidWorkerCount { workers: 0, .. })
  ));
  assert!(matches!(
    TopologyGraph::build(&multi_stream(6)),
    Err(TopologyError::InvalidWorkerCount { workers: 6, instances: 5 })
  ));
}

#[test]
fn test_rejects_short_placement() {
  struct Short;
  impl Placement for Short {
    fn assign(&self, _slots: &[InstanceSlot], _workers: u32) -> Vec<WorkerId> {
      vec![WorkerId(0)]
    }
  }
  assert!(matches!(
    TopologyGraph::build_with_placement(&multi_stream(1), &Short),
    Err(TopologyError::InvalidPlacement { assigned: 1, instances: 5 })
  ));
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
  #[test]
  fn prop_instance_count_equals_parallelism(parallelism in proptest::collection::vec(1u32..6, 1..5)) {
    let mut decl = TopologyDeclaration::new("p")
      .with_component(ComponentDeclaration::spout("spout", parallelism[0]));
    for (i, p) in parallelism.iter().enumerate().skip(1) {
      decl = decl.with_component(
        ComponentDeclaration::bolt(format!("bolt{}", i), *p).with_input("spout", Grouping::Shuffle),
      );
    }
    let graph = TopologyGraph::build(&decl).unwrap();
    for component in graph.components() {
      prop_assert_eq!(component.tasks.len() as u32, component.parallelism);
    }
    let total: u32 = parallelism.iter().sum();
    prop_assert_eq!(graph.tasks().count() as u32, total);
  }
}
