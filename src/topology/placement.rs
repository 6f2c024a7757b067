//! Assignment of task instances to worker processes.
//!
//! Placement proper belongs to an external scheduler; the core only needs to
//! know which worker hosts each task to choose between an in-memory handoff
//! and a network send. [`RoundRobinPlacement`] deals instances onto workers in
//! declaration order, one at a time.

use crate::tuple::WorkerId;

/// One task instance awaiting placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSlot {
  /// Component name.
  pub component: String,
  /// Index of the instance within its component.
  pub index: u32,
}

/// Assigns task instances to workers.
pub trait Placement: Send + Sync {
  /// Returns one worker per slot, in slot order.
  fn assign(&self, slots: &[InstanceSlot], workers: u32) -> Vec<WorkerId>;
}

/// Deals instances onto workers in turn.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundRobinPlacement;

impl Placement for RoundRobinPlacement {
  fn assign(&self, slots: &[InstanceSlot], workers: u32) -> Vec<WorkerId> {
    if workers == 0 {
      return Vec::new();
    }
    (0..slots.len())
      .map(|i| WorkerId(i as u32 % workers))
      .collect()
  }
}
