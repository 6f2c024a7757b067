//! Bookkeeping for one root's acknowledgment tree.

use crate::tuple::{RootId, TaskId, TupleId};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Pending, acked and early-acked delivery ids of one root.
///
/// `early` holds acks that overtook the registration of their id, which
/// happens when the registering and the acking task live on different
/// workers. A tree is complete once both `pending` and `early` are empty.
#[derive(Debug)]
pub(crate) struct AckTree {
  pub(crate) root: RootId,
  pub(crate) spout_task: TaskId,
  pub(crate) expected: usize,
  pub(crate) acked: usize,
  pending: HashSet<TupleId>,
  done: HashSet<TupleId>,
  early: HashSet<TupleId>,
  pub(crate) created: Instant,
  pub(crate) deadline: Instant,
}

impl AckTree {
  /// A tree whose only pending unit is the root emission itself.
  pub(crate) fn new(root: RootId, spout_task: TaskId, now: Instant, timeout: Duration) -> Self {
    let mut pending = HashSet::new();
    pending.insert(root.as_tuple_id());
    Self {
      root,
      spout_task,
      expected: 1,
      acked: 0,
      pending,
      done: HashSet::new(),
      early: HashSet::new(),
      created: now,
      deadline: now + timeout,
    }
  }

  pub(crate) fn register(&mut self, children: &[TupleId]) {
    for id in children {
      if self.done.contains(id) || self.pending.contains(id) {
        continue;
      }
      self.expected += 1;
      if self.early.remove(id) {
        self.done.insert(*id);
        self.acked += 1;
      } else {
        self.pending.insert(*id);
      }
    }
  }

  /// Credits one delivery. Repeated acks of the same id are ignored.
  pub(crate) fn ack(&mut self, id: TupleId) {
    if self.pending.remove(&id) {
      self.done.insert(id);
      self.acked += 1;
    } else if !self.done.contains(&id) {
      self.early.insert(id);
    }
  }

  pub(crate) fn is_complete(&self) -> bool {
    self.pending.is_empty() && self.early.is_empty()
  }

  pub(crate) fn is_expired(&self, now: Instant) -> bool {
    now >= self.deadline
  }

  pub(crate) fn pending(&self) -> usize {
    self.pending.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tree() -> AckTree {
    AckTree::new(RootId(1), TaskId(1), Instant::now(), Duration::from_secs(30))
  }

  #[test]
  fn root_unit_pending_at_creation() {
    let mut t = tree();
    assert_eq!(t.expected, 1);
    assert!(!t.is_complete());
    t.ack(TupleId(1));
    assert!(t.is_complete());
    assert_eq!(t.acked, t.expected);
  }

  #[test]
  fn duplicate_ack_counted_once() {
    let mut t = tree();
    t.register(&[TupleId(2), TupleId(3)]);
    t.ack(TupleId(1));
    t.ack(TupleId(2));
    t.ack(TupleId(2));
    assert_eq!(t.acked, 2);
    assert_eq!(t.pending(), 1);
    assert!(!t.is_complete());
  }

  #[test]
  fn early_ack_reconciled_on_register() {
    let mut t = tree();
    t.ack(TupleId(7));
    t.ack(TupleId(1));
    assert!(!t.is_complete());
    t.register(&[TupleId(7)]);
    assert!(t.is_complete());
    assert_eq!(t.expected, 2);
    assert_eq!(t.acked, 2);
  }

  #[test]
  fn deadline_from_timeout() {
    let now = Instant::now();
    let t = AckTree::new(RootId(1), TaskId(1), now, Duration::from_millis(10));
    assert!(!t.is_expired(now));
    assert!(t.is_expired(now + Duration::from_millis(10)));
  }
}
