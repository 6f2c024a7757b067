//! # Ack Tracker Test Suite
//!
//! Tree completion, failure, timeouts and the exactly-once outcome guarantee.

use super::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use tokio::sync::mpsc::error::TryRecvError;

const SPOUT: TaskId = TaskId(1);

fn roots(root: RootId) -> BTreeSet<RootId> {
  BTreeSet::from([root])
}

/// Opens `root` and plays the spout's side: one copy routed to X, root acked.
fn open_with_first_hop(tracker: &AckTracker, root: RootId, x: TupleId) {
  tracker.register_root(root, SPOUT);
  tracker.register_children(root, &[x]);
  tracker.ack(root.as_tuple_id(), &roots(root));
}

// ============================================================================
// Success and failure
// ============================================================================

#[test]
fn test_success_after_every_descendant_acked() {
  let tracker = AckTracker::new(Duration::from_secs(30));
  let mut outcomes = tracker.subscribe(SPOUT);
  let root = RootId(100);
  let (x, b, c) = (TupleId(101), TupleId(102), TupleId(103));

  open_with_first_hop(&tracker, root, x);
  // X emits B and C anchored on its input, then acks the input.
  tracker.register_children(root, &[b, c]);
  tracker.ack(x, &roots(root));
  assert!(tracker.is_open(root));

  tracker.ack(b, &roots(root));
  assert_eq!(outcomes.try_recv(), Err(TryRecvError::Empty));
  tracker.ack(c, &roots(root));

  assert_eq!(outcomes.try_recv(), Ok(AckOutcome::Succeeded { root }));
  assert_eq!(outcomes.try_recv(), Err(TryRecvError::Empty));
  assert_eq!(tracker.in_flight(), 0);
}

#[test]
fn test_fail_is_terminal_and_late_acks_are_ignored() {
  let tracker = AckTracker::new(Duration::from_secs(30));
  let mut outcomes = tracker.subscribe(SPOUT);
  let root = RootId(200);
  let (x, b, c) = (TupleId(201), TupleId(202), TupleId(203));

  open_with_first_hop(&tracker, root, x);
  tracker.register_children(root, &[b, c]);
  tracker.ack(x, &roots(root));

  tracker.fail(&roots(root), FailureReason::Explicit);
  assert_eq!(
    outcomes.try_recv(),
    Ok(AckOutcome::Failed {
      root,
      reason: FailureReason::Explicit
    })
  );

  tracker.ack(b, &roots(root));
  tracker.ack(c, &roots(root));
  tracker.fail(&roots(root), FailureReason::Explicit);
  assert_eq!(outcomes.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn test_root_with_no_downstream_completes_on_root_ack() {
  let tracker = AckTracker::new(Duration::from_secs(30));
  let mut outcomes = tracker.subscribe(SPOUT);
  let root = RootId(5);
  tracker.register_root(root, SPOUT);
  tracker.ack(root.as_tuple_id(), &roots(root));
  assert_eq!(outcomes.try_recv(), Ok(AckOutcome::Succeeded { root }));
}

#[test]
fn test_duplicate_ack_does_not_complete_early() {
  let tracker = AckTracker::new(Duration::from_secs(30));
  let mut outcomes = tracker.subscribe(SPOUT);
  let root = RootId(300);
  let (x, b, c) = (TupleId(301), TupleId(302), TupleId(303));
  open_with_first_hop(&tracker, root, x);
  tracker.register_children(root, &[b, c]);
  tracker.ack(x, &roots(root));
  tracker.ack(b, &roots(root));
  tracker.ack(b, &roots(root));
  assert_eq!(outcomes.try_recv(), Err(TryRecvError::Empty));
  assert!(tracker.is_open(root));
}

#[test]
fn test_ack_overtaking_registration() {
  let tracker = AckTracker::new(Duration::from_secs(30));
  let mut outcomes = tracker.subscribe(SPOUT);
  let root = RootId(400);
  let (x, b) = (TupleId(401), TupleId(402));
  open_with_first_hop(&tracker, root, x);

  // B's ack arrives from another worker before X's registration of B.
  tracker.ack(b, &roots(root));
  assert_eq!(outcomes.try_recv(), Err(TryRecvError::Empty));
  tracker.register_children(root, &[b]);
  tracker.ack(x, &roots(root));
  assert_eq!(outcomes.try_recv(), Ok(AckOutcome::Succeeded { root }));
}

#[test]
fn test_tuple_with_multiple_roots_credits_each_tree() {
  let tracker = AckTracker::new(Duration::from_secs(30));
  let mut outcomes = tracker.subscribe(SPOUT);
  let (r1, r2) = (RootId(1), RootId(2));
  tracker.register_root(r1, SPOUT);
  tracker.register_root(r2, SPOUT);
  let joined = TupleId(10);
  tracker.register_children(r1, &[joined]);
  tracker.register_children(r2, &[joined]);
  tracker.ack(r1.as_tuple_id(), &roots(r1));
  tracker.ack(r2.as_tuple_id(), &roots(r2));
  tracker.ack(joined, &BTreeSet::from([r1, r2]));
  let mut done = vec![outcomes.try_recv().unwrap(), outcomes.try_recv().unwrap()];
  done.sort_by_key(|o| o.root());
  assert_eq!(
    done,
    vec![
      AckOutcome::Succeeded { root: r1 },
      AckOutcome::Succeeded { root: r2 }
    ]
  );
}

#[test]
fn test_outcomes_routed_to_originating_spout() {
  let tracker = AckTracker::new(Duration::from_secs(30));
  let mut first = tracker.subscribe(TaskId(1));
  let mut second = tracker.subscribe(TaskId(2));
  tracker.register_root(RootId(1), TaskId(2));
  tracker.ack(TupleId(1), &roots(RootId(1)));
  assert_eq!(first.try_recv(), Err(TryRecvError::Empty));
  assert_eq!(second.try_recv(), Ok(AckOutcome::Succeeded { root: RootId(1) }));
}

// ============================================================================
// Timeouts and shutdown
// ============================================================================

#[test]
fn test_sweep_fails_expired_trees_only() {
  let tracker = AckTracker::new(Duration::from_millis(100));
  let mut outcomes = tracker.subscribe(SPOUT);
  let start = Instant::now();
  tracker.register_root_at(RootId(1), SPOUT, start);
  tracker.register_root_at(RootId(2), SPOUT, start + Duration::from_millis(80));

  assert_eq!(tracker.sweep_expired(start + Duration::from_millis(50)), 0);
  assert_eq!(tracker.sweep_expired(start + Duration::from_millis(100)), 1);
  assert_eq!(
    outcomes.try_recv(),
    Ok(AckOutcome::Failed {
      root: RootId(1),
      reason: FailureReason::Timeout
    })
  );
  assert!(tracker.is_open(RootId(2)));

  // A late ack of the timed-out tree is a no-op.
  tracker.ack(TupleId(1), &roots(RootId(1)));
  assert_eq!(outcomes.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn test_fail_all_flushes_every_tree() {
  let tracker = AckTracker::new(Duration::from_secs(30));
  let mut outcomes = tracker.subscribe(SPOUT);
  for i in 1..=3 {
    tracker.register_root(RootId(i), SPOUT);
  }
  assert_eq!(tracker.fail_all(FailureReason::Shutdown), 3);
  assert_eq!(tracker.in_flight(), 0);
  for _ in 0..3 {
    assert!(matches!(
      outcomes.try_recv(),
      Ok(AckOutcome::Failed {
        reason: FailureReason::Shutdown,
        ..
      })
    ));
  }
  assert_eq!(tracker.fail_all(FailureReason::Shutdown), 0);
}

#[tokio::test]
async fn test_sweeper_fails_on_interval() {
  let tracker = Arc::new(AckTracker::new(Duration::from_millis(50)));
  let mut outcomes = tracker.subscribe(SPOUT);
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  tracker.register_root(RootId(9), SPOUT);
  let sweeper = tracker.spawn_sweeper(Duration::from_millis(10), shutdown_rx);

  let outcome = outcomes.recv().await.unwrap();
  assert_eq!(
    outcome,
    AckOutcome::Failed {
      root: RootId(9),
      reason: FailureReason::Timeout
    }
  );
  shutdown_tx.send(true).unwrap();
  sweeper.await.unwrap();
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
  #[test]
  fn prop_exactly_one_outcome_in_any_ack_order(
    order in Just((0u64..12).collect::<Vec<_>>()).prop_shuffle()
  ) {
    let tracker = AckTracker::new(Duration::from_secs(30));
    let mut outcomes = tracker.subscribe(SPOUT);
    let root = RootId(1_000);
    let children: Vec<TupleId> = (0u64..12).map(|i| TupleId(2_000 + i)).collect();
    tracker.register_root(root, SPOUT);
    tracker.register_children(root, &children);
    tracker.ack(root.as_tuple_id(), &roots(root));

    for (n, i) in order.iter().enumerate() {
      prop_assert!(outcomes.try_recv().is_err(), "completed after {} acks", n);
      tracker.ack(children[*i as usize], &roots(root));
    }
    prop_assert_eq!(outcomes.try_recv(), Ok(AckOutcome::Succeeded { root }));
    for child in &children {
      tracker.ack(*child, &roots(root));
    }
    prop_assert!(outcomes.try_recv().is_err());
  }
}
