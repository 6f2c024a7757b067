//! Emission collectors handed to user logic.

use crate::tuple::{DEFAULT_STREAM, Emission, IdGenerator, RootId, TaskId, Tuple, TupleId, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Collects the emissions of one `next_tuple` call.
///
/// Every emission starts a new root. Its id is returned so the spout can
/// match the later `ack` / `fail` callback against its own bookkeeping.
pub struct SpoutOutput {
  ids: Arc<IdGenerator>,
  tracking: bool,
  emitted: Vec<(RootId, Emission)>,
}

impl SpoutOutput {
  pub(crate) fn new(ids: Arc<IdGenerator>, tracking: bool) -> Self {
    Self {
      ids,
      tracking,
      emitted: Vec::new(),
    }
  }

  /// Emits on the default stream.
  pub fn emit(&mut self, values: Vec<Value>) -> RootId {
    self.emit_to(DEFAULT_STREAM, values)
  }

  /// Emits on `stream`.
  pub fn emit_to(&mut self, stream: &str, values: Vec<Value>) -> RootId {
    self.push(Emission::new(stream, values))
  }

  /// Emits on a direct-grouped `stream` to `task`.
  pub fn emit_direct(&mut self, stream: &str, task: TaskId, values: Vec<Value>) -> RootId {
    self.push(Emission::new(stream, values).direct_to(task))
  }

  /// Number of emissions collected so far in this call.
  pub fn len(&self) -> usize {
    self.emitted.len()
  }

  /// True if nothing was emitted in this call.
  pub fn is_empty(&self) -> bool {
    self.emitted.is_empty()
  }

  fn push(&mut self, emission: Emission) -> RootId {
    let root = RootId::from(self.ids.next_id());
    let emission = if self.tracking {
      emission.anchored([root])
    } else {
      emission
    };
    self.emitted.push((root, emission));
    root
  }

  pub(crate) fn take(&mut self) -> Vec<(RootId, Emission)> {
    std::mem::take(&mut self.emitted)
  }
}

/// Everything a bolt produced while handling one input.
#[derive(Debug, Default)]
pub(crate) struct BoltBatch {
  pub(crate) emissions: Vec<Emission>,
  pub(crate) acks: Vec<(TupleId, BTreeSet<RootId>)>,
  pub(crate) fails: Vec<BTreeSet<RootId>>,
}

/// Collects the emissions of one `execute` call.
///
/// Plain `emit*` calls are anchored on the current input: the emitted tuple
/// joins every ack tree the input belongs to.
#[derive(Debug, Default)]
pub struct BoltOutput {
  anchors: BTreeSet<RootId>,
  batch: BoltBatch,
}

impl BoltOutput {
  /// Emits on the default stream, anchored on the input.
  pub fn emit(&mut self, values: Vec<Value>) {
    self.emit_to(DEFAULT_STREAM, values);
  }

  /// Emits on `stream`, anchored on the input.
  pub fn emit_to(&mut self, stream: &str, values: Vec<Value>) {
    let emission = Emission::new(stream, values).anchored(self.anchors.iter().copied());
    self.batch.emissions.push(emission);
  }

  /// Emits on a direct-grouped `stream` to `task`, anchored on the input.
  pub fn emit_direct(&mut self, stream: &str, task: TaskId, values: Vec<Value>) {
    let emission = Emission::new(stream, values)
      .anchored(self.anchors.iter().copied())
      .direct_to(task);
    self.batch.emissions.push(emission);
  }

  /// Emits on `stream` anchored on the given tuples instead of the input.
  pub fn emit_anchored(&mut self, stream: &str, anchors: &[&Tuple], values: Vec<Value>) {
    let roots = anchors.iter().flat_map(|t| t.roots.iter().copied());
    self
      .batch
      .emissions
      .push(Emission::new(stream, values).anchored(roots));
  }

  /// Emits on `stream` outside any ack tree.
  pub fn emit_unanchored(&mut self, stream: &str, values: Vec<Value>) {
    self.batch.emissions.push(Emission::new(stream, values));
  }

  /// Acks a tuple held from an earlier `execute` returning [`Defer`](super::AckDecision::Defer).
  pub fn ack(&mut self, tuple: &Tuple) {
    if tuple.is_tracked() {
      self.batch.acks.push((tuple.id, tuple.roots.clone()));
    }
  }

  /// Fails a tuple held from an earlier `execute`.
  pub fn fail(&mut self, tuple: &Tuple) {
    if tuple.is_tracked() {
      self.batch.fails.push(tuple.roots.clone());
    }
  }

  pub(crate) fn begin(&mut self, input: &Tuple) {
    self.anchors.clone_from(&input.roots);
  }

  pub(crate) fn take(&mut self) -> BoltBatch {
    std::mem::take(&mut self.batch)
  }
}
