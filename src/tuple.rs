//! # Tuples and Identities
//!
//! The atomic unit of streamed data plus its lineage. Every tuple carries the
//! set of root ids it descends from so that acknowledgments can be credited to
//! the right ack trees, wherever the tuple ends up being processed.
//!
//! Identifiers are allocated by an [`IdGenerator`] owned by the worker process.
//! The owning worker is encoded in the high bits of every id, which lets any
//! process find the worker that tracks a given root without a lookup table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

/// Name of the stream a component emits on when no stream is named.
pub const DEFAULT_STREAM: &str = "default";

/// Name of the system stream carrying tick tuples.
pub const TICK_STREAM: &str = "__tick";

/// Number of low bits of an id reserved for the per-worker sequence.
const SEQUENCE_BITS: u32 = 40;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Global identifier of a task instance within a topology.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "task-{}", self.0)
  }
}

/// Identifier of a worker process hosting task instances.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "worker-{}", self.0)
  }
}

/// Identifier of one delivered tuple copy.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct TupleId(pub u64);

impl TupleId {
  /// Worker whose generator allocated this id.
  pub fn owner(self) -> WorkerId {
    WorkerId((self.0 >> SEQUENCE_BITS) as u32)
  }
}

impl fmt::Display for TupleId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:x}", self.0)
  }
}

/// Identifier of a root tuple, and therefore of its ack tree.
///
/// A root id is the tuple id the spout's emission was allocated, so the root
/// tuple itself is the first pending unit of its own tree.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct RootId(pub u64);

impl RootId {
  /// Worker that owns (tracks) this root's ack tree.
  pub fn owner(self) -> WorkerId {
    TupleId(self.0).owner()
  }

  /// The tuple id of the root emission itself.
  pub fn as_tuple_id(self) -> TupleId {
    TupleId(self.0)
  }
}

impl From<TupleId> for RootId {
  fn from(id: TupleId) -> Self {
    RootId(id.0)
  }
}

impl fmt::Display for RootId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "root-{:x}", self.0)
  }
}

/// Allocates tuple ids unique across the topology.
///
/// The worker id occupies the high bits, a monotonically increasing sequence
/// the low 40 bits.
#[derive(Debug)]
pub struct IdGenerator {
  worker: WorkerId,
  sequence: AtomicU64,
}

impl IdGenerator {
  /// Creates a generator for the given worker.
  pub fn new(worker: WorkerId) -> Self {
    Self {
      worker,
      sequence: AtomicU64::new(1),
    }
  }

  /// Worker this generator allocates for.
  pub fn worker(&self) -> WorkerId {
    self.worker
  }

  /// Allocates the next tuple id.
  pub fn next_id(&self) -> TupleId {
    let seq = self.sequence.fetch_add(1, Ordering::Relaxed) & SEQUENCE_MASK;
    TupleId(((self.worker.0 as u64) << SEQUENCE_BITS) | seq)
  }
}

/// A single field value carried by a tuple.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
  /// Absent value.
  Null,
  /// Boolean value.
  Bool(bool),
  /// Signed integer value.
  Int(i64),
  /// Floating point value.
  Float(#[serde(with = "float_repr")] f64),
  /// UTF-8 string value.
  Str(String),
  /// Raw bytes.
  Bytes(Vec<u8>),
}

impl Value {
  /// Feeds a platform-independent representation of this value into
  /// `state`.
  ///
  /// Every variant is prefixed by a tag byte so that `Int(0)` and
  /// `Bool(false)` land in different buckets. Numbers are written as
  /// little-endian bytes and floats are canonicalized first: `-0.0` hashes
  /// as `0.0` and every NaN hashes alike.
  pub fn stable_hash<H: Hasher>(&self, state: &mut H) {
    match self {
      Value::Null => state.write_u8(0),
      Value::Bool(b) => {
        state.write_u8(1);
        state.write_u8(u8::from(*b));
      }
      Value::Int(i) => {
        state.write_u8(2);
        state.write(&i.to_le_bytes());
      }
      Value::Float(f) => {
        state.write_u8(3);
        let canonical = if f.is_nan() {
          f64::NAN
        } else if *f == 0.0 {
          0.0
        } else {
          *f
        };
        state.write(&canonical.to_bits().to_le_bytes());
      }
      Value::Str(s) => {
        state.write_u8(4);
        write_prefixed(state, s.as_bytes());
      }
      Value::Bytes(b) => {
        state.write_u8(5);
        write_prefixed(state, b);
      }
    }
  }

  /// Returns the string slice if this is a `Str` value.
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s),
      _ => None,
    }
  }

  /// Returns the integer if this is an `Int` value.
  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      _ => None,
    }
  }
}

fn write_prefixed<H: Hasher>(state: &mut H, bytes: &[u8]) {
  state.write(&(bytes.len() as u64).to_le_bytes());
  state.write(bytes);
}

/// Finite floats travel as JSON numbers, the rest as `"NaN"`, `"inf"` or
/// `"-inf"`: JSON has no literal for them.
mod float_repr {
  use serde::de::Error;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(f: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if f.is_finite() {
      serializer.serialize_f64(*f)
    } else if f.is_nan() {
      serializer.serialize_str("NaN")
    } else if f.is_sign_positive() {
      serializer.serialize_str("inf")
    } else {
      serializer.serialize_str("-inf")
    }
  }

  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Repr {
    Number(f64),
    Text(String),
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Repr::deserialize(deserializer)? {
      Repr::Number(f) => Ok(f),
      Repr::Text(text) => match text.as_str() {
        "NaN" => Ok(f64::NAN),
        "inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        other => Err(D::Error::custom(format!("invalid float {other:?}"))),
      },
    }
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::Str(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::Str(s)
  }
}

impl From<i64> for Value {
  fn from(i: i64) -> Self {
    Value::Int(i)
  }
}

impl From<i32> for Value {
  fn from(i: i32) -> Self {
    Value::Int(i as i64)
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<f64> for Value {
  fn from(f: f64) -> Self {
    Value::Float(f)
  }
}

impl From<Vec<u8>> for Value {
  fn from(b: Vec<u8>) -> Self {
    Value::Bytes(b)
  }
}

/// A delivered tuple: values plus lineage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
  /// Id of this delivered copy.
  pub id: TupleId,
  /// Task that emitted the tuple.
  pub source_task: TaskId,
  /// Stream the tuple was emitted on.
  pub stream: String,
  /// Field values, positionally matching the stream schema.
  pub values: Vec<Value>,
  /// Every root this tuple descends from. Empty for untracked tuples.
  pub roots: BTreeSet<RootId>,
}

impl Tuple {
  /// Returns the value at `index`.
  pub fn value(&self, index: usize) -> Option<&Value> {
    self.values.get(index)
  }

  /// True for system tick tuples.
  pub fn is_tick(&self) -> bool {
    self.stream == TICK_STREAM
  }

  /// True when the tuple takes part in acking.
  pub fn is_tracked(&self) -> bool {
    !self.roots.is_empty()
  }
}

/// A tuple the user logic asked to emit, before routing.
#[derive(Clone, Debug, PartialEq)]
pub struct Emission {
  /// Stream to emit on.
  pub stream: String,
  /// Field values.
  pub values: Vec<Value>,
  /// Roots inherited from the anchors (or the new root, for spouts).
  pub roots: BTreeSet<RootId>,
  /// Explicit destination for direct-grouped edges.
  pub direct: Option<TaskId>,
}

impl Emission {
  /// Creates an emission on `stream` with no lineage.
  pub fn new(stream: impl Into<String>, values: Vec<Value>) -> Self {
    Self {
      stream: stream.into(),
      values,
      roots: BTreeSet::new(),
      direct: None,
    }
  }

  /// Anchors the emission on the given roots.
  pub fn anchored(mut self, roots: impl IntoIterator<Item = RootId>) -> Self {
    self.roots.extend(roots);
    self
  }

  /// Names the destination task for direct groupings.
  pub fn direct_to(mut self, task: TaskId) -> Self {
    self.direct = Some(task);
    self
  }
}
