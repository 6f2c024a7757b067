//! # Topology Declaration
//!
//! The consumed description of a topology: components (spouts and bolts) with
//! their parallelism, output stream schemas and per-component config, and the
//! inputs each bolt subscribes to with a grouping.
//!
//! Declarations can be assembled in code with the fluent builders below or
//! deserialized from JSON. Custom groupings carry code and therefore exist only
//! in code-built declarations.
//!
//! ```rust
//! use tupleflow::topology::{ComponentDeclaration, Grouping, TopologyDeclaration};
//!
//! let decl = TopologyDeclaration::new("multi_stream")
//!   .with_component(
//!     ComponentDeclaration::spout("spout", 2)
//!       .with_stream("default", ["word"])
//!       .with_stream("error", ["message"]),
//!   )
//!   .with_component(
//!     ComponentDeclaration::bolt("count", 2).with_input("spout", Grouping::fields(["word"])),
//!   )
//!   .with_component(
//!     ComponentDeclaration::bolt("aggregate", 1)
//!       .with_input("spout", Grouping::All)
//!       .with_stream_input("spout", "error", Grouping::All),
//!   );
//! assert_eq!(decl.components.len(), 3);
//! ```

use crate::config::option_duration_ms;
use crate::tuple::{DEFAULT_STREAM, TaskId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Whether a component originates tuples or processes them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
  /// Source of root tuples.
  Spout,
  /// Consumer of tuples, optionally emitting derived tuples.
  Bolt,
}

/// User-defined routing for a custom grouping.
pub trait CustomGrouping: Send + Sync {
  /// Chooses destinations among the live `targets` (sorted by task id).
  ///
  /// Returning a task outside `targets` is a routing error.
  fn choose_tasks(&self, values: &[Value], targets: &[TaskId]) -> Vec<TaskId>;
}

impl<F> CustomGrouping for F
where
  F: Fn(&[Value], &[TaskId]) -> Vec<TaskId> + Send + Sync,
{
  fn choose_tasks(&self, values: &[Value], targets: &[TaskId]) -> Vec<TaskId> {
    self(values, targets)
  }
}

/// Policy deciding which destination instance(s) receive an emitted tuple.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "fields", rename_all = "snake_case")]
pub enum Grouping {
  /// Even distribution over live instances.
  Shuffle,
  /// Hash partitioning on the named fields.
  Fields(Vec<String>),
  /// Every live instance receives a copy.
  All,
  /// User-defined selection.
  #[serde(skip)]
  Custom(Arc<dyn CustomGrouping>),
  /// The emitter names the destination task.
  Direct,
  /// Prefer instances on the emitter's worker, else shuffle.
  LocalOrShuffle,
  /// No preference; routed as shuffle.
  None,
}

impl Grouping {
  /// Fields grouping on the given names.
  pub fn fields<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Grouping::Fields(fields.into_iter().map(Into::into).collect())
  }

  /// Custom grouping from a closure or [`CustomGrouping`] implementation.
  pub fn custom<G: CustomGrouping + 'static>(grouping: G) -> Self {
    Grouping::Custom(Arc::new(grouping))
  }
}

impl fmt::Debug for Grouping {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Grouping::Shuffle => write!(f, "Shuffle"),
      Grouping::Fields(fields) => write!(f, "Fields({:?})", fields),
      Grouping::All => write!(f, "All"),
      Grouping::Custom(_) => write!(f, "Custom"),
      Grouping::Direct => write!(f, "Direct"),
      Grouping::LocalOrShuffle => write!(f, "LocalOrShuffle"),
      Grouping::None => write!(f, "None"),
    }
  }
}

/// An output stream and its field schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDeclaration {
  /// Stream name.
  pub name: String,
  /// Field names, positionally matching emitted values.
  pub fields: Vec<String>,
}

/// Per-component configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
  /// Interval at which a bolt receives tick tuples.
  #[serde(rename = "tick_interval_ms", with = "option_duration_ms")]
  pub tick_interval: Option<Duration>,
  /// Overrides the topology-wide max spout pending for this spout.
  pub max_spout_pending: Option<usize>,
  /// Free-form settings handed to user logic.
  pub settings: BTreeMap<String, String>,
}

/// A bolt's subscription to one stream of an upstream component.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputDeclaration {
  /// Upstream component.
  pub source: String,
  /// Upstream stream.
  pub stream: String,
  /// Grouping applied to the edge.
  pub grouping: Grouping,
}

/// A spout or bolt and its parallelism.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentDeclaration {
  /// Unique component name.
  pub name: String,
  /// Spout or bolt.
  pub kind: ComponentKind,
  /// Number of task instances.
  pub parallelism: u32,
  /// Declared output streams. Empty means a single schema-less default stream.
  #[serde(default)]
  pub streams: Vec<StreamDeclaration>,
  /// Subscriptions (bolts only).
  #[serde(default)]
  pub inputs: Vec<InputDeclaration>,
  /// Component configuration.
  #[serde(default)]
  pub config: ComponentConfig,
}

impl ComponentDeclaration {
  fn new(name: impl Into<String>, kind: ComponentKind, parallelism: u32) -> Self {
    Self {
      name: name.into(),
      kind,
      parallelism,
      streams: Vec::new(),
      inputs: Vec::new(),
      config: ComponentConfig::default(),
    }
  }

  /// Declares a spout.
  pub fn spout(name: impl Into<String>, parallelism: u32) -> Self {
    Self::new(name, ComponentKind::Spout, parallelism)
  }

  /// Declares a bolt.
  pub fn bolt(name: impl Into<String>, parallelism: u32) -> Self {
    Self::new(name, ComponentKind::Bolt, parallelism)
  }

  /// Declares an output stream with its field names.
  pub fn with_stream<I, S>(mut self, name: impl Into<String>, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.streams.push(StreamDeclaration {
      name: name.into(),
      fields: fields.into_iter().map(Into::into).collect(),
    });
    self
  }

  /// Subscribes to the default stream of `source`.
  pub fn with_input(self, source: impl Into<String>, grouping: Grouping) -> Self {
    self.with_stream_input(source, DEFAULT_STREAM, grouping)
  }

  /// Subscribes to a named stream of `source`.
  pub fn with_stream_input(
    mut self,
    source: impl Into<String>,
    stream: impl Into<String>,
    grouping: Grouping,
  ) -> Self {
    self.inputs.push(InputDeclaration {
      source: source.into(),
      stream: stream.into(),
      grouping,
    });
    self
  }

  /// Delivers tick tuples to this bolt at the given interval.
  pub fn with_tick_interval(mut self, interval: Duration) -> Self {
    self.config.tick_interval = Some(interval);
    self
  }

  /// Bounds the open roots of each instance of this spout.
  pub fn with_max_spout_pending(mut self, pending: usize) -> Self {
    self.config.max_spout_pending = Some(pending);
    self
  }

  /// Adds a free-form setting.
  pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.config.settings.insert(key.into(), value.into());
    self
  }

  /// Output streams, with the implicit default stream when none were declared.
  pub fn effective_streams(&self) -> Vec<StreamDeclaration> {
    if self.streams.is_empty() {
      vec![StreamDeclaration {
        name: DEFAULT_STREAM.to_string(),
        fields: Vec::new(),
      }]
    } else {
      self.streams.clone()
    }
  }
}

fn default_workers() -> u32 {
  1
}

/// A complete topology declaration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyDeclaration {
  /// Topology name.
  pub name: String,
  /// Number of worker processes the instances are spread over.
  #[serde(default = "default_workers")]
  pub workers: u32,
  /// Components in declaration order.
  pub components: Vec<ComponentDeclaration>,
}

impl TopologyDeclaration {
  /// Creates an empty declaration running on one worker.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      workers: 1,
      components: Vec::new(),
    }
  }

  /// Sets the worker count.
  pub fn with_workers(mut self, workers: u32) -> Self {
    self.workers = workers;
    self
  }

  /// Appends a component.
  pub fn with_component(mut self, component: ComponentDeclaration) -> Self {
    self.components.push(component);
    self
  }

  /// Parses a JSON declaration.
  pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }
}
