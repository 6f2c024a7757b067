//! # Backpressure Controller
//!
//! Tracks the depth of every link (a local inbound queue or a remote worker
//! channel) and pauses the producers feeding a link once it fills up.
//!
//! ## Hysteresis
//!
//! A link pauses when its depth reaches the high watermark and resumes only
//! once it drains to the low watermark. Between the two marks the state does
//! not change, so a link hovering around one mark does not flap.
//!
//! ## Signalling
//!
//! Each link owns a `watch` channel carrying its paused flag. Producers await
//! [`BackpressureController::wait_until_resumed`] before handing a tuple to a
//! paused link; nothing is ever dropped. Every transition is also published
//! on a broadcast channel for observers, logged and counted in metrics.
//!
//! Cascading needs no extra machinery: an executor with a paused outbound
//! link stops draining its own inbound queue, which then fills and pauses the
//! executor's upstream in turn.


use crate::config::TopologyConfig;
use crate::error::ConfigError;
use crate::metrics;
use crate::tuple::{TaskId, WorkerId};
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// A queue whose depth is tracked.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum LinkId {
  /// Inbound queue of a local task.
  Task(TaskId),
  /// Outbound channel to a remote worker.
  Worker(WorkerId),
}

impl fmt::Display for LinkId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LinkId::Task(task) => write!(f, "{}", task),
      LinkId::Worker(worker) => write!(f, "{}", worker),
    }
  }
}

/// Pause and resume thresholds of a link.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Watermarks {
  /// Depth at or below which a paused link resumes.
  pub low: usize,
  /// Depth at or above which a link pauses.
  pub high: usize,
}

impl Watermarks {
  /// Creates watermarks, rejecting `low >= high`.
  pub fn new(low: usize, high: usize) -> Result<Self, ConfigError> {
    if low >= high {
      return Err(ConfigError::Invalid(format!(
        "low watermark ({}) must be below high watermark ({})",
        low, high
      )));
    }
    Ok(Self { low, high })
  }

  /// Watermarks with `high = 2 * low`.
  pub fn from_low(low: usize) -> Self {
    Self {
      low,
      high: low.saturating_mul(2).max(low + 1),
    }
  }
}

impl Default for Watermarks {
  fn default() -> Self {
    let config = TopologyConfig::default();
    Self {
      low: config.low_watermark,
      high: config.high_watermark,
    }
  }
}

/// State change caused by one enqueue or dequeue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
  /// The paused flag did not change.
  Unchanged,
  /// The link paused.
  Paused,
  /// The link resumed.
  Resumed,
}

#[derive(Debug)]
struct LinkState {
  depth: usize,
  paused: bool,
  watermarks: Watermarks,
}

#[derive(Debug)]
struct LinkGate {
  state: Mutex<LinkState>,
  signal: watch::Sender<bool>,
}

impl LinkGate {
  fn new(watermarks: Watermarks) -> Self {
    let (signal, _) = watch::channel(false);
    Self {
      state: Mutex::new(LinkState {
        depth: 0,
        paused: false,
        watermarks,
      }),
      signal,
    }
  }

  fn lock(&self) -> MutexGuard<'_, LinkState> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

/// Per-link depth tracking with hysteresis.
#[derive(Debug)]
pub struct BackpressureController {
  links: DashMap<LinkId, Arc<LinkGate>>,
  defaults: Watermarks,
  transitions: broadcast::Sender<(LinkId, bool)>,
}

impl BackpressureController {
  /// Creates a controller applying `defaults` to every new link.
  pub fn new(defaults: Watermarks) -> Self {
    let (transitions, _) = broadcast::channel(256);
    Self {
      links: DashMap::new(),
      defaults,
      transitions,
    }
  }

  /// Creates a controller with the configured watermarks.
  pub fn from_config(config: &TopologyConfig) -> Result<Self, ConfigError> {
    Ok(Self::new(Watermarks::new(
      config.low_watermark,
      config.high_watermark,
    )?))
  }

  /// Default watermarks of new links.
  pub fn defaults(&self) -> Watermarks {
    self.defaults
  }

  /// Overrides the watermarks of one link.
  pub fn set_watermarks(&self, link: LinkId, watermarks: Watermarks) {
    let gate = self.gate(link);
    gate.lock().watermarks = watermarks;
  }

  /// Records one item entering `link`.
  pub fn record_enqueue(&self, link: LinkId) -> Transition {
    let gate = self.gate(link);
    let (transition, depth) = {
      let mut state = gate.lock();
      state.depth += 1;
      let transition = if !state.paused && state.depth >= state.watermarks.high {
        state.paused = true;
        gate.signal.send_replace(true);
        Transition::Paused
      } else {
        Transition::Unchanged
      };
      (transition, state.depth)
    };
    self.observe(link, transition, depth);
    transition
  }

  /// Records one item leaving `link`.
  pub fn record_dequeue(&self, link: LinkId) -> Transition {
    let gate = self.gate(link);
    let (transition, depth) = {
      let mut state = gate.lock();
      state.depth = state.depth.saturating_sub(1);
      let transition = if state.paused && state.depth <= state.watermarks.low {
        state.paused = false;
        gate.signal.send_replace(false);
        Transition::Resumed
      } else {
        Transition::Unchanged
      };
      (transition, state.depth)
    };
    self.observe(link, transition, depth);
    transition
  }

  /// Current depth of `link`.
  pub fn depth(&self, link: LinkId) -> usize {
    self
      .links
      .get(&link)
      .map(|gate| gate.lock().depth)
      .unwrap_or(0)
  }

  /// True if `link` is paused.
  pub fn is_paused(&self, link: LinkId) -> bool {
    self
      .links
      .get(&link)
      .map(|gate| gate.lock().paused)
      .unwrap_or(false)
  }

  /// True if any of `links` is paused.
  pub fn any_paused<'a>(&self, links: impl IntoIterator<Item = &'a LinkId>) -> bool {
    links.into_iter().any(|link| self.is_paused(*link))
  }

  /// Links currently paused.
  pub fn paused_links(&self) -> Vec<LinkId> {
    let mut paused: Vec<LinkId> = self
      .links
      .iter()
      .filter(|entry| entry.value().lock().paused)
      .map(|entry| *entry.key())
      .collect();
    paused.sort();
    paused
  }

  /// Suspends until `link` is not paused. Returns at once if it is not.
  pub async fn wait_until_resumed(&self, link: LinkId) {
    let mut rx = self.gate(link).signal.subscribe();
    // The sender lives in the gate, which the controller never drops.
    let _ = rx.wait_for(|paused| !*paused).await;
  }

  /// Suspends until none of `links` is paused.
  pub async fn wait_until_all_resumed(&self, links: &[LinkId]) {
    loop {
      match links.iter().find(|link| self.is_paused(**link)) {
        Some(link) => self.wait_until_resumed(*link).await,
        None => return,
      }
    }
  }

  /// Drops all recorded depth of `link` and resumes it.
  ///
  /// Used when the queue behind the link is replaced, e.g. on task restart.
  pub fn reset(&self, link: LinkId) {
    let gate = self.gate(link);
    let was_paused = {
      let mut state = gate.lock();
      state.depth = 0;
      let was_paused = state.paused;
      state.paused = false;
      gate.signal.send_replace(false);
      was_paused
    };
    metrics::record_queue_depth(link, 0);
    if was_paused {
      self.observe(link, Transition::Resumed, 0);
    }
    debug!(link = %link, "link reset");
  }

  /// Subscribes to `(link, paused)` transition events.
  pub fn subscribe_transitions(&self) -> broadcast::Receiver<(LinkId, bool)> {
    self.transitions.subscribe()
  }

  fn gate(&self, link: LinkId) -> Arc<LinkGate> {
    if let Some(gate) = self.links.get(&link) {
      return gate.value().clone();
    }
    self
      .links
      .entry(link)
      .or_insert_with(|| Arc::new(LinkGate::new(self.defaults)))
      .value()
      .clone()
  }

  fn observe(&self, link: LinkId, transition: Transition, depth: usize) {
    metrics::record_queue_depth(link, depth);
    let paused = match transition {
      Transition::Unchanged => return,
      Transition::Paused => true,
      Transition::Resumed => false,
    };
    metrics::record_backpressure_transition(link, paused);
    if paused {
      info!(link = %link, depth, "backpressure: link paused");
    } else {
      info!(link = %link, depth, "backpressure: link resumed");
    }
    // No observers is fine.
    let _ = self.transitions.send((link, paused));
  }
}
