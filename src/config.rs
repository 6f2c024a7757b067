//! Topology-wide runtime configuration.
//!
//! Bounds for acking (message timeout, sweep interval), backpressure
//! watermarks, dispatcher batching and retry, and executor idle behaviour.
//! Durations are (de)serialized as integer milliseconds under `*_ms` keys.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Delivery guarantee the topology runs with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityMode {
  /// No ack tracking; spouts receive no ack or fail callbacks.
  AtMostOnce,
  /// Every root is tracked until acked, failed or timed out.
  #[default]
  AtLeastOnce,
}

/// Configuration shared by every task of a topology.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
  /// Delivery guarantee.
  pub reliability: ReliabilityMode,
  /// Time a root may stay in flight before it is failed.
  #[serde(rename = "message_timeout_ms", with = "duration_ms")]
  pub message_timeout: Duration,
  /// Interval of the expired-tree sweep.
  #[serde(rename = "ack_sweep_interval_ms", with = "duration_ms")]
  pub ack_sweep_interval: Duration,
  /// Queue depth at or below which a paused link resumes.
  pub low_watermark: usize,
  /// Queue depth at or above which a link pauses.
  pub high_watermark: usize,
  /// Hard capacity of every inbound queue.
  pub queue_capacity: usize,
  /// Remote messages buffered per worker before a flush.
  pub batch_size: usize,
  /// Interval at which partially filled remote batches are flushed.
  #[serde(rename = "flush_interval_ms", with = "duration_ms")]
  pub flush_interval: Duration,
  /// Attempts per remote batch before the send is failed.
  pub max_send_attempts: u32,
  /// Delay between remote send attempts.
  #[serde(rename = "retry_backoff_ms", with = "duration_ms")]
  pub retry_backoff: Duration,
  /// Longest a single remote write may take before the connection is dropped.
  #[serde(rename = "send_timeout_ms", with = "duration_ms")]
  pub send_timeout: Duration,
  /// Bound on each shutdown step that waits on I/O (final flush, background tasks).
  #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
  pub shutdown_timeout: Duration,
  /// Sleep of a spout whose `next_tuple` emitted nothing.
  #[serde(rename = "idle_backoff_ms", with = "duration_ms")]
  pub idle_backoff: Duration,
  /// Open roots per spout task before `next_tuple` is held back. None = unbounded.
  pub max_spout_pending: Option<usize>,
}

impl Default for TopologyConfig {
  fn default() -> Self {
    Self {
      reliability: ReliabilityMode::AtLeastOnce,
      message_timeout: Duration::from_secs(30),
      ack_sweep_interval: Duration::from_secs(1),
      low_watermark: 512,
      high_watermark: 1024,
      queue_capacity: 2048,
      batch_size: 64,
      flush_interval: Duration::from_millis(10),
      max_send_attempts: 3,
      retry_backoff: Duration::from_millis(100),
      send_timeout: Duration::from_secs(5),
      shutdown_timeout: Duration::from_secs(10),
      idle_backoff: Duration::from_millis(1),
      max_spout_pending: None,
    }
  }
}

impl TopologyConfig {
  /// Parses a JSON document; absent keys take their defaults.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Reads and parses a JSON configuration file.
  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Self::from_json_str(&text)
  }

  /// Sets the reliability mode.
  pub fn with_reliability(mut self, mode: ReliabilityMode) -> Self {
    self.reliability = mode;
    self
  }

  /// Sets the message timeout.
  pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
    self.message_timeout = timeout;
    self
  }

  /// Sets the sweep interval.
  pub fn with_ack_sweep_interval(mut self, interval: Duration) -> Self {
    self.ack_sweep_interval = interval;
    self
  }

  /// Sets both watermarks.
  pub fn with_watermarks(mut self, low: usize, high: usize) -> Self {
    self.low_watermark = low;
    self.high_watermark = high;
    self
  }

  /// Sets the inbound queue capacity.
  pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity;
    self
  }

  /// Sets the remote batch size.
  pub fn with_batch_size(mut self, size: usize) -> Self {
    self.batch_size = size;
    self
  }

  /// Sets the remote send retry policy.
  pub fn with_send_retries(mut self, attempts: u32, backoff: Duration) -> Self {
    self.max_send_attempts = attempts;
    self.retry_backoff = backoff;
    self
  }

  /// Sets the remote write timeout.
  pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
    self.send_timeout = timeout;
    self
  }

  /// Sets the bound on shutdown steps.
  pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.shutdown_timeout = timeout;
    self
  }

  /// Sets the topology-wide max spout pending.
  pub fn with_max_spout_pending(mut self, pending: Option<usize>) -> Self {
    self.max_spout_pending = pending;
    self
  }

  /// Checks the configuration for internal consistency.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.low_watermark >= self.high_watermark {
      return Err(ConfigError::Invalid(format!(
        "low_watermark ({}) must be < high_watermark ({})",
        self.low_watermark, self.high_watermark
      )));
    }
    if self.queue_capacity < self.high_watermark {
      return Err(ConfigError::Invalid(format!(
        "queue_capacity ({}) must be >= high_watermark ({})",
        self.queue_capacity, self.high_watermark
      )));
    }
    if self.message_timeout.is_zero() {
      return Err(ConfigError::Invalid("message_timeout must be > 0".to_string()));
    }
    if self.ack_sweep_interval.is_zero() || self.flush_interval.is_zero() {
      return Err(ConfigError::Invalid(
        "ack_sweep_interval and flush_interval must be > 0".to_string(),
      ));
    }
    if self.send_timeout.is_zero() || self.shutdown_timeout.is_zero() {
      return Err(ConfigError::Invalid(
        "send_timeout and shutdown_timeout must be > 0".to_string(),
      ));
    }
    if self.batch_size == 0 {
      return Err(ConfigError::Invalid("batch_size must be > 0".to_string()));
    }
    if self.max_send_attempts == 0 {
      return Err(ConfigError::Invalid("max_send_attempts must be > 0".to_string()));
    }
    if self.max_spout_pending == Some(0) {
      return Err(ConfigError::Invalid("max_spout_pending must be > 0 when set".to_string()));
    }
    Ok(())
  }

  /// True when roots are ack-tracked.
  pub fn is_acking(&self) -> bool {
    self.reliability == ReliabilityMode::AtLeastOnce
  }
}

pub(crate) mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(d)?))
  }
}

pub(crate) mod option_duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
      Some(d) => s.serialize_some(&(d.as_millis() as u64)),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn default_validates() {
    let c = TopologyConfig::default();
    assert!(c.validate().is_ok());
    assert!(c.is_acking());
  }

  #[test]
  fn validate_watermark_order() {
    let c = TopologyConfig::default().with_watermarks(100, 100);
    assert!(c.validate().is_err());
    let c = TopologyConfig::default().with_watermarks(50, 100);
    assert!(c.validate().is_ok());
  }

  #[test]
  fn validate_capacity_covers_high_watermark() {
    let c = TopologyConfig::default()
      .with_watermarks(10, 100)
      .with_queue_capacity(99);
    assert!(c.validate().is_err());
  }

  #[test]
  fn parse_partial_json() {
    let c = TopologyConfig::from_json_str(
      r#"{"message_timeout_ms": 2500, "reliability": "at_most_once", "max_spout_pending": 10}"#,
    )
    .unwrap();
    assert_eq!(c.message_timeout, Duration::from_millis(2500));
    assert_eq!(c.reliability, ReliabilityMode::AtMostOnce);
    assert_eq!(c.max_spout_pending, Some(10));
    assert_eq!(c.high_watermark, TopologyConfig::default().high_watermark);
  }

  #[test]
  fn parse_rejects_invalid_values() {
    let err = TopologyConfig::from_json_str(r#"{"low_watermark": 5000}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
    let err = TopologyConfig::from_json_str("{not json").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
  }

  #[test]
  fn parse_timeouts() {
    let c = TopologyConfig::from_json_str(r#"{"send_timeout_ms": 250, "shutdown_timeout_ms": 1000}"#)
      .unwrap();
    assert_eq!(c.send_timeout, Duration::from_millis(250));
    assert_eq!(c.shutdown_timeout, Duration::from_secs(1));
    let c = TopologyConfig::default().with_send_timeout(Duration::ZERO);
    assert!(c.validate().is_err());
  }

  #[test]
  fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"batch_size": 8, "flush_interval_ms": 5}}"#).unwrap();
    let c = TopologyConfig::from_file(file.path()).unwrap();
    assert_eq!(c.batch_size, 8);
    assert_eq!(c.flush_interval, Duration::from_millis(5));
  }
}
