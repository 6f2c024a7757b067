//! # Multi-stream word count
//!
//! Runs a single-worker topology:
//!
//! - `words` spout ×2 emitting random words on `default` and the odd
//!   malformed record on `error`,
//! - `count` bolt ×2 on fields("word") logging running counts every 10s,
//! - `aggregate` bolt ×1 receiving ALL of both streams, reporting totals
//!   every 15s.
//!
//! Usage: `multi-stream [SECONDS]` (default 30). `RUST_LOG` controls the log
//! level, `TUPLEFLOW_CONFIG` names an optional JSON config file and
//! `TUPLEFLOW_METRICS_ADDR` enables the Prometheus exporter.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tupleflow::config::TopologyConfig;
use tupleflow::executor::{AckDecision, Bolt, BoltOutput, Spout, SpoutOutput, TaskContext, TaskError};
use tupleflow::runtime::{ComponentRegistry, RuntimeOptions, TopologyRuntime};
use tupleflow::supervision::{FailureAction, SupervisionPolicy};
use tupleflow::topology::{ComponentDeclaration, Grouping, TopologyDeclaration, TopologyGraph};
use tupleflow::tuple::{RootId, Tuple, Value, WorkerId};

const WORDS: &[&str] = &[
  "storm", "spout", "bolt", "tuple", "stream", "topology", "worker", "ack",
];

struct WordSpout {
  task: String,
  rng: StdRng,
  acked: u64,
  failed: u64,
}

impl WordSpout {
  fn new(ctx: &TaskContext) -> Self {
    Self {
      task: ctx.task.to_string(),
      rng: StdRng::from_entropy(),
      acked: 0,
      failed: 0,
    }
  }
}

#[async_trait]
impl Spout for WordSpout {
  async fn next_tuple(&mut self, out: &mut SpoutOutput) -> Result<(), TaskError> {
    tokio::time::sleep(Duration::from_millis(5)).await;
    if self.rng.gen_ratio(1, 20) {
      out.emit_to("error", vec![Value::from("malformed record")]);
    } else {
      let word = WORDS[self.rng.gen_range(0..WORDS.len())];
      out.emit(vec![Value::from(word)]);
    }
    Ok(())
  }

  async fn ack(&mut self, _root: RootId) {
    self.acked += 1;
  }

  async fn fail(&mut self, root: RootId) {
    self.failed += 1;
    warn!(task = %self.task, root = ?root, "tuple tree failed");
  }

  async fn close(&mut self) {
    info!(task = %self.task, acked = self.acked, failed = self.failed, "spout closed");
  }
}

#[derive(Default)]
struct CountBolt {
  task: String,
  counts: HashMap<String, u64>,
}

#[async_trait]
impl Bolt for CountBolt {
  async fn prepare(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
    self.task = ctx.task.to_string();
    Ok(())
  }

  async fn execute(&mut self, input: &Tuple, _out: &mut BoltOutput) -> Result<AckDecision, TaskError> {
    if input.is_tick() {
      let mut top: Vec<_> = self.counts.iter().collect();
      top.sort_by(|a, b| b.1.cmp(a.1));
      top.truncate(3);
      info!(task = %self.task, distinct = self.counts.len(), top = ?top, "word counts");
      return Ok(AckDecision::Ack);
    }
    let word = input
      .value(0)
      .and_then(Value::as_str)
      .ok_or("count bolt expects a word")?;
    *self.counts.entry(word.to_string()).or_default() += 1;
    Ok(AckDecision::Ack)
  }
}

#[derive(Default)]
struct AggregateBolt {
  words: u64,
  errors: u64,
}

#[async_trait]
impl Bolt for AggregateBolt {
  async fn execute(&mut self, input: &Tuple, _out: &mut BoltOutput) -> Result<AckDecision, TaskError> {
    match input.stream.as_str() {
      "error" => self.errors += 1,
      _ if input.is_tick() => {
        info!(words = self.words, errors = self.errors, "stream totals");
      }
      _ => self.words += 1,
    }
    Ok(AckDecision::Ack)
  }
}

fn declaration() -> TopologyDeclaration {
  TopologyDeclaration::new("multi_stream")
    .with_component(
      ComponentDeclaration::spout("words", 2)
        .with_stream("default", ["word"])
        .with_stream("error", ["message"]),
    )
    .with_component(
      ComponentDeclaration::bolt("count", 2)
        .with_input("words", Grouping::fields(["word"]))
        .with_tick_interval(Duration::from_secs(10)),
    )
    .with_component(
      ComponentDeclaration::bolt("aggregate", 1)
        .with_input("words", Grouping::All)
        .with_stream_input("words", "error", Grouping::All)
        .with_tick_interval(Duration::from_secs(15)),
    )
}

fn load_config() -> Result<TopologyConfig, Box<dyn std::error::Error>> {
  match std::env::var("TUPLEFLOW_CONFIG") {
    Ok(path) => Ok(TopologyConfig::from_file(path)?),
    Err(_) => Ok(TopologyConfig::default().with_max_spout_pending(Some(500))),
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  if let Ok(addr) = std::env::var("TUPLEFLOW_METRICS_ADDR") {
    tupleflow::metrics::install_prometheus_recorder_on(addr.parse()?)?;
    info!(%addr, "prometheus exporter listening");
  }

  let seconds: u64 = match std::env::args().nth(1) {
    Some(arg) => arg.parse()?,
    None => 30,
  };

  let graph = Arc::new(TopologyGraph::build(&declaration())?);
  let components = ComponentRegistry::new()
    .with_spout("words", WordSpout::new)
    .with_bolt("count", |_: &TaskContext| CountBolt::default())
    .with_bolt("aggregate", |_: &TaskContext| AggregateBolt::default());
  let options = RuntimeOptions::new(WorkerId(0)).with_policy(
    SupervisionPolicy::new(FailureAction::Restart).with_restart_backoff(Duration::from_millis(200)),
  );
  let handle = TopologyRuntime::launch_with(graph, components, load_config()?, options)?;

  tokio::select! {
    _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
    _ = tokio::signal::ctrl_c() => info!("interrupted"),
    _ = handle.stopped() => warn!("worker stopped by supervisor"),
  }

  let failed = handle.shutdown().await;
  info!(failed, "shutdown complete");
  Ok(())
}
