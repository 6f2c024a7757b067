//! # tupleflow
//!
//! Execution core of a distributed stream-processing engine in the
//! spout/bolt model.
//!
//! A topology is a DAG of components. Spouts originate root tuples, bolts
//! consume tuples and emit derived ones; each component runs as one or more
//! task instances placed on workers. Every tuple a spout emits is tracked
//! until the whole tree of tuples derived from it has been processed, and
//! the spout is told whether that tree completed or failed.
//!
//! ## Key Pieces
//!
//! - **[`topology`]**: declarations and the validated physical graph.
//! - **[`router`]**: grouping policies resolving emissions to task instances.
//! - **[`ack`]**: per-root ack trees, timeouts and spout notification.
//! - **[`backpressure`]**: per-link high/low watermark hysteresis.
//! - **[`dispatcher`]**: local queues, batched remote transport, wire format.
//! - **[`executor`]**: the `Spout` / `Bolt` traits and their executor loops.
//! - **[`runtime`]**: launching, supervising and stopping a worker.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tupleflow::config::TopologyConfig;
//! use tupleflow::runtime::{ComponentRegistry, TopologyRuntime};
//! use tupleflow::topology::{ComponentDeclaration, Grouping, TopologyDeclaration, TopologyGraph};
//! use tupleflow::tuple::WorkerId;
//! # use tupleflow::executor::{AckDecision, Bolt, BoltOutput, Spout, SpoutOutput, TaskError};
//! # use tupleflow::tuple::Tuple;
//! # struct Words;
//! # #[async_trait::async_trait]
//! # impl Spout for Words {
//! #   async fn next_tuple(&mut self, out: &mut SpoutOutput) -> Result<(), TaskError> {
//! #     out.emit(vec!["word".into()]);
//! #     Ok(())
//! #   }
//! # }
//! # struct Print;
//! # #[async_trait::async_trait]
//! # impl Bolt for Print {
//! #   async fn execute(&mut self, t: &Tuple, _: &mut BoltOutput) -> Result<AckDecision, TaskError> {
//! #     println!("{:?}", t.values);
//! #     Ok(AckDecision::Ack)
//! #   }
//! # }
//!
//! # async fn run() -> Result<(), tupleflow::error::Error> {
//! let decl = TopologyDeclaration::new("words")
//!   .with_component(ComponentDeclaration::spout("words", 1).with_stream("default", ["word"]))
//!   .with_component(ComponentDeclaration::bolt("print", 2).with_input("words", Grouping::fields(["word"])));
//! let graph = Arc::new(TopologyGraph::build(&decl)?);
//! let components = ComponentRegistry::new()
//!   .with_spout("words", |_| Words)
//!   .with_bolt("print", |_| Print);
//! let handle = TopologyRuntime::launch(graph, components, TopologyConfig::default(), WorkerId(0))?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Per-root ack trees and spout notification.
pub mod ack;
/// Watermark-driven flow control per link.
pub mod backpressure;
/// Topology-wide runtime configuration.
pub mod config;
/// Tuple delivery to local queues and remote workers.
pub mod dispatcher;
/// Error types of the execution core.
pub mod error;
/// User logic traits and task executors.
pub mod executor;
/// Prometheus-compatible metrics.
pub mod metrics;
/// Grouping policies and the live-instance table.
pub mod router;
/// Launching and stopping a worker.
pub mod runtime;
/// Supervision policies for task failure handling.
pub mod supervision;
/// Topology declarations and the physical graph.
pub mod topology;
/// Identifiers, values and tuples.
pub mod tuple;

pub use ack::{AckOutcome, AckSink, AckTracker, FailureReason};
pub use backpressure::{BackpressureController, LinkId, Watermarks};
pub use config::{ReliabilityMode, TopologyConfig};
pub use dispatcher::{Dispatcher, TcpTransport, Transport};
pub use error::{Error, RoutingError, TaskFailure, TopologyError, TransportError};
pub use executor::{AckDecision, Bolt, BoltOutput, ComponentFactory, Spout, SpoutOutput, TaskContext};
pub use router::{RoutingTable, TupleRouter};
pub use runtime::{ComponentRegistry, RuntimeOptions, TopologyHandle, TopologyRuntime};
pub use supervision::{FailureAction, RestartingSupervisor, SupervisionPolicy, WorkerSupervisor};
pub use topology::{ComponentDeclaration, Grouping, TopologyDeclaration, TopologyGraph};
pub use tuple::{Emission, RootId, TaskId, Tuple, TupleId, Value, WorkerId};
