//! # Dispatcher Test Suite
//!
//! Local handoff, remote batching and retries, ack forwarding and a TCP
//! round trip between two dispatchers.

use super::*;
use crate::ack::AckOutcome;
use crate::backpressure::Watermarks;
use crate::topology::{ComponentDeclaration, Grouping, TopologyDeclaration};
use crate::tuple::{DEFAULT_STREAM, IdGenerator, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::net::TcpListener;

// ============================================================================
// Fixtures
// ============================================================================

/// `s` (task 1, worker 0) -> `b` (task 2 on worker 1, task 3 on worker 0).
fn two_worker_graph() -> Arc<TopologyGraph> {
  let decl = TopologyDeclaration::new("t")
    .with_workers(2)
    .with_component(ComponentDeclaration::spout("s", 1))
    .with_component(ComponentDeclaration::bolt("b", 2).with_input("s", Grouping::Shuffle));
  Arc::new(TopologyGraph::build(&decl).unwrap())
}

fn config() -> TopologyConfig {
  TopologyConfig::default()
    .with_batch_size(2)
    .with_send_retries(3, Duration::from_millis(1))
}

fn tuple(id: u64, roots: impl IntoIterator<Item = RootId>) -> Tuple {
  Tuple {
    id: TupleId(id),
    source_task: TaskId(1),
    stream: DEFAULT_STREAM.into(),
    values: vec![Value::from("w")],
    roots: roots.into_iter().collect(),
  }
}

fn delivery(destination: u32, t: Tuple) -> Delivery {
  Delivery {
    destination: TaskId(destination),
    tuple: t,
  }
}

/// Records every batch; fails the first `failures` sends with an I/O error.
#[derive(Default)]
struct MockTransport {
  failures: u32,
  permanent: bool,
  calls: AtomicU32,
  batches: StdMutex<Vec<(WorkerId, Vec<WireMessage>)>>,
}

impl MockTransport {
  fn flaky(failures: u32) -> Self {
    Self {
      failures,
      ..Self::default()
    }
  }

  fn broken() -> Self {
    Self {
      permanent: true,
      ..Self::default()
    }
  }

  fn batches(&self) -> Vec<(WorkerId, Vec<WireMessage>)> {
    self.batches.lock().unwrap().clone()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send_batch(&self, worker: WorkerId, messages: &[WireMessage]) -> Result<(), TransportError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst);
    if self.permanent || call < self.failures {
      return Err(TransportError::Io(std::io::Error::from(
        std::io::ErrorKind::ConnectionRefused,
      )));
    }
    self.batches.lock().unwrap().push((worker, messages.to_vec()));
    Ok(())
  }
}

fn dispatcher(
  worker: u32,
  graph: Arc<TopologyGraph>,
  tracker: Option<Arc<AckTracker>>,
  transport: Option<Arc<dyn Transport>>,
) -> (Dispatcher, Arc<BackpressureController>) {
  let backpressure = Arc::new(BackpressureController::new(Watermarks::new(2, 4).unwrap()));
  let d = Dispatcher::new(
    WorkerId(worker),
    graph,
    &config(),
    backpressure.clone(),
    tracker,
    transport,
  );
  (d, backpressure)
}

// ============================================================================
// Local delivery
// ============================================================================

#[tokio::test]
async fn test_local_delivery_records_enqueue() {
  let (d, bp) = dispatcher(0, two_worker_graph(), None, None);
  let (tx, mut rx) = mpsc::channel(8);
  d.register_local(TaskId(3), tx);

  d.send(delivery(3, tuple(10, []))).await.unwrap();
  assert_eq!(rx.recv().await.unwrap().id, TupleId(10));
  assert_eq!(bp.depth(LinkId::Task(TaskId(3))), 1);
}

#[tokio::test]
async fn test_local_delivery_without_queue_fails() {
  let (d, _) = dispatcher(0, two_worker_graph(), None, None);
  let err = d.send(delivery(3, tuple(10, []))).await.unwrap_err();
  assert!(matches!(err, TransportError::ChannelClosed(TaskId(3))));
}

#[tokio::test]
async fn test_unknown_destination_fails() {
  let (d, _) = dispatcher(0, two_worker_graph(), None, None);
  let err = d.send(delivery(99, tuple(10, []))).await.unwrap_err();
  assert!(matches!(err, TransportError::UnknownTask(TaskId(99))));
}

#[tokio::test]
async fn test_local_send_waits_for_resume() {
  let (d, bp) = dispatcher(0, two_worker_graph(), None, None);
  let d = Arc::new(d);
  let (tx, mut rx) = mpsc::channel(16);
  d.register_local(TaskId(3), tx);
  let link = LinkId::Task(TaskId(3));
  for i in 0..4 {
    d.send(delivery(3, tuple(i, []))).await.unwrap();
  }
  assert!(bp.is_paused(link));

  let blocked = {
    let d = d.clone();
    tokio::spawn(async move { d.send(delivery(3, tuple(99, []))).await })
  };
  tokio::time::sleep(Duration::from_millis(20)).await;
  assert!(!blocked.is_finished(), "producer suspends on a paused link");

  for _ in 0..2 {
    rx.recv().await.unwrap();
    bp.record_dequeue(link);
  }
  tokio::time::timeout(Duration::from_secs(1), blocked)
    .await
    .unwrap()
    .unwrap()
    .unwrap();
}

#[test]
fn test_links_follow_placement() {
  let (d, _) = dispatcher(0, two_worker_graph(), None, None);
  assert_eq!(d.link_for(TaskId(3)), Some(LinkId::Task(TaskId(3))));
  assert_eq!(d.link_for(TaskId(2)), Some(LinkId::Worker(WorkerId(1))));
  assert_eq!(
    d.downstream_links(TaskId(1)),
    vec![LinkId::Task(TaskId(3)), LinkId::Worker(WorkerId(1))]
  );
  assert!(d.downstream_links(TaskId(3)).is_empty());
}

// ============================================================================
// Remote batching and retries
// ============================================================================

#[tokio::test]
async fn test_remote_batch_flushes_at_batch_size() {
  let transport = Arc::new(MockTransport::default());
  let (d, bp) = dispatcher(0, two_worker_graph(), None, Some(transport.clone() as Arc<dyn Transport>));
  let link = LinkId::Worker(WorkerId(1));

  d.send(delivery(2, tuple(1, []))).await.unwrap();
  assert!(transport.batches().is_empty());
  assert_eq!(bp.depth(link), 1);

  d.send(delivery(2, tuple(2, []))).await.unwrap();
  let batches = transport.batches();
  assert_eq!(batches.len(), 1);
  assert_eq!(batches[0].0, WorkerId(1));
  let ids: Vec<TupleId> = batches[0]
    .1
    .iter()
    .filter_map(|m| m.clone().into_delivery())
    .map(|(_, t)| t.id)
    .collect();
  assert_eq!(ids, vec![TupleId(1), TupleId(2)], "order preserved");
  assert_eq!(bp.depth(link), 0);
}

#[tokio::test]
async fn test_flush_sends_partial_batch() {
  let transport = Arc::new(MockTransport::default());
  let (d, _) = dispatcher(0, two_worker_graph(), None, Some(transport.clone() as Arc<dyn Transport>));
  d.send(delivery(2, tuple(1, []))).await.unwrap();
  d.flush().await.unwrap();
  assert_eq!(transport.batches().len(), 1);
  d.flush().await.unwrap();
  assert_eq!(transport.batches().len(), 1, "empty batches are not sent");
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
  let transport = Arc::new(MockTransport::flaky(2));
  let (d, _) = dispatcher(0, two_worker_graph(), None, Some(transport.clone() as Arc<dyn Transport>));
  d.send(delivery(2, tuple(1, []))).await.unwrap();
  d.flush().await.unwrap();
  assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
  assert_eq!(transport.batches().len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_roots() {
  let tracker = Arc::new(AckTracker::new(Duration::from_secs(30)));
  let mut outcomes = tracker.subscribe(TaskId(1));
  let root = RootId::from(IdGenerator::new(WorkerId(0)).next_id());
  tracker.register_root(root, TaskId(1));

  let transport = Arc::new(MockTransport::broken());
  let (d, bp) = dispatcher(0, two_worker_graph(), Some(tracker.clone()), Some(transport.clone() as Arc<dyn Transport>));
  d.send(delivery(2, tuple(5, [root]))).await.unwrap();
  let err = d.flush().await.unwrap_err();

  assert!(matches!(err, TransportError::SendFailed { attempts: 3, .. }));
  assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
  assert_eq!(
    outcomes.recv().await.unwrap(),
    AckOutcome::Failed {
      root,
      reason: FailureReason::Transport
    }
  );
  assert_eq!(bp.depth(LinkId::Worker(WorkerId(1))), 0);
}

#[tokio::test]
async fn test_remote_send_without_transport() {
  let (d, _) = dispatcher(0, two_worker_graph(), None, None);
  let err = d.send(delivery(2, tuple(1, []))).await.unwrap_err();
  assert!(matches!(err, TransportError::NoRoute(WorkerId(1))));
}

// ============================================================================
// Ack forwarding
// ============================================================================

#[tokio::test]
async fn test_local_roots_go_to_local_tracker() {
  let tracker = Arc::new(AckTracker::new(Duration::from_secs(30)));
  let mut outcomes = tracker.subscribe(TaskId(1));
  let ids = IdGenerator::new(WorkerId(0));
  let root = RootId::from(ids.next_id());
  tracker.register_root(root, TaskId(1));
  let (d, _) = dispatcher(0, two_worker_graph(), Some(tracker.clone()), None);

  let child = ids.next_id();
  d.register_children(root, &[child]);
  d.ack(root.as_tuple_id(), &BTreeSet::from([root]));
  d.ack(child, &BTreeSet::from([root]));
  assert_eq!(outcomes.recv().await.unwrap(), AckOutcome::Succeeded { root });
}

#[tokio::test]
async fn test_remote_roots_forwarded_as_control_messages() {
  let transport = Arc::new(MockTransport::default());
  let (d, bp) = dispatcher(0, two_worker_graph(), None, Some(transport.clone() as Arc<dyn Transport>));
  let remote_root = RootId::from(IdGenerator::new(WorkerId(1)).next_id());

  d.register_children(remote_root, &[TupleId(7)]);
  d.ack(TupleId(6), &BTreeSet::from([remote_root]));
  d.fail(&BTreeSet::from([remote_root]), FailureReason::Routing);
  assert_eq!(bp.depth(LinkId::Worker(WorkerId(1))), 0, "control skips backpressure");
  d.flush().await.unwrap();

  let batches = transport.batches();
  assert_eq!(batches.len(), 1);
  assert_eq!(
    batches[0].1,
    vec![
      WireMessage::Register {
        root: remote_root,
        tuple_ids: vec![TupleId(7)]
      },
      WireMessage::Ack {
        tuple_id: TupleId(6),
        roots: BTreeSet::from([remote_root])
      },
      WireMessage::Fail {
        roots: BTreeSet::from([remote_root]),
        reason: FailureReason::Routing
      },
    ]
  );
}

#[tokio::test]
async fn test_accept_remote_control_messages() {
  let tracker = Arc::new(AckTracker::new(Duration::from_secs(30)));
  let mut outcomes = tracker.subscribe(TaskId(1));
  let root = RootId::from(IdGenerator::new(WorkerId(0)).next_id());
  tracker.register_root(root, TaskId(1));
  let (d, _) = dispatcher(0, two_worker_graph(), Some(tracker.clone()), None);

  d.accept_remote(WireMessage::Register {
    root,
    tuple_ids: vec![TupleId(500)],
  })
  .await;
  tracker.ack(root.as_tuple_id(), &BTreeSet::from([root]));
  d.accept_remote(WireMessage::Ack {
    tuple_id: TupleId(500),
    roots: BTreeSet::from([root]),
  })
  .await;
  assert_eq!(outcomes.recv().await.unwrap(), AckOutcome::Succeeded { root });
}

// ============================================================================
// TCP
// ============================================================================

#[tokio::test]
async fn test_tcp_round_trip_delivers_to_remote_queue() {
  let graph = two_worker_graph();
  let (shutdown_tx, shutdown_rx) = watch::channel(false);

  // Worker 1 hosts task 2 and listens for peers.
  let (receiver, _) = dispatcher(1, graph.clone(), None, None);
  let receiver = Arc::new(receiver);
  let (tx, mut rx) = mpsc::channel(8);
  receiver.register_local(TaskId(2), tx);
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let server = serve_inbound(listener, receiver.clone(), shutdown_rx);

  // Worker 0 sends to it.
  let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(HashMap::from([(WorkerId(1), addr)])));
  let (sender, _) = dispatcher(0, graph, None, Some(transport));
  sender.send(delivery(2, tuple(42, [RootId(9)]))).await.unwrap();
  sender.flush().await.unwrap();

  let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(received, tuple(42, [RootId(9)]));

  shutdown_tx.send(true).unwrap();
  server.await.unwrap();
}

#[tokio::test]
async fn test_tcp_unreachable_peer_is_transient() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);
  let transport = TcpTransport::new(HashMap::from([(WorkerId(1), addr)]));
  let err = transport
    .send_batch(WorkerId(1), &[WireMessage::Ack {
      tuple_id: TupleId(1),
      roots: BTreeSet::new(),
    }])
    .await
    .unwrap_err();
  assert!(err.is_transient());
  let err = transport.send_batch(WorkerId(7), &[]).await.unwrap_err();
  assert!(matches!(err, TransportError::NoRoute(WorkerId(7))));
}

#[tokio::test]
async fn test_tcp_stalled_peer_times_out() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  // Accepts connections and never reads from them.
  let stalled = tokio::spawn(async move {
    let mut held = Vec::new();
    while let Ok((stream, _)) = listener.accept().await {
      held.push(stream);
    }
  });
  let transport = TcpTransport::new(HashMap::from([(WorkerId(1), addr)]))
    .with_send_timeout(Duration::from_millis(200));
  let mut big = tuple(1, [RootId(9)]);
  big.values = vec![Value::from("x".repeat(4 * 1024 * 1024))];
  let batch = vec![WireMessage::tuple(TaskId(2), big)];

  let err = tokio::time::timeout(Duration::from_secs(30), async {
    for _ in 0..64 {
      if let Err(e) = transport.send_batch(WorkerId(1), &batch).await {
        return e;
      }
    }
    panic!("writes never blocked");
  })
  .await
  .unwrap();
  assert!(matches!(err, TransportError::Timeout(WorkerId(1))));
  assert!(err.is_transient());
  stalled.abort();
}

#[tokio::test]
async fn test_inbound_frame_with_bad_message_delivers_the_rest() {
  let graph = two_worker_graph();
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let tracker = Arc::new(AckTracker::new(Duration::from_secs(30)));
  let mut outcomes = tracker.subscribe(TaskId(1));
  let bad_root = RootId::from(IdGenerator::new(WorkerId(1)).next_id());
  tracker.register_root(bad_root, TaskId(1));

  let (receiver, _) = dispatcher(1, graph, Some(tracker), None);
  let receiver = Arc::new(receiver);
  let (tx, mut rx) = mpsc::channel(8);
  receiver.register_local(TaskId(2), tx);
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let server = serve_inbound(listener, receiver.clone(), shutdown_rx);

  let mut bad = tuple(43, [bad_root]);
  bad.values = vec![Value::Float(1.0)];
  let frame = Frame::new(vec![
    WireMessage::tuple(TaskId(2), bad),
    WireMessage::tuple(TaskId(2), tuple(42, [RootId(9)])),
  ]);
  let mut doc = serde_json::to_value(&frame).unwrap();
  doc["messages"][0]["values"][0]["value"] = serde_json::Value::Null;
  let body = bytes::Bytes::from(serde_json::to_vec(&doc).unwrap());

  let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
  let mut peer = tokio_util::codec::Framed::new(stream, tokio_util::codec::LengthDelimitedCodec::new());
  futures::SinkExt::send(&mut peer, body).await.unwrap();

  let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(received, tuple(42, [RootId(9)]));
  let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(
    outcome,
    AckOutcome::Failed {
      root: bad_root,
      reason: FailureReason::Transport
    }
  );

  shutdown_tx.send(true).unwrap();
  server.await.unwrap();
}
