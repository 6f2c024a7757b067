//! Worker-to-worker transport.
//!
//! [`Transport`] is the seam the dispatcher sends remote batches through.
//! [`TcpTransport`] implements it with one lazily opened, length-delimited
//! TCP connection per peer; [`serve_inbound`] accepts peer connections and
//! feeds decoded messages back into a local [`Dispatcher`].

use crate::ack::{AckSink, FailureReason};
use crate::config::TopologyConfig;
use crate::dispatcher::Dispatcher;
use crate::dispatcher::wire::{Frame, WireMessage};
use crate::error::TransportError;
use crate::tuple::WorkerId;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::codec::{Framed, FramedRead, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Largest accepted frame body.
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Sends batches of wire messages to remote workers.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Sends `messages` to `worker` as one frame, in order.
  async fn send_batch(&self, worker: WorkerId, messages: &[WireMessage]) -> Result<(), TransportError>;
}

fn codec() -> LengthDelimitedCodec {
  LengthDelimitedCodec::builder()
    .max_frame_length(MAX_FRAME_LENGTH)
    .new_codec()
}

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// TCP transport with one connection per peer.
pub struct TcpTransport {
  peers: HashMap<WorkerId, SocketAddr>,
  connections: DashMap<WorkerId, Arc<Mutex<Option<Connection>>>>,
  connect_timeout: Duration,
  send_timeout: Duration,
}

impl TcpTransport {
  /// Creates a transport reaching the given peers.
  pub fn new(peers: HashMap<WorkerId, SocketAddr>) -> Self {
    Self {
      peers,
      connections: DashMap::new(),
      connect_timeout: Duration::from_secs(5),
      send_timeout: Duration::from_secs(5),
    }
  }

  /// Creates a transport taking its write timeout from `config`.
  pub fn from_config(peers: HashMap<WorkerId, SocketAddr>, config: &TopologyConfig) -> Self {
    Self::new(peers).with_send_timeout(config.send_timeout)
  }

  /// Sets the connect timeout.
  pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
    self.connect_timeout = connect_timeout;
    self
  }

  /// Sets how long one frame write may block before the connection is
  /// dropped. A peer that stops reading fills its socket buffer, so without
  /// this bound a write can wait forever.
  pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
    self.send_timeout = send_timeout;
    self
  }

  async fn connect(&self, worker: WorkerId) -> Result<Connection, TransportError> {
    let addr = *self.peers.get(&worker).ok_or(TransportError::NoRoute(worker))?;
    let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
      .await
      .map_err(|_| TransportError::Timeout(worker))??;
    stream.set_nodelay(true)?;
    debug!(worker = %worker, %addr, "connected to peer");
    Ok(Framed::new(stream, codec()))
  }

  fn slot(&self, worker: WorkerId) -> Arc<Mutex<Option<Connection>>> {
    self
      .connections
      .entry(worker)
      .or_insert_with(|| Arc::new(Mutex::new(None)))
      .value()
      .clone()
  }
}

#[async_trait]
impl Transport for TcpTransport {
  async fn send_batch(&self, worker: WorkerId, messages: &[WireMessage]) -> Result<(), TransportError> {
    let body = Frame::new(messages.to_vec()).encode()?;
    let slot = self.slot(worker);
    let mut guard = slot.lock().await;
    // Out of the slot while writing: a write that fails, times out or is
    // cancelled leaves a half-sent frame, so that connection is never reused.
    let mut connection = match guard.take() {
      Some(connection) => connection,
      None => self.connect(worker).await?,
    };
    match timeout(self.send_timeout, connection.send(body)).await {
      Ok(Ok(())) => {
        *guard = Some(connection);
        Ok(())
      }
      Ok(Err(e)) => Err(TransportError::Io(e)),
      Err(_) => {
        warn!(
          worker = %worker,
          timeout_ms = self.send_timeout.as_millis() as u64,
          "peer write timed out, dropping connection"
        );
        Err(TransportError::Timeout(worker))
      }
    }
  }
}

/// Accepts peer connections on `listener` and hands every received message
/// to `dispatcher` until `shutdown` turns true.
pub fn serve_inbound(
  listener: TcpListener,
  dispatcher: Arc<Dispatcher>,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    if let Ok(addr) = listener.local_addr() {
      info!(%addr, worker = %dispatcher.worker(), "accepting peer connections");
    }
    let mut incoming = TcpListenerStream::new(listener);
    loop {
      tokio::select! {
        accepted = incoming.next() => match accepted {
          Some(Ok(stream)) => {
            if let Ok(peer) = stream.peer_addr() {
              debug!(%peer, "peer connected");
            }
            tokio::spawn(read_peer(stream, dispatcher.clone(), shutdown.clone()));
          }
          Some(Err(e)) => warn!(error = %e, "accept failed"),
          None => break,
        },
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    debug!("inbound listener stopped");
  })
}

async fn read_peer(stream: TcpStream, dispatcher: Arc<Dispatcher>, mut shutdown: watch::Receiver<bool>) {
  let mut frames = FramedRead::new(stream, codec());
  loop {
    let next = tokio::select! {
      next = frames.next() => next,
      changed = shutdown.changed() => {
        if changed.is_err() || *shutdown.borrow() {
          return;
        }
        continue;
      }
    };
    let body = match next {
      Some(Ok(body)) => body,
      Some(Err(e)) => {
        warn!(error = %e, "peer read failed");
        return;
      }
      None => return,
    };
    let (frame, rejected) = match Frame::decode_partial(&body) {
      Ok(decoded) => decoded,
      Err(e) => {
        warn!(error = %e, "dropping undecodable frame");
        continue;
      }
    };
    for message in rejected {
      warn!(
        index = message.index,
        roots = message.roots.len(),
        error = %message.error,
        "dropping undecodable message"
      );
      dispatcher.fail(&message.roots, FailureReason::Transport);
    }
    for message in frame.messages {
      dispatcher.accept_remote(message).await;
    }
  }
}
