//! Inter-worker wire format.
//!
//! Every frame on a worker-to-worker connection carries one [`Frame`]: a
//! protocol version, a send timestamp and a batch of [`WireMessage`]s,
//! serialized as JSON. Framing itself (length prefix) is done by the
//! transport.
//!
//! Receivers decode message by message with [`Frame::decode_partial`], so a
//! single unreadable message does not take the rest of its batch with it.

use crate::ack::FailureReason;
use crate::error::TransportError;
use crate::tuple::{RootId, TaskId, Tuple, TupleId, Value};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Wire protocol version.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum WireVersion {
  /// Initial version.
  #[default]
  V1,
}

/// One message exchanged between workers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
  /// A routed tuple copy for a task hosted by the receiver.
  Tuple {
    /// Id of the copy.
    tuple_id: TupleId,
    /// Emitting task.
    source_task: TaskId,
    /// Stream emitted on.
    stream: String,
    /// Receiving task.
    destination_task: TaskId,
    /// Field values.
    values: Vec<Value>,
    /// Lineage.
    roots: BTreeSet<RootId>,
  },
  /// New pending units for a root owned by the receiver.
  Register {
    /// Root whose tree grows.
    root: RootId,
    /// Registered copies.
    tuple_ids: Vec<TupleId>,
  },
  /// A processed copy, for roots owned by the receiver.
  Ack {
    /// Acked copy.
    tuple_id: TupleId,
    /// Roots to credit.
    roots: BTreeSet<RootId>,
  },
  /// Failed roots owned by the receiver.
  Fail {
    /// Roots to fail.
    roots: BTreeSet<RootId>,
    /// Failure cause.
    reason: FailureReason,
  },
}

impl WireMessage {
  /// Wraps a routed copy for `destination`.
  pub fn tuple(destination: TaskId, tuple: Tuple) -> Self {
    WireMessage::Tuple {
      tuple_id: tuple.id,
      source_task: tuple.source_task,
      stream: tuple.stream,
      destination_task: destination,
      values: tuple.values,
      roots: tuple.roots,
    }
  }

  /// Tracked roots this message concerns.
  pub fn roots(&self) -> BTreeSet<RootId> {
    match self {
      WireMessage::Tuple { roots, .. }
      | WireMessage::Ack { roots, .. }
      | WireMessage::Fail { roots, .. } => roots.clone(),
      WireMessage::Register { root, .. } => BTreeSet::from([*root]),
    }
  }

  /// True for tuple payloads, false for ack bookkeeping.
  pub fn is_data(&self) -> bool {
    matches!(self, WireMessage::Tuple { .. })
  }

  /// Splits a tuple message into its destination and tuple.
  pub fn into_delivery(self) -> Option<(TaskId, Tuple)> {
    match self {
      WireMessage::Tuple {
        tuple_id,
        source_task,
        stream,
        destination_task,
        values,
        roots,
      } => Some((
        destination_task,
        Tuple {
          id: tuple_id,
          source_task,
          stream,
          values,
          roots,
        },
      )),
      _ => None,
    }
  }
}

/// Envelope of one transmitted batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
  /// Protocol version.
  pub version: WireVersion,
  /// When the batch was sent.
  pub sent_at: DateTime<Utc>,
  /// Messages, in send order.
  pub messages: Vec<WireMessage>,
}

impl Frame {
  /// Wraps `messages` stamped with the current time.
  pub fn new(messages: Vec<WireMessage>) -> Self {
    Self {
      version: WireVersion::default(),
      sent_at: Utc::now(),
      messages,
    }
  }

  /// Serializes the frame body.
  pub fn encode(&self) -> Result<Bytes, TransportError> {
    serde_json::to_vec(self)
      .map(Bytes::from)
      .map_err(|e| TransportError::Codec(e.to_string()))
  }

  /// Parses a frame body, failing on the first bad message.
  pub fn decode(body: &[u8]) -> Result<Self, TransportError> {
    serde_json::from_slice(body).map_err(codec_error)
  }

  /// Parses a frame body message by message.
  ///
  /// Fails only when the envelope is unreadable. Messages that do not decode
  /// are returned beside the frame holding the others.
  pub fn decode_partial(body: &[u8]) -> Result<(Self, Vec<RejectedMessage>), TransportError> {
    let raw: RawFrame = serde_json::from_slice(body).map_err(codec_error)?;
    let mut messages = Vec::with_capacity(raw.messages.len());
    let mut rejected = Vec::new();
    for (index, value) in raw.messages.iter().enumerate() {
      match WireMessage::deserialize(value) {
        Ok(message) => messages.push(message),
        Err(e) => rejected.push(RejectedMessage {
          index,
          roots: salvage_roots(value),
          error: codec_error(e),
        }),
      }
    }
    let frame = Frame {
      version: raw.version,
      sent_at: raw.sent_at,
      messages,
    };
    Ok((frame, rejected))
  }
}

/// A message of a received frame that could not be decoded.
#[derive(Debug)]
pub struct RejectedMessage {
  /// Position in the frame.
  pub index: usize,
  /// Roots the message names, as far as they can still be read.
  pub roots: BTreeSet<RootId>,
  /// Why decoding failed.
  pub error: TransportError,
}

#[derive(Deserialize)]
struct RawFrame {
  version: WireVersion,
  sent_at: DateTime<Utc>,
  messages: Vec<serde_json::Value>,
}

fn salvage_roots(value: &serde_json::Value) -> BTreeSet<RootId> {
  if let Some(roots) = value.get("roots") {
    return BTreeSet::<RootId>::deserialize(roots).unwrap_or_default();
  }
  value
    .get("root")
    .and_then(|root| RootId::deserialize(root).ok())
    .into_iter()
    .collect()
}

fn codec_error(e: serde_json::Error) -> TransportError {
  TransportError::Codec(e.to_string())
}
