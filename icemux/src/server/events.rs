// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Counters and event hooks for observing dispatch, including the points where data is dropped

use serde::Serialize;
use std::{
  net::SocketAddr,
  sync::atomic::{AtomicU64, Ordering},
};

use crate::common::{agent::ConnectionId, registry::Ufrag};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
  /// Opaque data arrived before any connectivity check bound the connection
  Unbound,
  /// The bound agent's payload sink refused the data
  SinkFull,
  /// The bound agent's payload sink no longer accepts data
  SinkClosed,
}

#[derive(Clone, Debug)]
pub enum DispatchEvent {
  Bound {
    connection: ConnectionId,
    ufrag: Ufrag,
    remote: SocketAddr,
  },
  PayloadDropped {
    connection: ConnectionId,
    reason: DropReason,
    len: usize,
  },
  Closed {
    connection: ConnectionId,
    remote: SocketAddr,
  },
}

#[derive(Debug, Default)]
pub struct DispatchStats {
  connections_accepted: AtomicU64,
  connections_closed: AtomicU64,
  frames_read: AtomicU64,
  control_messages: AtomicU64,
  inbound_dispatched: AtomicU64,
  inbound_skipped_no_candidate: AtomicU64,
  payload_frames_forwarded: AtomicU64,
  payload_bytes_forwarded: AtomicU64,
  dropped_unbound: AtomicU64,
  dropped_sink_full: AtomicU64,
  dropped_sink_closed: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize)]
pub struct DispatchStatsSnapshot {
  pub connections_accepted: u64,
  pub connections_closed: u64,
  pub frames_read: u64,
  pub control_messages: u64,
  pub inbound_dispatched: u64,
  pub inbound_skipped_no_candidate: u64,
  pub payload_frames_forwarded: u64,
  pub payload_bytes_forwarded: u64,
  pub dropped_unbound: u64,
  pub dropped_sink_full: u64,
  pub dropped_sink_closed: u64,
}

fn bump(counter: &AtomicU64) {
  counter.fetch_add(1, Ordering::Relaxed);
}

impl DispatchStats {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn connection_accepted(&self) {
    bump(&self.connections_accepted);
  }

  pub(crate) fn connection_closed(&self) {
    bump(&self.connections_closed);
  }

  pub(crate) fn frame_read(&self) {
    bump(&self.frames_read);
  }

  pub(crate) fn control_message(&self) {
    bump(&self.control_messages);
  }

  pub(crate) fn inbound_dispatched(&self) {
    bump(&self.inbound_dispatched);
  }

  pub(crate) fn inbound_skipped(&self) {
    bump(&self.inbound_skipped_no_candidate);
  }

  pub(crate) fn payload_forwarded(&self, len: usize) {
    bump(&self.payload_frames_forwarded);
    self
      .payload_bytes_forwarded
      .fetch_add(len as u64, Ordering::Relaxed);
  }

  pub(crate) fn payload_dropped(&self, reason: DropReason) {
    match reason {
      DropReason::Unbound => bump(&self.dropped_unbound),
      DropReason::SinkFull => bump(&self.dropped_sink_full),
      DropReason::SinkClosed => bump(&self.dropped_sink_closed),
    }
  }

  pub fn snapshot(&self) -> DispatchStatsSnapshot {
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    DispatchStatsSnapshot {
      connections_accepted: load(&self.connections_accepted),
      connections_closed: load(&self.connections_closed),
      frames_read: load(&self.frames_read),
      control_messages: load(&self.control_messages),
      inbound_dispatched: load(&self.inbound_dispatched),
      inbound_skipped_no_candidate: load(&self.inbound_skipped_no_candidate),
      payload_frames_forwarded: load(&self.payload_frames_forwarded),
      payload_bytes_forwarded: load(&self.payload_bytes_forwarded),
      dropped_unbound: load(&self.dropped_unbound),
      dropped_sink_full: load(&self.dropped_sink_full),
      dropped_sink_closed: load(&self.dropped_sink_closed),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{DispatchStats, DropReason};

  #[test]
  fn snapshot_reflects_counters() {
    let stats = DispatchStats::new();
    stats.frame_read();
    stats.frame_read();
    stats.payload_forwarded(64);
    stats.payload_dropped(DropReason::Unbound);
    stats.payload_dropped(DropReason::SinkFull);
    stats.payload_dropped(DropReason::SinkFull);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.frames_read, 2);
    assert_eq!(snapshot.payload_frames_forwarded, 1);
    assert_eq!(snapshot.payload_bytes_forwarded, 64);
    assert_eq!(snapshot.dropped_unbound, 1);
    assert_eq!(snapshot.dropped_sink_full, 2);
  }

  #[test]
  fn snapshot_serializes_to_json() {
    let stats = DispatchStats::new();
    stats.connection_accepted();
    let json = serde_json::to_value(stats.snapshot()).unwrap();
    assert_eq!(json["connections_accepted"], 1);
    assert_eq!(json["dropped_sink_full"], 0);
  }
}
