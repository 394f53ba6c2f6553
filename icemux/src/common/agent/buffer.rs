// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  collections::VecDeque,
  sync::{Mutex, MutexGuard},
};
use tokio::sync::Notify;

use super::SinkError;

#[derive(Debug, Default)]
struct BufferState {
  packets: VecDeque<Vec<u8>>,
  buffered: usize,
  closed: bool,
}

/// Bounded packet queue used as an agent's payload sink
///
/// Writes never block: a packet that would take the buffered byte count past
/// the limit is refused whole with [`SinkError::CapacityExceeded`].
#[derive(Debug)]
pub struct PayloadBuffer {
  limit: usize,
  state: Mutex<BufferState>,
  readable: Notify,
}

impl PayloadBuffer {
  pub fn new(limit: usize) -> Self {
    Self {
      limit,
      state: Mutex::new(BufferState::default()),
      readable: Notify::new(),
    }
  }

  fn state(&self) -> MutexGuard<'_, BufferState> {
    // A writer cannot leave the state half-updated, so a poisoned lock is still consistent
    self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn limit(&self) -> usize {
    self.limit
  }

  /// Bytes currently queued
  pub fn buffered(&self) -> usize {
    self.state().buffered
  }

  /// Packets currently queued
  pub fn len(&self) -> usize {
    self.state().packets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn write(&self, packet: &[u8]) -> Result<usize, SinkError> {
    {
      let mut state = self.state();
      if state.closed {
        return Err(SinkError::Closed);
      }
      if state.buffered + packet.len() > self.limit {
        return Err(SinkError::CapacityExceeded {
          limit: self.limit,
          buffered: state.buffered,
          attempted: packet.len(),
        });
      }
      state.buffered += packet.len();
      state.packets.push_back(packet.to_vec());
    }
    self.readable.notify_one();
    Ok(packet.len())
  }

  /// Takes the oldest packet without waiting
  pub fn try_read(&self) -> Option<Vec<u8>> {
    let mut state = self.state();
    let packet = state.packets.pop_front()?;
    state.buffered -= packet.len();
    Some(packet)
  }

  /// Waits for the next packet; returns [`SinkError::Closed`] once closed and drained
  pub async fn read(&self) -> Result<Vec<u8>, SinkError> {
    loop {
      {
        let mut state = self.state();
        if let Some(packet) = state.packets.pop_front() {
          state.buffered -= packet.len();
          return Ok(packet);
        }
        if state.closed {
          return Err(SinkError::Closed);
        }
      }
      self.readable.notified().await;
    }
  }

  /// Refuses further writes and wakes any waiting reader
  pub fn close(&self) {
    self.state().closed = true;
    self.readable.notify_waiters();
    self.readable.notify_one();
  }
}
