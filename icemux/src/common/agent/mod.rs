// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The per-session ICE agent, as seen by the connection multiplexer
//!
//! Agents own their credentials, candidates, and connectivity-check state; the
//! multiplexer only hands them the traffic that belongs to them.

use downcast_rs::{impl_downcast, DowncastSync};
use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};
use stun::message::Message;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::util::framed::{write_frame, WriteError};

pub mod buffer;
#[cfg(test)]
pub(crate) mod testing;

pub use buffer::PayloadBuffer;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum NetworkType {
  Udp4,
  Udp6,
  Tcp4,
  Tcp6,
}

impl NetworkType {
  /// TCP network type matching the address family of a socket address
  pub fn tcp_for(addr: &SocketAddr) -> Self {
    match addr {
      SocketAddr::V4(_) => Self::Tcp4,
      SocketAddr::V6(_) => Self::Tcp6,
    }
  }

  pub fn is_tcp(&self) -> bool {
    matches!(self, Self::Tcp4 | Self::Tcp6)
  }
}

impl std::fmt::Display for NetworkType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Self::Udp4 => "udp4",
      Self::Udp6 => "udp6",
      Self::Tcp4 => "tcp4",
      Self::Tcp6 => "tcp6",
    })
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CandidateType {
  Host,
  ServerReflexive,
  PeerReflexive,
  Relay,
}

impl CandidateType {
  /// Recommended type preference (RFC 8445 section 5.1.2.2)
  pub fn preference(&self) -> u32 {
    match self {
      Self::Host => 126,
      Self::PeerReflexive => 110,
      Self::ServerReflexive => 100,
      Self::Relay => 0,
    }
  }
}

/// A local transport address an agent can be reached on
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Candidate {
  pub network_type: NetworkType,
  pub address: SocketAddr,
  pub kind: CandidateType,
  pub priority: u32,
}

impl Candidate {
  pub fn new(network_type: NetworkType, address: SocketAddr, kind: CandidateType) -> Self {
    const LOCAL_PREFERENCE: u32 = 65535;
    const COMPONENT: u32 = 1;
    Self {
      network_type,
      address,
      kind,
      priority: (kind.preference() << 24) | (LOCAL_PREFERENCE << 8) | (256 - COMPONENT),
    }
  }

  pub fn host(network_type: NetworkType, address: SocketAddr) -> Self {
    Self::new(network_type, address, CandidateType::Host)
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
  #[error("Payload sink full: {buffered} of {limit} bytes buffered, {attempted} more attempted")]
  CapacityExceeded {
    limit: usize,
    buffered: usize,
    attempted: usize,
  },
  #[error("Payload sink closed")]
  Closed,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
  pub fn new(inner: u64) -> ConnectionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for ConnectionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl std::fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "conn-{}", self.0)
  }
}

#[derive(Debug, Default)]
pub struct MonotonicConnectionIds {
  next: AtomicU64,
}

impl MonotonicConnectionIds {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> ConnectionId {
    ConnectionId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Outbound side of an accepted connection, shared with the agent it is bound to
///
/// Inbound frames are consumed by the multiplexer; agents answer connectivity
/// checks by writing frames back through this handle. Once the multiplexer
/// stops reading it closes the handle, which releases the socket for every clone.
#[derive(Clone)]
pub struct ConnectionHandle {
  id: ConnectionId,
  local_addr: SocketAddr,
  remote_addr: SocketAddr,
  writer: Arc<tokio::sync::Mutex<Option<BoxedWriter>>>,
}

impl ConnectionHandle {
  pub fn new<W>(id: ConnectionId, local_addr: SocketAddr, remote_addr: SocketAddr, writer: W) -> Self
  where
    W: AsyncWrite + Send + Unpin + 'static,
  {
    Self {
      id,
      local_addr,
      remote_addr,
      writer: Arc::new(tokio::sync::Mutex::new(Some(Box::new(writer)))),
    }
  }

  pub fn id(&self) -> ConnectionId {
    self.id
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn remote_addr(&self) -> SocketAddr {
    self.remote_addr
  }

  pub fn network_type(&self) -> NetworkType {
    NetworkType::tcp_for(&self.local_addr)
  }

  /// Writes one length-prefixed frame to the peer
  pub async fn send(&self, payload: &[u8]) -> Result<(), WriteError> {
    let mut writer = self.writer.lock().await;
    match writer.as_mut() {
      Some(writer) => write_frame(writer, payload).await,
      None => Err(WriteError::Closed),
    }
  }

  /// Shuts down and drops the write half; later sends fail with [WriteError::Closed]
  pub async fn close(&self) {
    let writer = self.writer.lock().await.take();
    if let Some(mut writer) = writer {
      if let Err(error) = writer.shutdown().await {
        tracing::trace!(id = %self.id, ?error, "write half shutdown failed");
      }
    }
  }

  pub async fn is_closed(&self) -> bool {
    self.writer.lock().await.is_none()
  }
}

impl std::fmt::Debug for ConnectionHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionHandle")
      .field("id", &self.id)
      .field("local_addr", &self.local_addr)
      .field("remote_addr", &self.remote_addr)
      .finish_non_exhaustive()
  }
}

/// Set-once association between an agent and the connection it answers on
#[derive(Debug, Default)]
pub struct TransportSlot {
  handle: tokio::sync::OnceCell<ConnectionHandle>,
}

impl TransportSlot {
  pub fn new() -> Self {
    Self::default()
  }

  /// Stores the handle if none is present; returns whether this call stored it
  pub fn attach(&self, handle: ConnectionHandle) -> bool {
    self.handle.set(handle).is_ok()
  }

  pub fn get(&self) -> Option<&ConnectionHandle> {
    self.handle.get()
  }

  pub fn is_attached(&self) -> bool {
    self.handle.initialized()
  }
}

/// An ICE session that connections can be routed to
pub trait Agent: DowncastSync {
  /// Local username fragment; connectivity checks addressed to this agent carry it first
  fn local_ufrag(&self) -> String;

  /// Local candidates of the given network type, in the agent's preferred order
  fn local_candidates(&self, network_type: NetworkType) -> Vec<Candidate>;

  /// Receives a connectivity check which arrived at `local` from `remote`
  fn handle_inbound(&self, message: &Message, local: &Candidate, remote: SocketAddr);

  /// Accepts application data for the session, failing when its buffer is full
  fn write_payload(&self, payload: &[u8]) -> Result<usize, SinkError>;

  fn transport(&self) -> &TransportSlot;
}
impl_downcast!(sync Agent);

/// Identity comparison between agent references
pub fn same_agent(a: &Arc<dyn Agent>, b: &Arc<dyn Agent>) -> bool {
  std::ptr::eq(
    Arc::as_ptr(a) as *const (),
    Arc::as_ptr(b) as *const (),
  )
}
