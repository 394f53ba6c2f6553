// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection dispatch: binds a connection to an agent and forwards its traffic
//!
//! A connection starts unbound. The first connectivity check whose username
//! fragment resolves in the [`SessionRegistry`] binds it; opaque frames are then
//! written to the bound agent's payload sink. Any read, decode, credential, or
//! lookup failure closes the connection without a reply to the peer.

use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use stun::message::Message;
use tokio::{io::AsyncRead, sync::broadcast::Sender as Broadcaster};

use crate::{
  common::{
    agent::{same_agent, Agent, ConnectionHandle, SinkError},
    protocol::{classify, Classified, ClassifyError, CodecError, ControlCodec},
    registry::{SessionRegistry, Ufrag},
  },
  util::framed::{read_frame, ReadError},
};

use super::events::{DispatchEvent, DispatchStats, DropReason};

/// Which agent receives connectivity checks once a connection is bound
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityPolicy {
  /// Checks go to the agent the connection was first bound to, whatever their fragment resolves to
  #[default]
  Connection,
  /// Checks go to the agent their own fragment resolves to; payload stays with the first binding
  Message,
  /// The connection rebinds to each newly resolved agent, payload included
  Latest,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct DispatchOptions {
  pub affinity: AffinityPolicy,
  /// Upper bound on waiting for a single frame; `None` waits indefinitely
  pub read_timeout: Option<Duration>,
  pub max_frame_length: Option<usize>,
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
  #[error("Failed reading frame: {0}")]
  FrameRead(#[from] ReadError),
  #[error("No frame arrived within {0:?}")]
  ReadTimeout(Duration),
  #[error("Malformed connectivity check: {0}")]
  Decode(CodecError),
  #[error("Connectivity check without usable credential: {0}")]
  MissingCredential(CodecError),
  #[error("No agent registered for username fragment {ufrag}")]
  UnknownSession { ufrag: Ufrag },
}

impl From<ClassifyError> for DispatchError {
  fn from(e: ClassifyError) -> Self {
    match e {
      ClassifyError::Decode(e) => Self::Decode(e),
      ClassifyError::MissingCredential(e) => Self::MissingCredential(e),
    }
  }
}

/// Association between a connection and the agent its traffic belongs to
#[derive(Clone)]
pub enum Binding {
  Unbound,
  Bound { ufrag: Ufrag, agent: Arc<dyn Agent> },
}

impl Binding {
  pub fn agent(&self) -> Option<&Arc<dyn Agent>> {
    match self {
      Binding::Unbound => None,
      Binding::Bound { agent, .. } => Some(agent),
    }
  }

  pub fn is_bound(&self) -> bool {
    matches!(self, Binding::Bound { .. })
  }
}

impl std::fmt::Debug for Binding {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Binding::Unbound => f.write_str("Unbound"),
      Binding::Bound { ufrag, .. } => f.debug_struct("Bound").field("ufrag", ufrag).finish_non_exhaustive(),
    }
  }
}

/// State shared by the dispatchers of every connection accepted by one server
#[derive(Clone)]
pub struct DispatchContext {
  registry: Arc<SessionRegistry>,
  codec: Arc<dyn ControlCodec>,
  stats: Arc<DispatchStats>,
  events: Broadcaster<DispatchEvent>,
  options: DispatchOptions,
}

impl DispatchContext {
  pub fn new(
    registry: Arc<SessionRegistry>,
    codec: Arc<dyn ControlCodec>,
    options: DispatchOptions,
    event_capacity: usize,
  ) -> Self {
    Self {
      registry,
      codec,
      stats: Arc::new(DispatchStats::new()),
      // Receivers are created on demand through `subscribe`
      events: tokio::sync::broadcast::channel(event_capacity.max(1)).0,
      options,
    }
  }

  pub fn registry(&self) -> &Arc<SessionRegistry> {
    &self.registry
  }

  pub fn stats(&self) -> &Arc<DispatchStats> {
    &self.stats
  }

  pub fn options(&self) -> &DispatchOptions {
    &self.options
  }

  pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DispatchEvent> {
    self.events.subscribe()
  }

  fn emit(&self, event: DispatchEvent) {
    // Fails only when nobody is subscribed
    let _ = self.events.send(event);
  }
}

impl std::fmt::Debug for DispatchContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DispatchContext")
      .field("registry", &self.registry)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

/// Owns the inbound half of one connection and everything known about it
pub struct ConnectionDispatcher<R> {
  context: DispatchContext,
  reader: R,
  handle: ConnectionHandle,
  binding: Binding,
}

impl<R> ConnectionDispatcher<R>
where
  R: AsyncRead + Unpin + Send,
{
  pub fn new(context: DispatchContext, reader: R, handle: ConnectionHandle) -> Self {
    Self {
      context,
      reader,
      handle,
      binding: Binding::Unbound,
    }
  }

  pub fn binding(&self) -> &Binding {
    &self.binding
  }

  /// Processes frames in arrival order until the connection ends.
  ///
  /// Returns `Ok` when the peer closes the stream between frames. The
  /// connection handle is closed on return, including clones held by agents.
  pub async fn run(mut self) -> Result<(), DispatchError> {
    let result = self.dispatch_frames().await;
    self.handle.close().await;
    self.context.stats.connection_closed();
    self.context.emit(DispatchEvent::Closed {
      connection: self.handle.id(),
      remote: self.handle.remote_addr(),
    });
    result
  }

  async fn dispatch_frames(&mut self) -> Result<(), DispatchError> {
    loop {
      let frame = match self.next_frame().await {
        Ok(frame) => frame,
        Err(DispatchError::FrameRead(ReadError::EndOfStream)) => {
          tracing::debug!("peer closed connection");
          return Ok(());
        }
        Err(e) => return Err(e),
      };
      self.context.stats.frame_read();
      self.process_frame(frame)?;
    }
  }

  async fn next_frame(&mut self) -> Result<Vec<u8>, DispatchError> {
    let max_frame_length = self.context.options.max_frame_length;
    let read = read_frame(&mut self.reader, max_frame_length);
    match self.context.options.read_timeout {
      None => Ok(read.await?),
      Some(limit) => tokio::time::timeout(limit, read)
        .await
        .map_err(|_| DispatchError::ReadTimeout(limit))?
        .map_err(DispatchError::from),
    }
  }

  fn process_frame(&mut self, frame: Vec<u8>) -> Result<(), DispatchError> {
    match classify(self.context.codec.as_ref(), frame)? {
      Classified::Control { message, ufrag } => self.dispatch_control(message, ufrag),
      Classified::Payload(payload) => {
        self.forward_payload(&payload);
        Ok(())
      }
    }
  }

  #[tracing::instrument(level = "debug", skip(self, message), fields(connection = %self.handle.id()))]
  fn dispatch_control(&mut self, message: Message, ufrag: Ufrag) -> Result<(), DispatchError> {
    self.context.stats.control_message();
    let resolved = match self.context.registry.lookup(ufrag.raw()) {
      Some(agent) => agent,
      None => {
        tracing::debug!(%ufrag, "no agent registered for username fragment");
        return Err(DispatchError::UnknownSession { ufrag });
      }
    };

    let bound = self.binding.agent().cloned();
    let target = match bound {
      None => {
        self.bind(ufrag, Arc::clone(&resolved));
        resolved
      }
      Some(bound) => match self.context.options.affinity {
        AffinityPolicy::Connection => {
          if !same_agent(&bound, &resolved) {
            tracing::debug!(%ufrag, "fragment resolves to another agent; keeping connection affinity");
          }
          bound
        }
        AffinityPolicy::Message => resolved,
        AffinityPolicy::Latest => {
          if !same_agent(&bound, &resolved) {
            self.bind(ufrag, Arc::clone(&resolved));
          }
          resolved
        }
      },
    };

    if target.transport().attach(self.handle.clone()) {
      tracing::debug!("connection associated as agent transport");
    }

    let network_type = self.handle.network_type();
    match target.local_candidates(network_type).into_iter().next() {
      Some(candidate) => {
        target.handle_inbound(&message, &candidate, self.handle.remote_addr());
        self.context.stats.inbound_dispatched();
      }
      None => {
        tracing::trace!(%network_type, "agent has no local candidate for this transport");
        self.context.stats.inbound_skipped();
      }
    }
    Ok(())
  }

  fn bind(&mut self, ufrag: Ufrag, agent: Arc<dyn Agent>) {
    tracing::debug!(%ufrag, "connection bound to agent");
    self.context.emit(DispatchEvent::Bound {
      connection: self.handle.id(),
      ufrag: ufrag.clone(),
      remote: self.handle.remote_addr(),
    });
    self.binding = Binding::Bound { ufrag, agent };
  }

  fn forward_payload(&self, payload: &[u8]) {
    let len = payload.len();
    let agent = match self.binding.agent() {
      Some(agent) => agent,
      None => {
        tracing::trace!(len, "discarding payload received before binding");
        return self.payload_dropped(DropReason::Unbound, len);
      }
    };
    match agent.write_payload(payload) {
      Ok(_) => self.context.stats.payload_forwarded(len),
      Err(e) => {
        tracing::warn!(error = %e, len, "failed to write payload to agent");
        let reason = match e {
          SinkError::CapacityExceeded { .. } => DropReason::SinkFull,
          SinkError::Closed => DropReason::SinkClosed,
        };
        self.payload_dropped(reason, len);
      }
    }
  }

  fn payload_dropped(&self, reason: DropReason, len: usize) {
    self.context.stats.payload_dropped(reason);
    self.context.emit(DispatchEvent::PayloadDropped {
      connection: self.handle.id(),
      reason,
      len,
    });
  }
}
