// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Agent fixture which records everything the multiplexer hands it

use std::{
  collections::HashMap,
  net::SocketAddr,
  sync::Mutex,
};

use stun::{
  attributes::ATTR_USERNAME,
  agent::TransactionId,
  message::{Message, Setter, BINDING_REQUEST},
  textattrs::TextAttribute,
};

use super::{Agent, Candidate, NetworkType, PayloadBuffer, SinkError, TransportSlot};

/// Encoded binding request with a fresh transaction id, optionally carrying a USERNAME
pub fn binding_request(username: Option<&str>) -> Message {
  let mut setters: Vec<Box<dyn Setter>> =
    vec![Box::new(BINDING_REQUEST), Box::new(TransactionId::new())];
  if let Some(username) = username {
    setters.push(Box::new(TextAttribute::new(ATTR_USERNAME, username.to_owned())));
  }
  let mut message = Message::new();
  message
    .build(&setters)
    .expect("Binding request fixture must encode");
  message
}

#[derive(Debug, Clone)]
pub struct InboundCall {
  pub message: Message,
  pub local: Candidate,
  pub remote: SocketAddr,
}

#[derive(Debug)]
pub struct RecordingAgent {
  ufrag: String,
  candidates: Mutex<HashMap<NetworkType, Vec<Candidate>>>,
  inbound: Mutex<Vec<InboundCall>>,
  pub sink: PayloadBuffer,
  transport: TransportSlot,
}

impl RecordingAgent {
  pub fn new(ufrag: &str, sink_limit: usize) -> Self {
    Self {
      ufrag: ufrag.into(),
      candidates: Mutex::new(HashMap::new()),
      inbound: Mutex::new(Vec::new()),
      sink: PayloadBuffer::new(sink_limit),
      transport: TransportSlot::new(),
    }
  }

  pub fn with_candidate(self, candidate: Candidate) -> Self {
    self
      .candidates
      .lock()
      .unwrap()
      .entry(candidate.network_type)
      .or_default()
      .push(candidate);
    self
  }

  pub fn inbound_calls(&self) -> Vec<InboundCall> {
    self.inbound.lock().unwrap().clone()
  }

  pub fn inbound_count(&self) -> usize {
    self.inbound.lock().unwrap().len()
  }
}

impl Agent for RecordingAgent {
  fn local_ufrag(&self) -> String {
    self.ufrag.clone()
  }

  fn local_candidates(&self, network_type: NetworkType) -> Vec<Candidate> {
    self
      .candidates
      .lock()
      .unwrap()
      .get(&network_type)
      .cloned()
      .unwrap_or_default()
  }

  fn handle_inbound(&self, message: &Message, local: &Candidate, remote: SocketAddr) {
    self.inbound.lock().unwrap().push(InboundCall {
      message: message.clone(),
      local: local.clone(),
      remote,
    });
  }

  fn write_payload(&self, payload: &[u8]) -> Result<usize, SinkError> {
    self.sink.write(payload)
  }

  fn transport(&self) -> &TransportSlot {
    &self.transport
  }
}
