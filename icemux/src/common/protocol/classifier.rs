// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Splits connection frames into connectivity checks and opaque application data

use stun::message::Message;

use crate::common::registry::Ufrag;

use super::codec::{CodecError, ControlCodec};

/// Separator between local and remote fragments in a USERNAME attribute
pub const USERNAME_SEPARATOR: char = ':';

#[derive(Debug)]
pub enum Classified {
  /// A decoded connectivity check, with the fragment that identifies its session
  Control { message: Message, ufrag: Ufrag },
  /// Application data, passed on uninterpreted
  Payload(Vec<u8>),
}

#[derive(thiserror::Error, Debug)]
pub enum ClassifyError {
  #[error("Failed to decode connectivity check: {0}")]
  Decode(#[source] CodecError),
  #[error("Connectivity check carries no usable username: {0}")]
  MissingCredential(#[source] CodecError),
}

/// Local fragment of a `local:remote` username; trailing fragments are not inspected.
pub fn local_fragment(username: &str) -> &str {
  username
    .split(USERNAME_SEPARATOR)
    .next()
    .unwrap_or(username)
}

/// Classifies a single frame without side effects
pub fn classify<C>(codec: &C, frame: Vec<u8>) -> Result<Classified, ClassifyError>
where
  C: ControlCodec + ?Sized,
{
  if !codec.is_control_message(&frame) {
    return Ok(Classified::Payload(frame));
  }
  let message = codec.decode(&frame).map_err(ClassifyError::Decode)?;
  tracing::trace!(%message, "decoded connectivity check");
  let username = codec
    .username(&message)
    .map_err(ClassifyError::MissingCredential)?;
  let ufrag = Ufrag::new(local_fragment(&username));
  Ok(Classified::Control { message, ufrag })
}
