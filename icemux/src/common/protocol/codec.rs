// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connectivity-check (STUN, RFC 5389) recognition and decoding
//!
//! Wire handling is delegated to the `stun` crate; integrity and fingerprint
//! validation belong to the agent.

use stun::{
  attributes::ATTR_USERNAME,
  message::{is_message, Message},
  textattrs::TextAttribute,
};

pub use stun::Error as CodecError;

/// Recognises and decodes connectivity-check messages found in connection frames
#[cfg_attr(test, mockall::automock)]
pub trait ControlCodec: Send + Sync {
  fn is_control_message(&self, buffer: &[u8]) -> bool;

  fn decode(&self, buffer: &[u8]) -> Result<Message, CodecError>;

  /// Text of the message's USERNAME attribute
  fn username(&self, message: &Message) -> Result<String, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StunCodec;

impl ControlCodec for StunCodec {
  fn is_control_message(&self, buffer: &[u8]) -> bool {
    is_message(buffer)
  }

  fn decode(&self, buffer: &[u8]) -> Result<Message, CodecError> {
    let mut message = Message::new();
    message.unmarshal_binary(buffer)?;
    Ok(message)
  }

  fn username(&self, message: &Message) -> Result<String, CodecError> {
    TextAttribute::get_from_as(message, ATTR_USERNAME).map(|username| username.text)
  }
}
