// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire-level protocol handling for ICE-TCP connections
//!
//! Every frame on a connection is either a connectivity check, which names the
//! session it belongs to through its USERNAME attribute, or opaque data for
//! whichever session the connection has already been bound to.

pub mod classifier;
pub mod codec;

pub use classifier::{classify, Classified, ClassifyError};
pub use codec::{CodecError, ControlCodec, StunCodec};
