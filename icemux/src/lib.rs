// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! ICE-TCP connection multiplexer
//!
//! Accepts length-prefixed TCP connections on a single port, identifies the ICE
//! session each one belongs to from the username of its first connectivity
//! check, and hands the connection's traffic to that session's [`Agent`].
//!
//! [`Agent`]: common::agent::Agent

pub mod common;
pub mod server;
pub mod util;

pub use common::{
  agent::{Agent, Candidate, ConnectionHandle, NetworkType, PayloadBuffer, SinkError, TransportSlot},
  registry::{SessionRegistry, Ufrag},
};
pub use server::{AffinityPolicy, Server, ServerConfig, ServerError};
