// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Mapping of username fragments to the agents that own them

use dashmap::{mapref::entry::Entry, DashMap};
use std::{
  borrow::Borrow,
  sync::{Arc, Weak},
};

use super::agent::Agent;

/// A local ICE username fragment, the key connections are routed by
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
#[repr(transparent)]
pub struct Ufrag(Arc<String>);

impl Ufrag {
  pub fn new<T: std::convert::Into<String>>(t: T) -> Ufrag {
    Ufrag(Arc::new(t.into()))
  }

  pub fn raw(&self) -> &str {
    &self.0
  }
}

impl Borrow<str> for Ufrag {
  fn borrow(&self) -> &str {
    self.raw()
  }
}

impl std::fmt::Debug for Ufrag {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Ufrag").field(&self.0).finish()
  }
}

impl std::fmt::Display for Ufrag {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.raw())
  }
}

/// Registry of live sessions, safe to share between connection tasks
///
/// Agents are held weakly; their owner decides their lifetime. Each operation
/// is atomic with respect to the others for a given fragment, and at most one
/// agent is registered per fragment at any time.
pub struct SessionRegistry {
  sessions: DashMap<Ufrag, Weak<dyn Agent>>,
}

impl SessionRegistry {
  pub fn new() -> Self {
    Self {
      sessions: DashMap::new(),
    }
  }

  /// Registers `agent` under `ufrag` unless a live agent already holds it.
  ///
  /// Returns whether the registration was made.
  pub fn add(&self, ufrag: Ufrag, agent: Weak<dyn Agent>) -> bool {
    match self.sessions.entry(ufrag) {
      Entry::Occupied(mut occupied) => {
        if occupied.get().strong_count() == 0 {
          tracing::debug!(ufrag = %occupied.key(), "replacing registration left by a dropped agent");
          occupied.insert(agent);
          true
        } else {
          tracing::warn!(ufrag = %occupied.key(), "agent already registered; ignoring");
          false
        }
      }
      Entry::Vacant(vacant) => {
        tracing::debug!(ufrag = %vacant.key(), "agent registered");
        vacant.insert(agent);
        true
      }
    }
  }

  /// Removes the registration for `ufrag`, returning whether one existed
  pub fn remove(&self, ufrag: &str) -> bool {
    match self.sessions.remove(ufrag) {
      Some(_) => {
        tracing::debug!(ufrag, "agent deregistered");
        true
      }
      None => {
        tracing::warn!(ufrag, "agent not registered; ignoring removal");
        false
      }
    }
  }

  /// Finds the live agent registered under `ufrag`.
  ///
  /// Registrations whose agent has been dropped are pruned and reported as absent.
  pub fn lookup(&self, ufrag: &str) -> Option<Arc<dyn Agent>> {
    let agent = self.sessions.get(ufrag).map(|entry| entry.value().upgrade())?;
    if agent.is_none() {
      self
        .sessions
        .remove_if(ufrag, |_, weak| weak.strong_count() == 0);
      tracing::debug!(ufrag, "pruned registration of dropped agent");
    }
    agent
  }

  pub fn contains(&self, ufrag: &str) -> bool {
    self.sessions.contains_key(ufrag)
  }

  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }
}

impl Default for SessionRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for SessionRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionRegistry")
      .field("sessions", &self.sessions.len())
      .finish_non_exhaustive()
  }
}
