// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Accept-loop lifetime: who may end it, and whether it is still running

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Shutdown signal as seen by connection tasks, which may observe it but never trigger it
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct ShutdownListener {
  token: CancellationToken,
}

impl ShutdownListener {
  pub fn is_shutdown(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn shutdown_requested(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for ShutdownListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

/// Set while an accept loop runs
#[derive(Debug, Default)]
pub struct LivenessFlag {
  live: Arc<AtomicBool>,
}

impl LivenessFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_live(&self) -> bool {
    self.live.load(Ordering::SeqCst)
  }

  /// Raises the flag until the returned guard is dropped
  pub fn raise(&self) -> LiveGuard {
    self.live.store(true, Ordering::SeqCst);
    LiveGuard {
      live: Arc::clone(&self.live),
    }
  }
}

/// Lowers its [`LivenessFlag`] on drop, including when the owning task is aborted
#[must_use = "the flag is lowered as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LiveGuard {
  live: Arc<AtomicBool>,
}

impl Drop for LiveGuard {
  fn drop(&mut self) {
    self.live.store(false, Ordering::SeqCst);
  }
}
