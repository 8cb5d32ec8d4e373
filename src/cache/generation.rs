//! Generation lifecycle and in-flight tracking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// Lifecycle of a store generation.
///
/// `Empty -> Populating -> Ready -> Active -> Retiring -> Deleted`, with
/// `Failed` as the terminal state of an unsuccessful population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  Empty,
  /// Populating manifest entries; `attempt` starts at 1
  Populating { attempt: u32 },
  /// Every manifest entry is stored, not yet serving
  Ready,
  /// Serving intercepted requests
  Active,
  /// Waiting out the grace period and in-flight readers before deletion
  Retiring { since: DateTime<Utc> },
  Deleted,
  Failed,
}

impl GenerationState {
  /// Whether moving from `self` to `next` is a legal lifecycle step.
  pub fn can_become(self, next: GenerationState) -> bool {
    use GenerationState::*;
    match (self, next) {
      (Empty, Populating { attempt: 1 }) => true,
      (Populating { attempt: a }, Populating { attempt: b }) => b == a + 1,
      (Populating { .. }, Ready | Failed) => true,
      (Ready, Active | Retiring { .. }) => true,
      (Empty | Populating { .. } | Failed, Retiring { .. }) => true,
      (Active, Retiring { .. }) => true,
      (Retiring { .. }, Deleted) => true,
      // A fresh initialize may pick a generation back up
      (Ready | Retiring { .. } | Failed | Deleted, Populating { attempt: 1 }) => true,
      _ => false,
    }
  }

  pub fn is_serving(self) -> bool {
    matches!(self, GenerationState::Active)
  }
}

/// Shared handle to one generation, counting requests that still read it.
#[derive(Debug)]
pub(crate) struct Generation {
  version: String,
  in_flight: AtomicUsize,
  idle: Notify,
}

impl Generation {
  pub(crate) fn new(version: &str) -> Arc<Self> {
    Arc::new(Self {
      version: version.to_string(),
      in_flight: AtomicUsize::new(0),
      idle: Notify::new(),
    })
  }

  pub(crate) fn version(&self) -> &str {
    &self.version
  }

  pub(crate) fn in_flight(&self) -> usize {
    self.in_flight.load(Ordering::SeqCst)
  }

  /// Register a reader. The returned guard releases it on drop.
  pub(crate) fn enter(self: &Arc<Self>) -> InFlight {
    self.in_flight.fetch_add(1, Ordering::SeqCst);
    InFlight(Arc::clone(self))
  }

  /// Resolve once no reader holds this generation.
  pub(crate) async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notified();
      tokio::pin!(notified);
      // Register before checking so a release in between is not missed
      notified.as_mut().enable();
      if self.in_flight() == 0 {
        return;
      }
      notified.await;
    }
  }
}

/// Guard held by an intercepted request for the generation it reads.
#[derive(Debug)]
pub(crate) struct InFlight(Arc<Generation>);

impl InFlight {
  pub(crate) fn generation(&self) -> &Generation {
    &self.0
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.0.idle.notify_waiters();
    }
  }
}
