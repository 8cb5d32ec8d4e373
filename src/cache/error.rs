//! Error taxonomy for the cache controller.

use thiserror::Error;

/// A network fetch failed for a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  /// The request never produced a response (DNS, connect, timeout, ...).
  #[error("request to {url} failed: {reason}")]
  Unreachable { url: String, reason: String },

  /// The response arrived but its body could not be read.
  #[error("failed to read body from {url}: {reason}")]
  Body { url: String, reason: String },
}

/// Errors surfaced by [`CacheController`](super::CacheController) operations.
#[derive(Error, Debug)]
pub enum CacheError {
  /// One or more manifest entries could not be populated after all retries.
  /// Terminal for this `initialize` call; the previous generation keeps serving.
  #[error(
    "population of generation {version} failed for {} entries: {}",
    .failed.len(),
    .failed.join(", ")
  )]
  Population { version: String, failed: Vec<String> },

  #[error(transparent)]
  Network(#[from] NetworkError),

  /// Writing a snapshot to the store failed. Never fails a response on the
  /// intercept path; only reported to callers that write directly.
  #[error("failed to write {key} into generation {version}: {reason}")]
  StoreWrite {
    version: String,
    key: String,
    reason: String,
  },

  /// Reading, opening or deleting a store failed.
  #[error("store error: {0}")]
  Store(String),

  #[error("invalid manifest: {0}")]
  InvalidManifest(String),

  #[error("generation {0} is active and cannot be retired")]
  ActiveGeneration(String),

  /// A newer `initialize` activated first, or this generation was retired
  /// while it was still populating.
  #[error("generation {version} was superseded before activation")]
  Superseded { version: String },

  #[error("unknown generation {0}")]
  UnknownGeneration(String),
}

impl CacheError {
  pub(crate) fn store(err: impl std::fmt::Display) -> Self {
    Self::Store(err.to_string())
  }
}
