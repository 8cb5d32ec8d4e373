//! Stored response snapshots and interception results.

use chrono::{DateTime, Utc};

use super::key::RequestKey;

/// A response captured for storage: status, headers, body and capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
  pub status: u16,
  /// Header pairs in the order they were received
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
      stored_at: Utc::now(),
    }
  }

  /// True for 2xx responses, the only ones worth keeping.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// First header value matching `name`, case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Indicates where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Hit in the active generation
  Store,
  /// Miss, fetched from the network
  Network,
}

/// Result of a successful interception.
#[derive(Debug, Clone)]
pub struct Served {
  pub snapshot: ResponseSnapshot,
  pub source: ServedFrom,
  /// Generation that answered or received the write-back, if any was active
  pub version: Option<String>,
}

impl Served {
  pub fn from_store(snapshot: ResponseSnapshot, version: String) -> Self {
    Self {
      snapshot,
      source: ServedFrom::Store,
      version: Some(version),
    }
  }

  pub fn from_network(snapshot: ResponseSnapshot, version: Option<String>) -> Self {
    Self {
      snapshot,
      source: ServedFrom::Network,
      version,
    }
  }
}

/// Resolution state of a request while it is being intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
  Unresolved,
  ServedFromStore,
  ServedFromNetwork,
  Failed,
}

/// An intercepted request and how far it has got.
#[derive(Debug, Clone)]
pub struct PendingRequest {
  pub key: RequestKey,
  pub resolution: Resolution,
}

impl PendingRequest {
  pub fn new(key: RequestKey) -> Self {
    Self {
      key,
      resolution: Resolution::Unresolved,
    }
  }

  pub fn resolve(&mut self, resolution: Resolution) {
    debug_assert_eq!(self.resolution, Resolution::Unresolved);
    self.resolution = resolution;
  }
}
