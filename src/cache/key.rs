//! Request key normalization.

use std::fmt;

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use url::Url;

/// Normalized identity of an intercepted request: HTTP method plus URL.
///
/// Two requests that differ only in method case, host case, default port or
/// fragment map to the same key, so store hits are reproducible.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: Url,
}

impl RequestKey {
  /// Build a key from a method and an absolute URL.
  pub fn new(method: &str, url: &str) -> Result<Self> {
    let url = Url::parse(url.trim()).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Self::from_url(method, url)
  }

  /// Build a `GET` key from an absolute URL.
  pub fn get(url: &str) -> Result<Self> {
    Self::new("GET", url)
  }

  /// Resolve `path_or_url` against `origin` and build a key from it.
  ///
  /// Absolute URLs are taken as-is; anything else is joined onto the origin.
  pub fn resolve(origin: &Url, method: &str, path_or_url: &str) -> Result<Self> {
    let url = origin
      .join(path_or_url.trim())
      .map_err(|e| eyre!("Cannot resolve '{}' against {}: {}", path_or_url, origin, e))?;
    Self::from_url(method, url)
  }

  fn from_url(method: &str, mut url: Url) -> Result<Self> {
    let method = normalize_method(method);
    if method.is_empty() {
      return Err(eyre!("Empty request method for {}", url));
    }
    if url.cannot_be_a_base() {
      return Err(eyre!("Request URL must be hierarchical: {}", url));
    }
    url.set_fragment(None);
    Ok(Self { method, url })
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Canonical textual form, `"METHOD URL"`.
  pub fn canonical(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  /// Stable fixed-length identifier used as the storage primary key.
  pub fn storage_id(&self) -> String {
    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

fn normalize_method(method: &str) -> String {
  method.trim().to_ascii_uppercase()
}
