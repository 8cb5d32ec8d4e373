//! Network capability used to resolve cache misses.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::time::Duration;

use super::error::NetworkError;
use super::key::RequestKey;
use super::snapshot::ResponseSnapshot;

/// Anything that can turn a request key into a response.
pub trait Network: Send + Sync {
  fn fetch(
    &self,
    key: &RequestKey,
  ) -> impl Future<Output = Result<ResponseSnapshot, NetworkError>> + Send;
}

/// HTTP network backed by `reqwest`.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("precache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, key: &RequestKey) -> Result<ResponseSnapshot, NetworkError> {
    let url = key.url().to_string();
    let method = reqwest::Method::from_bytes(key.method().as_bytes()).map_err(|e| {
      NetworkError::Unreachable {
        url: url.clone(),
        reason: e.to_string(),
      }
    })?;

    let response = self
      .client
      .request(method, key.url().clone())
      .send()
      .await
      .map_err(|e| NetworkError::Unreachable {
        url: url.clone(),
        reason: e.to_string(),
      })?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();

    let body = response.bytes().await.map_err(|e| NetworkError::Body {
      url,
      reason: e.to_string(),
    })?;

    Ok(ResponseSnapshot::new(status, headers, body.to_vec()))
  }
}
