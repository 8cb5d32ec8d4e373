//! Interception hook: decides which outgoing requests the controller sees.

use color_eyre::{eyre::eyre, Result};
use url::Url;

use super::controller::CacheController;
use super::error::CacheError;
use super::key::RequestKey;
use super::network::Network;
use super::snapshot::Served;
use super::storage::CacheStorage;

/// What the host should do with an outgoing request.
#[derive(Debug, Clone)]
pub enum HookDecision {
  /// Answer with this response
  Respond(Served),
  /// Not ours; let the host send the request itself
  PassThrough,
}

/// Routes in-scope `GET` requests through a [`CacheController`].
pub struct Interceptor<S: CacheStorage, N: Network> {
  controller: CacheController<S, N>,
  scope: Url,
}

impl<S, N> Interceptor<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  /// `scope` is a URL prefix; requests outside it pass through.
  pub fn new(controller: CacheController<S, N>, scope: Url) -> Result<Self> {
    if scope.cannot_be_a_base() {
      return Err(eyre!("Interception scope must be hierarchical: {}", scope));
    }
    Ok(Self { controller, scope })
  }

  pub fn controller(&self) -> &CacheController<S, N> {
    &self.controller
  }

  pub fn in_scope(&self, key: &RequestKey) -> bool {
    key.is_get() && key.url().as_str().starts_with(self.scope.as_str())
  }

  pub async fn handle(&self, key: &RequestKey) -> Result<HookDecision, CacheError> {
    if !self.in_scope(key) {
      tracing::trace!(request = %key, "passing through");
      return Ok(HookDecision::PassThrough);
    }
    self.controller.intercept(key).await.map(HookDecision::Respond)
  }
}
