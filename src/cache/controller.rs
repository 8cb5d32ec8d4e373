//! Cache controller: versioned generations, cache-first interception and
//! retirement of stale generations.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::generation::{Generation, GenerationState};
use super::key::RequestKey;
use super::network::Network;
use super::snapshot::{PendingRequest, Resolution, Served};
use super::storage::CacheStorage;

/// Tuning knobs for population and retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
  /// Delay before a retired generation may be deleted
  pub grace_period: Duration,
  /// Extra population rounds for entries that failed
  pub max_retries: u32,
  /// Pause between population rounds
  pub retry_delay: Duration,
}

impl Default for ControllerSettings {
  fn default() -> Self {
    Self {
      grace_period: Duration::from_secs(5),
      max_retries: 2,
      retry_delay: Duration::from_millis(250),
    }
  }
}

struct Tracked {
  generation: Arc<Generation>,
  state: GenerationState,
  /// Stamp of the retirement that owns the current `Retiring` state
  retirement: u64,
}

#[derive(Default)]
struct Registry {
  /// The single active generation pointer
  active: Option<Arc<Generation>>,
  /// Ticket of the `initialize` call that installed `active`
  active_ticket: u64,
  generations: HashMap<String, Tracked>,
  retirements: u64,
}

impl Registry {
  fn active_version(&self) -> Option<&str> {
    self.active.as_deref().map(Generation::version)
  }

  fn transition(&mut self, version: &str, next: GenerationState) {
    if let Some(tracked) = self.generations.get_mut(version) {
      if !tracked.state.can_become(next) {
        debug!(version, from = ?tracked.state, to = ?next, "unexpected generation transition");
      }
      tracked.state = next;
    }
  }

  /// Move `version` into `Retiring` and return the stamp identifying this
  /// retirement. Only the holder of the current stamp may delete the store.
  fn begin_retiring(&mut self, version: &str) -> u64 {
    self.retirements += 1;
    let stamp = self.retirements;
    self.transition(version, GenerationState::Retiring { since: Utc::now() });
    if let Some(tracked) = self.generations.get_mut(version) {
      tracked.retirement = stamp;
    }
    stamp
  }
}

struct Inner<S, N> {
  storage: S,
  network: N,
  settings: ControllerSettings,
  registry: Mutex<Registry>,
  tickets: AtomicU64,
}

/// Owns the versioned content store and decides, per request, whether to
/// answer from the active generation or from the network.
///
/// Cloning is cheap; clones share the same generations.
pub struct CacheController<S: CacheStorage, N: Network> {
  inner: Arc<Inner<S, N>>,
}

impl<S: CacheStorage, N: Network> Clone for CacheController<S, N> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S, N> CacheController<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  pub fn new(storage: S, network: N) -> Self {
    Self::with_settings(storage, network, ControllerSettings::default())
  }

  pub fn with_settings(storage: S, network: N, settings: ControllerSettings) -> Self {
    Self {
      inner: Arc::new(Inner {
        storage,
        network,
        settings,
        registry: Mutex::new(Registry::default()),
        tickets: AtomicU64::new(0),
      }),
    }
  }

  pub fn storage(&self) -> &S {
    &self.inner.storage
  }

  /// Version tag of the generation currently serving requests.
  pub fn active_version(&self) -> Option<String> {
    self.registry().active_version().map(String::from)
  }

  /// Lifecycle state of a generation this controller has seen.
  pub fn state(&self, version: &str) -> Option<GenerationState> {
    self.registry().generations.get(version).map(|t| t.state)
  }

  // The registry is never held across an await, so a poisoned lock only
  // means a panic elsewhere; the data itself is still consistent.
  fn registry(&self) -> MutexGuard<'_, Registry> {
    self
      .inner
      .registry
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Populate the generation `version` with every manifest entry and make it
  /// the active generation.
  ///
  /// Entries already present in the store are reused. On success the
  /// previously active generation is scheduled for retirement. On failure the
  /// previous generation keeps serving.
  pub async fn initialize(
    &self,
    manifest: &[RequestKey],
    version: &str,
  ) -> Result<(), CacheError> {
    if manifest.is_empty() {
      return Err(CacheError::InvalidManifest("manifest is empty".to_string()));
    }
    if version.trim().is_empty() {
      return Err(CacheError::InvalidManifest("version tag is empty".to_string()));
    }

    let ticket = self.inner.tickets.fetch_add(1, Ordering::SeqCst) + 1;

    if self.active_version().as_deref() == Some(version) {
      // Already serving: only fill entries the manifest gained since
      return self.populate(manifest, version, |_| {}).await;
    }

    let generation = {
      let mut registry = self.registry();
      let tracked = registry
        .generations
        .entry(version.to_string())
        .or_insert_with(|| Tracked {
          generation: Generation::new(version),
          state: GenerationState::Empty,
          retirement: 0,
        });
      if tracked.state == GenerationState::Deleted {
        tracked.generation = Generation::new(version);
      }
      let generation = Arc::clone(&tracked.generation);
      registry.transition(version, GenerationState::Populating { attempt: 1 });
      generation
    };

    info!(version, entries = manifest.len(), "populating generation");

    if let Err(e) = self.inner.storage.open(version) {
      self.registry().transition(version, GenerationState::Failed);
      return Err(CacheError::store(e));
    }

    let populated = self
      .populate(manifest, version, |attempt| {
        self
          .registry()
          .transition(version, GenerationState::Populating { attempt });
      })
      .await;

    if let Err(e) = populated {
      let mut registry = self.registry();
      let still_ours = registry
        .generations
        .get(version)
        .is_some_and(|t| matches!(t.state, GenerationState::Populating { .. }));
      if still_ours {
        registry.transition(version, GenerationState::Failed);
      }
      warn!(version, error = %e, "population failed, previous generation keeps serving");
      return Err(e);
    }

    self.activate(version, generation, ticket)
  }

  /// Fetch every manifest entry missing from `version`, retrying failed
  /// entries for a bounded number of rounds.
  async fn populate<F>(
    &self,
    manifest: &[RequestKey],
    version: &str,
    on_retry: F,
  ) -> Result<(), CacheError>
  where
    F: Fn(u32),
  {
    let storage = &self.inner.storage;
    let settings = self.inner.settings;
    let mut pending: Vec<&RequestKey> = manifest.iter().collect();
    let mut attempt = 1;

    loop {
      let mut failed = Vec::new();

      for key in pending {
        match storage.match_entry(version, key) {
          Ok(Some(_)) => continue,
          Ok(None) => {}
          Err(e) => {
            debug!(version, request = %key, error = %e, "store lookup failed, refetching")
          }
        }

        match self.inner.network.fetch(key).await {
          Ok(snapshot) if snapshot.is_ok() => {
            if let Err(e) = storage.put(version, key, &snapshot) {
              warn!(version, request = %key, error = %e, "failed to store manifest entry");
              failed.push(key);
            }
          }
          Ok(snapshot) => {
            warn!(
              version,
              request = %key,
              status = snapshot.status,
              "manifest entry returned non-success status"
            );
            failed.push(key);
          }
          Err(e) => {
            warn!(version, request = %key, error = %e, "manifest entry fetch failed");
            failed.push(key);
          }
        }
      }

      if failed.is_empty() {
        return Ok(());
      }

      if attempt > settings.max_retries {
        return Err(CacheError::Population {
          version: version.to_string(),
          failed: failed.iter().map(|k| k.canonical()).collect(),
        });
      }

      attempt += 1;
      on_retry(attempt);
      debug!(version, attempt, remaining = failed.len(), "retrying failed manifest entries");
      tokio::time::sleep(settings.retry_delay).await;
      pending = failed;
    }
  }

  /// Swap the active pointer to `generation` unless a newer activation won.
  fn activate(
    &self,
    version: &str,
    generation: Arc<Generation>,
    ticket: u64,
  ) -> Result<(), CacheError> {
    let previous = {
      let mut registry = self.registry();

      let still_populating = registry.generations.get(version).is_some_and(|t| {
        Arc::ptr_eq(&t.generation, &generation)
          && matches!(t.state, GenerationState::Populating { .. })
      });

      if registry.active_version() == Some(version) {
        return Ok(());
      }

      if !still_populating || registry.active_ticket > ticket {
        if still_populating {
          registry.transition(version, GenerationState::Ready);
          registry.begin_retiring(version);
          drop(registry);
          self.schedule_retirement(version.to_string());
        }
        info!(version, "generation superseded before activation");
        return Err(CacheError::Superseded {
          version: version.to_string(),
        });
      }

      registry.transition(version, GenerationState::Ready);
      registry.transition(version, GenerationState::Active);
      registry.active_ticket = ticket;
      let previous = registry.active.replace(generation);

      let previous = previous.map(|p| p.version().to_string());
      if let Some(prev) = &previous {
        registry.begin_retiring(prev);
      }
      previous
    };

    info!(version, previous = previous.as_deref(), "generation activated");

    if let Some(previous) = previous {
      self.schedule_retirement(previous);
    }
    Ok(())
  }

  fn schedule_retirement(&self, version: String) {
    let this = self.clone();
    tokio::spawn(async move {
      if let Err(e) = this.retire(&version).await {
        warn!(version, error = %e, "scheduled retirement failed");
      }
    });
  }

  /// Answer a request cache-first.
  ///
  /// A hit in the active generation is returned without touching the
  /// network. A miss goes to the network; successful `GET` responses are
  /// written back into the active generation on a best-effort basis.
  pub async fn intercept(&self, key: &RequestKey) -> Result<Served, CacheError> {
    let mut pending = PendingRequest::new(key.clone());

    // Taken under the registry lock so retirement cannot miss this reader
    let guard = self.registry().active.as_ref().map(|g| g.enter());
    let version = guard.as_ref().map(|g| g.generation().version().to_string());

    if let Some(version) = &version {
      match self.inner.storage.match_entry(version, key) {
        Ok(Some(snapshot)) => {
          pending.resolve(Resolution::ServedFromStore);
          debug!(version, request = %pending.key, resolution = ?pending.resolution, "cache hit");
          return Ok(Served::from_store(snapshot, version.clone()));
        }
        Ok(None) => {}
        Err(e) => {
          warn!(version, request = %key, error = %e, "store lookup failed, using network")
        }
      }
    }

    let snapshot = match self.inner.network.fetch(key).await {
      Ok(snapshot) => snapshot,
      Err(e) => {
        pending.resolve(Resolution::Failed);
        debug!(
          request = %pending.key,
          resolution = ?pending.resolution,
          error = %e,
          "network fetch failed"
        );
        return Err(CacheError::Network(e));
      }
    };

    if let Some(version) = &version {
      if key.is_get() && snapshot.is_ok() {
        if let Err(e) = self.inner.storage.put(version, key, &snapshot) {
          let err = CacheError::StoreWrite {
            version: version.clone(),
            key: key.canonical(),
            reason: e.to_string(),
          };
          warn!(error = %err, "ignoring cache write failure");
        }
      }
    }

    drop(guard);
    pending.resolve(Resolution::ServedFromNetwork);
    debug!(request = %pending.key, resolution = ?pending.resolution, "cache miss");
    Ok(Served::from_network(snapshot, version))
  }

  /// Retire a generation and delete its store once the grace period has
  /// passed and no in-flight request still reads it.
  ///
  /// Never deletes the active generation. Resolves after deletion, or
  /// early if the generation was picked up again in the meantime.
  pub async fn retire(&self, version: &str) -> Result<(), CacheError> {
    let (generation, stamp) = {
      let mut registry = self.registry();

      if registry.active_version() == Some(version) {
        return Err(CacheError::ActiveGeneration(version.to_string()));
      }

      if !registry.generations.contains_key(version) {
        // A store left behind by an earlier process
        let known = self
          .inner
          .storage
          .list_names()
          .map_err(CacheError::store)?
          .contains(version);
        if !known {
          return Err(CacheError::UnknownGeneration(version.to_string()));
        }
        registry.generations.insert(
          version.to_string(),
          Tracked {
            generation: Generation::new(version),
            state: GenerationState::Ready,
            retirement: 0,
          },
        );
      }

      let tracked = registry
        .generations
        .get(version)
        .ok_or_else(|| CacheError::UnknownGeneration(version.to_string()))?;
      let generation = Arc::clone(&tracked.generation);
      let (state, current) = (tracked.state, tracked.retirement);
      let stamp = match state {
        GenerationState::Deleted => return Ok(()),
        // Join the retirement already under way
        GenerationState::Retiring { .. } => current,
        _ => registry.begin_retiring(version),
      };
      (generation, stamp)
    };

    let grace = self.inner.settings.grace_period;
    info!(version, grace_ms = grace.as_millis() as u64, "retiring generation");

    tokio::time::sleep(grace).await;
    generation.wait_idle().await;

    let mut registry = self.registry();
    let still_retiring = registry.generations.get(version).is_some_and(|t| {
      Arc::ptr_eq(&t.generation, &generation)
        && matches!(t.state, GenerationState::Retiring { .. })
        && t.retirement == stamp
    });
    if !still_retiring {
      debug!(version, "generation picked up again, skipping deletion");
      return Ok(());
    }

    // Deleted under the registry lock so a concurrent initialize cannot
    // reopen the store in between
    self
      .inner
      .storage
      .delete_store(version)
      .map_err(CacheError::store)?;
    registry.transition(version, GenerationState::Deleted);
    info!(version, "generation deleted");
    Ok(())
  }

  /// Delete every stored generation that is neither active nor listed in
  /// `keep`. Returns the deleted version tags.
  ///
  /// Generations that are still populating, retiring or read by an
  /// in-flight request are left to their own lifecycle; `retire` deletes
  /// them once their grace period is over.
  pub fn purge_stale<I, T>(&self, keep: I) -> Result<Vec<String>, CacheError>
  where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
  {
    let keep: BTreeSet<String> = keep.into_iter().map(|t| t.as_ref().to_string()).collect();
    let names = self.inner.storage.list_names().map_err(CacheError::store)?;

    let mut registry = self.registry();
    let active = registry.active_version().map(String::from);
    let mut deleted = Vec::new();

    for name in names {
      if keep.contains(&name) || active.as_deref() == Some(name.as_str()) {
        continue;
      }
      if let Some(tracked) = registry.generations.get(&name) {
        let busy = matches!(
          tracked.state,
          GenerationState::Populating { .. } | GenerationState::Retiring { .. }
        ) || tracked.generation.in_flight() > 0;
        if busy {
          debug!(version = %name, state = ?tracked.state, "generation busy, not purging");
          continue;
        }
      }
      self
        .inner
        .storage
        .delete_store(&name)
        .map_err(CacheError::store)?;
      if let Some(tracked) = registry.generations.get_mut(&name) {
        tracked.state = GenerationState::Deleted;
      }
      info!(version = %name, "purged stale generation");
      deleted.push(name);
    }

    Ok(deleted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::error::NetworkError;
  use crate::cache::snapshot::{ResponseSnapshot, ServedFrom};
  use crate::cache::storage::MemoryStorage;
  use std::collections::HashSet;
  use std::sync::atomic::AtomicUsize;

  /// Network fake that serves a body derived from the URL and counts calls.
  #[derive(Default)]
  struct FakeNetwork {
    calls: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    statuses: Mutex<HashMap<String, u16>>,
    /// Only requests for this path are delayed
    delay: Option<(&'static str, Duration)>,
    tag: Mutex<String>,
  }

  impl FakeNetwork {
    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self, path: &str) {
      self.failing.lock().unwrap().insert(path.to_string());
    }

    fn recover(&self, path: &str) {
      self.failing.lock().unwrap().remove(path);
    }

    fn set_tag(&self, tag: &str) {
      *self.tag.lock().unwrap() = tag.to_string();
    }
  }

  impl Network for Arc<FakeNetwork> {
    async fn fetch(&self, key: &RequestKey) -> Result<ResponseSnapshot, NetworkError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let path = key.url().path().to_string();
      if let Some((slow_path, delay)) = self.delay {
        if path == slow_path {
          tokio::time::sleep(delay).await;
        }
      }
      if self.failing.lock().unwrap().contains(&path) {
        return Err(NetworkError::Unreachable {
          url: key.url().to_string(),
          reason: "offline".to_string(),
        });
      }
      let status = self.statuses.lock().unwrap().get(&path).copied().unwrap_or(200);
      let body = format!("{}{}", self.tag.lock().unwrap(), path);
      Ok(ResponseSnapshot::new(status, Vec::new(), body.into_bytes()))
    }
  }

  /// Storage wrapper whose writes can be switched off.
  struct FlakyStorage {
    inner: MemoryStorage,
    reject_writes: std::sync::atomic::AtomicBool,
  }

  type EyreResult<T> = color_eyre::Result<T>;

  impl CacheStorage for FlakyStorage {
    fn open(&self, name: &str) -> EyreResult<()> {
      self.inner.open(name)
    }
    fn match_entry(&self, name: &str, key: &RequestKey) -> EyreResult<Option<ResponseSnapshot>> {
      self.inner.match_entry(name, key)
    }
    fn put(&self, name: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> EyreResult<()> {
      if self.reject_writes.load(Ordering::SeqCst) {
        return Err(color_eyre::eyre::eyre!("disk full"));
      }
      self.inner.put(name, key, snapshot)
    }
    fn delete(&self, name: &str, key: &RequestKey) -> EyreResult<bool> {
      self.inner.delete(name, key)
    }
    fn list_names(&self) -> EyreResult<BTreeSet<String>> {
      self.inner.list_names()
    }
    fn delete_store(&self, name: &str) -> EyreResult<bool> {
      self.inner.delete_store(name)
    }
    fn entry_count(&self, name: &str) -> EyreResult<usize> {
      self.inner.entry_count(name)
    }
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::get(&format!("https://app.example.com{}", path)).unwrap()
  }

  fn manifest() -> Vec<RequestKey> {
    vec![key("/"), key("/static/manifest.json")]
  }

  fn fast_settings() -> ControllerSettings {
    ControllerSettings {
      grace_period: Duration::from_millis(20),
      max_retries: 2,
      retry_delay: Duration::from_millis(1),
    }
  }

  fn controller() -> (CacheController<MemoryStorage, Arc<FakeNetwork>>, Arc<FakeNetwork>) {
    let network = Arc::new(FakeNetwork::default());
    let controller =
      CacheController::with_settings(MemoryStorage::new(), Arc::clone(&network), fast_settings());
    (controller, network)
  }

  #[tokio::test]
  async fn test_manifest_entries_served_from_store_after_initialize() {
    let (controller, network) = controller();
    controller.initialize(&manifest(), "v1").await.unwrap();
    assert_eq!(network.calls(), 2);
    assert_eq!(controller.active_version().as_deref(), Some("v1"));
    assert_eq!(controller.state("v1"), Some(GenerationState::Active));

    for key in manifest() {
      let served = controller.intercept(&key).await.unwrap();
      assert_eq!(served.source, ServedFrom::Store);
      assert_eq!(served.version.as_deref(), Some("v1"));
    }
    assert_eq!(network.calls(), 2);
  }

  #[tokio::test]
  async fn test_miss_fetches_once_then_hits() {
    let (controller, network) = controller();
    controller.initialize(&manifest(), "v1").await.unwrap();
    let before = network.calls();

    let first = controller.intercept(&key("/clients")).await.unwrap();
    assert_eq!(first.source, ServedFrom::Network);
    assert_eq!(network.calls(), before + 1);

    let second = controller.intercept(&key("/clients")).await.unwrap();
    assert_eq!(second.source, ServedFrom::Store);
    assert_eq!(second.snapshot.body, first.snapshot.body);
    assert_eq!(network.calls(), before + 1);
  }

  #[tokio::test]
  async fn test_network_error_surfaces_to_caller() {
    let (controller, network) = controller();
    controller.initialize(&manifest(), "v1").await.unwrap();
    network.fail("/offline-page");

    let err = controller.intercept(&key("/offline-page")).await.unwrap_err();
    assert!(matches!(err, CacheError::Network(NetworkError::Unreachable { .. })));
    // Manifest entries keep working offline
    assert!(controller.intercept(&key("/")).await.is_ok());
  }

  #[tokio::test]
  async fn test_non_get_and_error_responses_are_not_stored() {
    let (controller, network) = controller();
    controller.initialize(&manifest(), "v1").await.unwrap();
    network.statuses.lock().unwrap().insert("/missing".to_string(), 404);

    let post = RequestKey::new("POST", "https://app.example.com/form").unwrap();
    controller.intercept(&post).await.unwrap();
    controller.intercept(&key("/missing")).await.unwrap();

    assert!(controller.storage().match_entry("v1", &post).unwrap().is_none());
    assert!(controller.storage().match_entry("v1", &key("/missing")).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_without_active_generation_goes_to_network() {
    let (controller, network) = controller();
    let served = controller.intercept(&key("/")).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(served.version, None);
    assert_eq!(network.calls(), 1);
    assert!(controller.storage().list_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_store_write_failure_does_not_fail_response() {
    let network = Arc::new(FakeNetwork::default());
    let storage = FlakyStorage {
      inner: MemoryStorage::new(),
      reject_writes: std::sync::atomic::AtomicBool::new(false),
    };
    let controller = CacheController::with_settings(storage, Arc::clone(&network), fast_settings());
    controller.initialize(&manifest(), "v1").await.unwrap();

    controller.storage().reject_writes.store(true, Ordering::SeqCst);
    let served = controller.intercept(&key("/new")).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(served.snapshot.body, b"/new");

    // Nothing was stored, so the next call goes to the network again
    let again = controller.intercept(&key("/new")).await.unwrap();
    assert_eq!(again.source, ServedFrom::Network);
  }

  #[tokio::test]
  async fn test_failed_population_never_activates() {
    let (controller, network) = controller();
    controller.initialize(&manifest(), "v1").await.unwrap();

    network.set_tag("v2");
    network.fail("/static/manifest.json");
    let err = controller.initialize(&manifest(), "v2").await.unwrap_err();
    match err {
      CacheError::Population { version, failed } => {
        assert_eq!(version, "v2");
        assert_eq!(failed, vec!["GET https://app.example.com/static/manifest.json".to_string()]);
      }
      other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(controller.active_version().as_deref(), Some("v1"));
    assert_eq!(controller.state("v2"), Some(GenerationState::Failed));
    let served = controller.intercept(&key("/")).await.unwrap();
    assert_eq!(served.source, ServedFrom::Store);
    assert_eq!(served.snapshot.body, b"/");
  }

  #[tokio::test]
  async fn test_population_retries_are_bounded() {
    let (controller, network) = controller();
    network.fail("/static/manifest.json");

    assert!(controller.initialize(&manifest(), "v1").await.is_err());
    // "/" succeeds once; the failing entry is tried 1 + max_retries times
    assert_eq!(network.calls(), 1 + 3);
    assert_eq!(controller.active_version(), None);
  }

  #[tokio::test]
  async fn test_partial_population_is_kept_for_retry() {
    let (controller, network) = controller();
    network.fail("/static/manifest.json");
    assert!(controller.initialize(&manifest(), "v1").await.is_err());
    assert_eq!(controller.storage().entry_count("v1").unwrap(), 1);

    network.recover("/static/manifest.json");
    let before = network.calls();
    controller.initialize(&manifest(), "v1").await.unwrap();
    // Only the missing entry is fetched
    assert_eq!(network.calls(), before + 1);
    assert_eq!(controller.active_version().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_non_success_status_fails_population() {
    let (controller, network) = controller();
    network.statuses.lock().unwrap().insert("/".to_string(), 500);
    let err = controller.initialize(&manifest(), "v1").await.unwrap_err();
    assert!(matches!(err, CacheError::Population { .. }));
  }

  #[tokio::test]
  async fn test_initialize_twice_is_a_noop() {
    let (controller, network) = controller();
    controller.initialize(&manifest(), "v1").await.unwrap();
    let before = network.calls();

    controller.initialize(&manifest(), "v1").await.unwrap();
    assert_eq!(network.calls(), before);
    assert_eq!(controller.active_version().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_rejects_empty_manifest_and_version() {
    let (controller, _) = controller();
    assert!(matches!(
      controller.initialize(&[], "v1").await,
      Err(CacheError::InvalidManifest(_))
    ));
    assert!(matches!(
      controller.initialize(&manifest(), " ").await,
      Err(CacheError::InvalidManifest(_))
    ));
  }

  #[tokio::test]
  async fn test_new_generation_replaces_and_retires_previous() {
    let (controller, network) = controller();
    controller.initialize(&manifest(), "v1").await.unwrap();

    network.set_tag("v2");
    controller.initialize(&manifest(), "v2").await.unwrap();
    assert_eq!(controller.active_version().as_deref(), Some("v2"));
    assert!(matches!(controller.state("v1"), Some(GenerationState::Retiring { .. })));

    let served = controller.intercept(&key("/")).await.unwrap();
    assert_eq!(served.snapshot.body, b"v2/");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.state("v1"), Some(GenerationState::Deleted));
    let names = controller.storage().list_names().unwrap();
    assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["v2"]);
  }

  #[tokio::test]
  async fn test_retire_refuses_active_generation() {
    let (controller, _) = controller();
    controller.initialize(&manifest(), "v1").await.unwrap();

    let err = controller.retire("v1").await.unwrap_err();
    assert!(matches!(err, CacheError::ActiveGeneration(v) if v == "v1"));
    assert_eq!(controller.state("v1"), Some(GenerationState::Active));
    assert!(controller.storage().list_names().unwrap().contains("v1"));
  }

  #[tokio::test]
  async fn test_retire_unknown_generation() {
    let (controller, _) = controller();
    assert!(matches!(
      controller.retire("nope").await,
      Err(CacheError::UnknownGeneration(_))
    ));
  }

  #[tokio::test]
  async fn test_retire_leftover_store_from_earlier_process() {
    let (controller, _) = controller();
    controller.storage().open("v0").unwrap();

    controller.retire("v0").await.unwrap();
    assert!(!controller.storage().list_names().unwrap().contains("v0"));
  }

  #[tokio::test]
  async fn test_retirement_waits_for_in_flight_requests() {
    let network = Arc::new(FakeNetwork {
      delay: Some(("/slow", Duration::from_millis(150))),
      ..FakeNetwork::default()
    });
    let settings = ControllerSettings {
      grace_period: Duration::from_millis(10),
      max_retries: 0,
      retry_delay: Duration::from_millis(1),
    };
    let controller =
      CacheController::with_settings(MemoryStorage::new(), Arc::clone(&network), settings);
    controller.initialize(&[key("/")], "v1").await.unwrap();

    // A slow miss on v1 is in flight while v2 takes over
    let slow = {
      let controller = controller.clone();
      tokio::spawn(async move { controller.intercept(&key("/slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    controller.initialize(&[key("/")], "v2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // Grace period is over but the reader still holds v1
    assert!(matches!(controller.state("v1"), Some(GenerationState::Retiring { .. })));
    assert!(controller.storage().list_names().unwrap().contains("v1"));

    let served = slow.await.unwrap().unwrap();
    assert_eq!(served.version.as_deref(), Some("v1"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.state("v1"), Some(GenerationState::Deleted));
    assert!(!controller.storage().list_names().unwrap().contains("v1"));
  }

  #[tokio::test]
  async fn test_reinitializing_retiring_generation_cancels_deletion() {
    let (controller, network) = controller();
    controller.initialize(&manifest(), "v1").await.unwrap();
    network.set_tag("v2");
    controller.initialize(&manifest(), "v2").await.unwrap();
    assert!(matches!(controller.state("v1"), Some(GenerationState::Retiring { .. })));

    controller.initialize(&manifest(), "v1").await.unwrap();
    assert_eq!(controller.active_version().as_deref(), Some("v1"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.state("v1"), Some(GenerationState::Active));
    assert_eq!(controller.state("v2"), Some(GenerationState::Deleted));
    assert_eq!(
      controller.storage().list_names().unwrap().into_iter().collect::<Vec<_>>(),
      vec!["v1"]
    );
    let served = controller.intercept(&key("/")).await.unwrap();
    assert_eq!(served.source, ServedFrom::Store);
    assert_eq!(served.snapshot.body, b"/");
  }

  #[tokio::test]
  async fn test_earlier_retirement_does_not_cut_later_grace_period_short() {
    let network = Arc::new(FakeNetwork::default());
    let settings = ControllerSettings {
      grace_period: Duration::from_millis(200),
      max_retries: 0,
      retry_delay: Duration::from_millis(1),
    };
    let controller =
      CacheController::with_settings(MemoryStorage::new(), Arc::clone(&network), settings);

    // First retirement of v1 starts here and ends around t=200ms
    controller.initialize(&manifest(), "v1").await.unwrap();
    controller.initialize(&manifest(), "v2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // v1 serves again, then is replaced; its second grace ends around t=350ms
    controller.initialize(&manifest(), "v1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(130)).await;
    controller.initialize(&manifest(), "v3").await.unwrap();

    tokio::time::sleep(Duration::from_millis(110)).await;
    assert!(matches!(controller.state("v1"), Some(GenerationState::Retiring { .. })));
    assert!(controller.storage().list_names().unwrap().contains("v1"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.state("v1"), Some(GenerationState::Deleted));
    assert!(!controller.storage().list_names().unwrap().contains("v1"));
  }

  #[tokio::test]
  async fn test_purge_stale_leaves_retiring_generation_to_retirement() {
    let network = Arc::new(FakeNetwork {
      delay: Some(("/slow", Duration::from_millis(150))),
      ..FakeNetwork::default()
    });
    let settings = ControllerSettings {
      grace_period: Duration::from_millis(10),
      max_retries: 0,
      retry_delay: Duration::from_millis(1),
    };
    let controller =
      CacheController::with_settings(MemoryStorage::new(), Arc::clone(&network), settings);
    controller.storage().open("v0").unwrap();
    controller.initialize(&[key("/")], "v1").await.unwrap();

    let slow = {
      let controller = controller.clone();
      tokio::spawn(async move { controller.intercept(&key("/slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    controller.initialize(&[key("/")], "v2").await.unwrap();

    // v1 is retiring with a reader in flight; only the leftover goes
    let deleted = controller.purge_stale(["v2"]).unwrap();
    assert_eq!(deleted, vec!["v0"]);
    assert!(matches!(controller.state("v1"), Some(GenerationState::Retiring { .. })));
    assert!(controller.storage().list_names().unwrap().contains("v1"));

    let served = slow.await.unwrap().unwrap();
    assert_eq!(served.version.as_deref(), Some("v1"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.state("v1"), Some(GenerationState::Deleted));
    assert_eq!(
      controller.storage().list_names().unwrap().into_iter().collect::<Vec<_>>(),
      vec!["v2"]
    );
  }

  #[tokio::test]
  async fn test_purge_stale_keeps_listed_and_active() {
    let (controller, _) = controller();
    controller.storage().open("v1").unwrap();
    controller.storage().open("v3").unwrap();
    controller.initialize(&manifest(), "v2").await.unwrap();

    let mut deleted = controller.purge_stale(["v2"]).unwrap();
    deleted.sort();
    assert_eq!(deleted, vec!["v1", "v3"]);
    assert_eq!(
      controller.storage().list_names().unwrap().into_iter().collect::<Vec<_>>(),
      vec!["v2"]
    );
  }

  #[tokio::test]
  async fn test_purge_stale_never_removes_active() {
    let (controller, _) = controller();
    controller.initialize(&manifest(), "v2").await.unwrap();

    let deleted = controller.purge_stale(Vec::<String>::new()).unwrap();
    assert!(deleted.is_empty());
    assert_eq!(controller.active_version().as_deref(), Some("v2"));
  }

  #[tokio::test]
  async fn test_abandoned_initialize_keeps_previous_active() {
    let network = Arc::new(FakeNetwork {
      delay: Some(("/v2-only", Duration::from_millis(50))),
      ..FakeNetwork::default()
    });
    let controller =
      CacheController::with_settings(MemoryStorage::new(), Arc::clone(&network), fast_settings());
    controller.initialize(&[key("/")], "v1").await.unwrap();

    let abandoned = tokio::time::timeout(
      Duration::from_millis(10),
      controller.initialize(&[key("/v2-only")], "v2"),
    )
    .await;
    assert!(abandoned.is_err());

    assert_eq!(controller.active_version().as_deref(), Some("v1"));
    assert!(controller.state("v1").unwrap().is_serving());
    let served = controller.intercept(&key("/")).await.unwrap();
    assert_eq!(served.source, ServedFrom::Store);
  }

  #[tokio::test]
  async fn test_older_population_does_not_override_newer_activation() {
    let network = Arc::new(FakeNetwork::default());
    let controller =
      CacheController::with_settings(MemoryStorage::new(), Arc::clone(&network), fast_settings());

    // v1 stalls on its first round while v2 activates
    network.fail("/");
    let slow = {
      let controller = controller.clone();
      tokio::spawn(async move { controller.initialize(&[key("/")], "v1").await })
    };
    tokio::task::yield_now().await;
    network.recover("/");
    controller.initialize(&[key("/other")], "v2").await.unwrap();

    let result = slow.await.unwrap();
    assert!(matches!(result, Err(CacheError::Superseded { .. })));
    assert_eq!(controller.active_version().as_deref(), Some("v2"));
  }

  #[tokio::test]
  async fn test_concurrent_misses_on_same_key_race_harmlessly() {
    let (controller, network) = controller();
    controller.initialize(&manifest(), "v1").await.unwrap();
    let before = network.calls();

    let k = key("/shared");
    let results = futures::future::join_all((0..4).map(|_| controller.intercept(&k))).await;
    for served in &results {
      assert_eq!(served.as_ref().unwrap().snapshot.body, b"/shared");
    }
    assert!(network.calls() > before);
    assert_eq!(
      controller.intercept(&k).await.unwrap().source,
      ServedFrom::Store
    );
  }
}
