//! Loading the task list: freshness, request deduplication and invalidation.
//!
//! [`FetchCoordinator`] owns the only read path to the server. Concurrent loads
//! share a single `GET /tasks`, a fresh list is served without any request, and
//! [`FetchCoordinator::invalidate`] forces the next load to hit the network.
//!
//! # Example
//!
//! ```ignore
//! let mut subscription = coordinator.subscribe();
//!
//! // In event loop tick
//! if subscription.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! let view = subscription.current();
//! match &view.status {
//!     QueryStatus::Loading if view.is_absent() => render_spinner(),
//!     QueryStatus::Error(e) => render_error(e),
//!     _ => render_tasks(view.tasks()),
//! }
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;

use super::result::CacheResult;
use super::store::{CacheView, RecordStore};
use super::CacheError;
use crate::config::CacheConfig;
use crate::task::Task;
use crate::transport::{TaskTransport, TransportError};

/// The state of the most recent fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QueryStatus {
  /// Nothing has been fetched yet
  #[default]
  Idle,
  /// A fetch is running
  Loading,
  /// The last fetch succeeded
  Success,
  /// The last fetch failed with an error
  Error(String),
}

impl QueryStatus {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryStatus::Loading)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryStatus::Error(_))
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryStatus::Error(e) => Some(e),
      _ => None,
    }
  }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Vec<Task>>, CacheError>>>;

/// A fetch that later loads of the same generation can join.
struct InFlight {
  generation: u64,
  fetch: SharedFetch,
}

/// Loads the task list into the [`RecordStore`]. Cloning shares the coordinator.
#[derive(Clone)]
pub struct FetchCoordinator {
  inner: Arc<FetchInner>,
}

struct FetchInner {
  store: RecordStore,
  transport: Arc<dyn TaskTransport>,
  /// How long a loaded list is served without refetching
  stale_time: Duration,
  /// How long the list survives without subscribers
  keep_unused_for: Duration,
  refetch_on_invalidate: bool,
  in_flight: Mutex<Option<InFlight>>,
  /// Bumped by every invalidation
  generation: AtomicU64,
  subscribers: AtomicUsize,
  /// Bumped on subscribe and on last unsubscribe; a teardown only runs if it is unchanged
  teardown_epoch: AtomicU64,
  requests: AtomicU64,
}

impl FetchCoordinator {
  pub fn new(store: RecordStore, transport: Arc<dyn TaskTransport>, config: &CacheConfig) -> Self {
    Self {
      inner: Arc::new(FetchInner {
        store,
        transport,
        stale_time: config.stale_time(),
        keep_unused_for: config.keep_unused_for(),
        refetch_on_invalidate: config.refetch_on_invalidate,
        in_flight: Mutex::new(None),
        generation: AtomicU64::new(0),
        subscribers: AtomicUsize::new(0),
        teardown_epoch: AtomicU64::new(0),
        requests: AtomicU64::new(0),
      }),
    }
  }

  pub fn store(&self) -> &RecordStore {
    &self.inner.store
  }

  /// Load the list with a cache-first strategy.
  ///
  /// 1. If the list is loaded, not invalidated and younger than the stale time, return it
  /// 2. Otherwise fetch, joining a fetch of the same generation already in flight
  /// 3. On network failure, return the previous list if there is one (offline mode)
  pub async fn load(&self) -> Result<CacheResult<Arc<Vec<Task>>>, CacheError> {
    let view = self.inner.store.view();
    if let Some(tasks) = self.fresh(&view) {
      tracing::debug!(count = tasks.len(), "serving cached task list");
      return Ok(CacheResult::from_cache(tasks, view.fetched_at));
    }
    self.fetch().await
  }

  /// Fetch even if the cached list is fresh. Still joins an in-flight fetch.
  pub async fn refetch(&self) -> Result<CacheResult<Arc<Vec<Task>>>, CacheError> {
    self.fetch().await
  }

  /// Mark the list stale so the next load goes to the network.
  ///
  /// With subscribers present the refetch starts right away in the background.
  pub fn invalidate(&self) {
    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    self.inner.store.mark_stale();
    tracing::debug!(generation, "task list invalidated");

    if self.inner.refetch_on_invalidate && self.subscriber_count() > 0 {
      let this = self.clone();
      tokio::spawn(async move {
        // Failures land in the view status
        let _ = this.load().await;
      });
    }
  }

  /// Subscribe to the list, loading it in the background if needed.
  ///
  /// Must be called from within a tokio runtime.
  pub fn subscribe(&self) -> TaskSubscription {
    self.inner.subscribers.fetch_add(1, Ordering::SeqCst);
    self.inner.teardown_epoch.fetch_add(1, Ordering::SeqCst);

    let receiver = self.inner.store.subscribe();
    let this = self.clone();
    tokio::spawn(async move {
      let _ = this.load().await;
    });

    TaskSubscription {
      receiver,
      coordinator: self.clone(),
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.inner.subscribers.load(Ordering::SeqCst)
  }

  /// Number of list requests sent to the transport so far.
  pub fn request_count(&self) -> u64 {
    self.inner.requests.load(Ordering::SeqCst)
  }

  fn generation(&self) -> u64 {
    self.inner.generation.load(Ordering::SeqCst)
  }

  fn fresh(&self, view: &CacheView) -> Option<Arc<Vec<Task>>> {
    if view.is_stale || view.status.is_error() {
      return None;
    }
    let fetched_at = view.fetched_at?;
    let age = (Utc::now() - fetched_at).to_std().unwrap_or_default();
    if age > self.inner.stale_time {
      return None;
    }
    view.tasks.clone()
  }

  async fn fetch(&self) -> Result<CacheResult<Arc<Vec<Task>>>, CacheError> {
    match self.shared_fetch().await {
      Ok(tasks) => Ok(CacheResult::from_network(tasks)),
      Err(e) => {
        // Stale-but-present beats nothing
        let view = self.inner.store.view();
        match view.tasks {
          Some(tasks) => Ok(CacheResult::offline(tasks, view.fetched_at)),
          None => Err(e),
        }
      }
    }
  }

  /// Join the in-flight fetch of the current generation or start a new one.
  ///
  /// The request runs on its own task, so it completes and installs its result
  /// even if every caller stops waiting.
  fn shared_fetch(&self) -> SharedFetch {
    let generation = self.generation();
    let mut slot = self
      .inner
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner);

    if let Some(in_flight) = slot.as_ref() {
      if in_flight.generation == generation {
        tracing::debug!(generation, "joining in-flight task list fetch");
        return in_flight.fetch.clone();
      }
    }

    let this = self.clone();
    let handle = tokio::spawn(async move { this.run_fetch(generation).await });
    let fetch = async move {
      handle.await.unwrap_or_else(|e| {
        Err(CacheError::Transport(TransportError::Request(format!(
          "fetch task ended abnormally: {}",
          e
        ))))
      })
    }
    .boxed()
    .shared();

    *slot = Some(InFlight {
      generation,
      fetch: fetch.clone(),
    });
    fetch
  }

  async fn run_fetch(&self, generation: u64) -> Result<Arc<Vec<Task>>, CacheError> {
    self.inner.store.begin_fetch();
    self.inner.requests.fetch_add(1, Ordering::SeqCst);

    let result = self.inner.transport.list_tasks().await;
    self.release_in_flight(generation);

    match result {
      Ok(mut tasks) => {
        // Newest first
        tasks.reverse();
        let stale = self.generation() != generation;
        match self.inner.store.install(tasks, generation, stale) {
          Some(tasks) => {
            tracing::info!(count = tasks.len(), generation, "task list loaded");
            Ok(tasks)
          }
          None => {
            tracing::debug!(generation, "discarding superseded task list");
            Ok(self.inner.store.read().unwrap_or_default())
          }
        }
      }
      Err(e) => {
        tracing::warn!(error = %e, generation, "failed to load task list");
        self.inner.store.fail_fetch(e.to_string(), generation);
        Err(e.into())
      }
    }
  }

  fn release_in_flight(&self, generation: u64) {
    let mut slot = self
      .inner
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|f| f.generation == generation) {
      *slot = None;
    }
  }

  fn release_subscriber(&self) {
    if self.inner.subscribers.fetch_sub(1, Ordering::SeqCst) != 1 {
      return;
    }
    let epoch = self.inner.teardown_epoch.fetch_add(1, Ordering::SeqCst) + 1;

    // Without a runtime (e.g. during shutdown) the list just stays
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return;
    };
    let this = self.clone();
    runtime.spawn(async move {
      tokio::time::sleep(this.inner.keep_unused_for).await;
      let unused = this.subscriber_count() == 0
        && this.inner.teardown_epoch.load(Ordering::SeqCst) == epoch;
      if unused {
        tracing::info!("dropping unused task list");
        this.inner.store.clear();
      }
    });
  }
}

/// A live view of the task list.
///
/// Dropping the last subscription starts the retention window after which the
/// list is dropped.
pub struct TaskSubscription {
  receiver: watch::Receiver<CacheView>,
  coordinator: FetchCoordinator,
}

impl TaskSubscription {
  pub fn current(&self) -> CacheView {
    self.receiver.borrow().clone()
  }

  /// Returns `true` if the view changed since the last call.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    match self.receiver.has_changed() {
      Ok(true) => {
        let _ = self.receiver.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next change and return the new view.
  pub async fn changed(&mut self) -> Option<CacheView> {
    self.receiver.changed().await.ok()?;
    Some(self.receiver.borrow_and_update().clone())
  }

  /// Wait until the view satisfies `predicate`.
  pub async fn wait_for(&mut self, predicate: impl FnMut(&CacheView) -> bool) -> Option<CacheView> {
    self
      .receiver
      .wait_for(predicate)
      .await
      .ok()
      .map(|view| view.clone())
  }

  /// Refetch in the background.
  pub fn refetch(&self) {
    let coordinator = self.coordinator.clone();
    tokio::spawn(async move {
      let _ = coordinator.refetch().await;
    });
  }
}

impl Drop for TaskSubscription {
  fn drop(&mut self) {
    self.coordinator.release_subscriber();
  }
}

impl std::fmt::Debug for TaskSubscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskSubscription")
      .field("view", &*self.receiver.borrow())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::result::CacheSource;
  use crate::config::IdAssignment;
  use crate::task::{CreateTask, TaskId};
  use crate::transport::fake::{task, FakeServer};

  fn coordinator(server: &Arc<FakeServer>, config: CacheConfig) -> FetchCoordinator {
    let store = RecordStore::new(IdAssignment::Server);
    FetchCoordinator::new(store, server.clone() as Arc<dyn TaskTransport>, &config)
  }

  fn server(tasks: Vec<Task>) -> Arc<FakeServer> {
    Arc::new(FakeServer::with_tasks(tasks))
  }

  fn ids(tasks: &[Task]) -> Vec<TaskId> {
    tasks.iter().map(|t| t.id).collect()
  }

  #[tokio::test]
  async fn test_load_reverses_server_order() {
    let server = server(vec![task(1, "a"), task(2, "b"), task(3, "c")]);
    let fetch = coordinator(&server, CacheConfig::default());

    let result = fetch.load().await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(ids(&result.data), vec![3, 2, 1]);
    assert_eq!(ids(&fetch.store().read().unwrap()), vec![3, 2, 1]);
    assert_eq!(fetch.store().view().status, QueryStatus::Success);
  }

  #[tokio::test]
  async fn test_concurrent_loads_share_one_request() {
    let server = server(vec![task(1, "a")]);
    let fetch = coordinator(&server, CacheConfig::default());

    let (a, b, c) = tokio::join!(fetch.load(), fetch.load(), fetch.refetch());
    assert_eq!(server.list_calls(), 1);
    assert_eq!(fetch.request_count(), 1);
    for result in [a, b, c] {
      assert_eq!(ids(&result.unwrap().data), vec![1]);
    }
  }

  #[tokio::test]
  async fn test_fresh_list_is_served_without_request() {
    let server = server(vec![task(1, "a")]);
    let fetch = coordinator(&server, CacheConfig::default());

    fetch.load().await.unwrap();
    let second = fetch.load().await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert!(second.cached_at.is_some());
    assert_eq!(server.list_calls(), 1);
  }

  #[tokio::test]
  async fn test_invalidate_bypasses_short_circuit() {
    let server = server(vec![task(1, "a")]);
    let fetch = coordinator(&server, CacheConfig::default());

    fetch.load().await.unwrap();
    fetch.invalidate();
    assert!(fetch.store().view().is_stale);

    let result = fetch.load().await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(server.list_calls(), 2);
    assert!(!fetch.store().view().is_stale);
  }

  #[tokio::test]
  async fn test_failed_refetch_keeps_previous_list() {
    let server = server(vec![task(1, "a"), task(2, "b")]);
    let fetch = coordinator(&server, CacheConfig::default());
    fetch.load().await.unwrap();

    server.fail_list(true);
    fetch.invalidate();
    let result = fetch.load().await.unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(ids(&result.data), vec![2, 1]);
    let view = fetch.store().view();
    assert!(view.error().is_some());
    assert_eq!(ids(view.tasks()), vec![2, 1]);
  }

  #[tokio::test]
  async fn test_failed_first_load_is_error_not_absent_state() {
    let server = server(vec![task(1, "a")]);
    server.fail_list(true);
    let fetch = coordinator(&server, CacheConfig::default());

    let err = fetch.load().await.unwrap_err();
    assert!(matches!(err, CacheError::Transport(_)));
    let view = fetch.store().view();
    assert!(view.is_absent());
    assert!(view.status.is_error());
  }

  #[tokio::test]
  async fn test_subscribe_loads_in_background() {
    let server = server(vec![task(1, "a"), task(2, "b")]);
    let fetch = coordinator(&server, CacheConfig::default());

    let mut subscription = fetch.subscribe();
    let view = subscription.wait_for(|v| !v.is_absent()).await.unwrap();
    assert_eq!(ids(view.tasks()), vec![2, 1]);
    assert_eq!(fetch.subscriber_count(), 1);
  }

  #[tokio::test]
  async fn test_invalidate_refetches_for_subscribers() {
    let server = server(vec![task(1, "a")]);
    let fetch = coordinator(&server, CacheConfig::default());
    let mut subscription = fetch.subscribe();
    subscription.wait_for(|v| !v.is_absent()).await.unwrap();

    server
      .create_task(&CreateTask {
        id: None,
        value: "b".to_string(),
        completed: false,
      })
      .await
      .unwrap();
    fetch.invalidate();

    let view = subscription
      .wait_for(|v| !v.is_stale && v.tasks().len() == 2)
      .await
      .unwrap();
    assert_eq!(view.tasks()[0].value, "b");
    assert_eq!(server.list_calls(), 2);
  }

  #[tokio::test]
  async fn test_invalidate_without_subscribers_waits_for_next_load() {
    let server = server(vec![task(1, "a")]);
    let fetch = coordinator(&server, CacheConfig::default());
    fetch.load().await.unwrap();

    fetch.invalidate();
    tokio::task::yield_now().await;
    assert_eq!(server.list_calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unused_list_is_dropped_after_retention_window() {
    let server = server(vec![task(1, "a")]);
    let fetch = coordinator(&server, CacheConfig::default());

    let mut subscription = fetch.subscribe();
    subscription.wait_for(|v| !v.is_absent()).await.unwrap();
    drop(subscription);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(fetch.store().read().is_some());

    tokio::time::sleep(Duration::from_secs(31)).await;
    tokio::task::yield_now().await;
    assert!(fetch.store().read().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_resubscribing_cancels_teardown() {
    let server = server(vec![task(1, "a")]);
    let fetch = coordinator(&server, CacheConfig::default());

    let mut first = fetch.subscribe();
    first.wait_for(|v| !v.is_absent()).await.unwrap();
    drop(first);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let _second = fetch.subscribe();
    tokio::time::sleep(Duration::from_secs(61)).await;
    tokio::task::yield_now().await;
    assert!(fetch.store().read().is_some());
  }
}
