//! Optimistic cache for the remote task list.
//!
//! This module keeps one copy of the task collection in memory and keeps it in
//! step with the server:
//! - [`RecordStore`] holds the list and notifies subscribers of every change
//! - [`FetchCoordinator`] loads it, deduplicating concurrent requests
//! - [`MutationPipeline`] applies add/update/delete optimistically and reconciles
//!   or rolls back when the server answers
//! - [`Journal`] keeps the inverse of each optimistic patch until it settles
//!
//! Every settled mutation invalidates the list, so a background refetch repairs
//! any drift between the cache and the server.

mod journal;
mod mutation;
mod query;
mod result;
mod store;

pub use journal::{Journal, JournalToken, PendingPatch};
pub use mutation::{
  InFlightMutation, MutationActivity, MutationFailure, MutationHandle, MutationId, MutationKind,
  MutationPipeline, MutationState,
};
pub use query::{FetchCoordinator, QueryStatus, TaskSubscription};
pub use result::{CacheResult, CacheSource};
pub use store::{Applied, CacheView, Patch, Position, RecordStore, Snapshot};

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::CacheConfig;
use crate::task::{Task, TaskDraft, TaskId};
use crate::transport::{TaskTransport, TransportError};

/// Errors surfaced by the cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
  #[error(transparent)]
  Transport(#[from] TransportError),
  /// No cached task has this id; callers treat it as a no-op
  #[error("task {0} is not in the cache")]
  NotFound(TaskId),
  /// A patch would have put two tasks with the same id in the list
  #[error("task id {0} is already in the cache")]
  IdentityConflict(TaskId),
  #[error("task list has not been loaded")]
  NotLoaded,
}

/// The task cache as seen by the UI: reads, subscriptions and mutations.
///
/// Cloning is cheap and every clone shares the same list.
#[derive(Clone)]
pub struct TaskCache {
  fetch: FetchCoordinator,
  journal: Journal,
  mutations: MutationPipeline,
}

impl TaskCache {
  pub fn new(transport: Arc<dyn TaskTransport>, config: &CacheConfig) -> Self {
    let store = RecordStore::new(config.id_assignment);
    let fetch = FetchCoordinator::new(store, Arc::clone(&transport), config);
    let journal = Journal::new();
    let mutations = MutationPipeline::new(
      fetch.clone(),
      journal.clone(),
      transport,
      config.update_defaults,
    );

    Self {
      fetch,
      journal,
      mutations,
    }
  }

  pub fn store(&self) -> &RecordStore {
    self.fetch.store()
  }

  pub fn journal(&self) -> &Journal {
    &self.journal
  }

  pub fn view(&self) -> CacheView {
    self.store().view()
  }

  /// Subscribe to the task list, loading it if needed.
  pub fn subscribe(&self) -> TaskSubscription {
    self.fetch.subscribe()
  }

  pub fn subscribe_mutations(&self) -> watch::Receiver<MutationActivity> {
    self.mutations.subscribe()
  }

  pub fn mutation_activity(&self) -> MutationActivity {
    self.mutations.activity()
  }

  pub async fn load(&self) -> Result<CacheResult<Arc<Vec<Task>>>, CacheError> {
    self.fetch.load().await
  }

  pub async fn refetch(&self) -> Result<CacheResult<Arc<Vec<Task>>>, CacheError> {
    self.fetch.refetch().await
  }

  pub fn invalidate(&self) {
    self.fetch.invalidate();
  }

  /// Number of list requests sent so far.
  pub fn request_count(&self) -> u64 {
    self.fetch.request_count()
  }

  pub fn add(&self, draft: TaskDraft) -> Result<MutationHandle, CacheError> {
    self.mutations.add(draft)
  }

  pub fn update(&self, id: TaskId, draft: TaskDraft) -> Result<MutationHandle, CacheError> {
    self.mutations.update(id, draft)
  }

  pub fn delete(&self, id: TaskId) -> Result<MutationHandle, CacheError> {
    self.mutations.delete(id)
  }
}
