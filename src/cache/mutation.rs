//! Optimistic add, update and delete.
//!
//! Every mutation goes through the same steps:
//!
//! ```text
//!   dispatch ──▶ journal.apply(patch) ──▶ spawn remote request ──┬─ ok ──▶ commit / reconcile
//!   (caller sees the patch right away)                           └─ err ─▶ journal.undo
//!                                                                  then: invalidate the list
//! ```
//!
//! The remote request runs on its own task, so the store is reconciled or rolled
//! back even if whoever dispatched the mutation is gone by then.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use super::journal::{Journal, JournalToken};
use super::query::FetchCoordinator;
use super::store::{Patch, Position, RecordStore};
use super::CacheError;
use crate::config::{IdAssignment, UpdateDefaults};
use crate::task::{
  CreateTask, Task, TaskDraft, TaskId, UpdateTask, DEFAULT_NEW_VALUE, DEFAULT_UPDATED_VALUE,
};
use crate::transport::{TaskTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
  Add,
  Update,
  Delete,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      MutationKind::Add => "add",
      MutationKind::Update => "update",
      MutationKind::Delete => "delete",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Where a single mutation is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationState {
  /// Dispatched without an optimistic patch (nothing loaded to patch)
  Pending,
  /// Patch visible in the cache, waiting for the server
  OptimisticApplied,
  /// Server accepted it; carries the server's record when it returns one
  Reconciled(Option<Task>),
  /// Server refused it or was unreachable; the patch was undone
  RolledBack(TransportError),
}

impl MutationState {
  pub fn is_settled(&self) -> bool {
    matches!(
      self,
      MutationState::Reconciled(_) | MutationState::RolledBack(_)
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightMutation {
  pub kind: MutationKind,
  pub target: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationFailure {
  pub id: MutationId,
  pub kind: MutationKind,
  pub target: TaskId,
  pub error: TransportError,
}

/// Mutation flags for the UI.
#[derive(Debug, Clone, Default)]
pub struct MutationActivity {
  pub in_flight: BTreeMap<MutationId, InFlightMutation>,
  /// Set when the most recently settled mutation was rolled back
  pub last_failure: Option<MutationFailure>,
}

impl MutationActivity {
  pub fn is_idle(&self) -> bool {
    self.in_flight.is_empty()
  }

  pub fn is_in_flight(&self, kind: MutationKind) -> bool {
    self.in_flight.values().any(|m| m.kind == kind)
  }

  pub fn is_target_in_flight(&self, target: TaskId) -> bool {
    self.in_flight.values().any(|m| m.target == target)
  }
}

/// Returned by dispatch; follows one mutation until it settles.
#[derive(Debug)]
pub struct MutationHandle {
  id: MutationId,
  kind: MutationKind,
  target: TaskId,
  state: watch::Receiver<MutationState>,
}

impl MutationHandle {
  pub fn id(&self) -> MutationId {
    self.id
  }

  pub fn kind(&self) -> MutationKind {
    self.kind
  }

  /// Task id the mutation acts on. For adds this is the reserved id.
  pub fn target(&self) -> TaskId {
    self.target
  }

  pub fn state(&self) -> MutationState {
    self.state.borrow().clone()
  }

  /// Wait until the mutation is reconciled or rolled back.
  pub async fn settled(mut self) -> MutationState {
    if let Ok(state) = self.state.wait_for(MutationState::is_settled).await {
      return state.clone();
    }
    self.state.borrow().clone()
  }
}

/// Sender side of a [`MutationHandle`], owned by the remote task.
struct Tracker {
  id: MutationId,
  kind: MutationKind,
  target: TaskId,
  state: watch::Sender<MutationState>,
}

impl UpdateDefaults {
  /// Merge `draft` over `current`, returning the optimistic record and the PATCH body.
  pub fn resolve(self, current: &Task, draft: TaskDraft) -> (Task, UpdateTask) {
    match self {
      UpdateDefaults::Replace => {
        let value = draft
          .value
          .unwrap_or_else(|| DEFAULT_UPDATED_VALUE.to_string());
        let completed = draft.completed.unwrap_or(false);
        let task = Task {
          id: current.id,
          value: value.clone(),
          completed,
        };
        let body = UpdateTask {
          value: Some(value),
          completed: Some(completed),
        };
        (task, body)
      }
      UpdateDefaults::Preserve => {
        let task = Task {
          id: current.id,
          value: draft.value.clone().unwrap_or_else(|| current.value.clone()),
          completed: draft.completed.unwrap_or(current.completed),
        };
        let body = UpdateTask {
          value: draft.value,
          completed: draft.completed,
        };
        (task, body)
      }
    }
  }
}

/// Dispatches optimistic mutations. Cloning shares the pipeline.
#[derive(Clone)]
pub struct MutationPipeline {
  inner: Arc<PipelineInner>,
}

struct PipelineInner {
  store: RecordStore,
  journal: Journal,
  fetch: FetchCoordinator,
  transport: Arc<dyn TaskTransport>,
  update_defaults: UpdateDefaults,
  next_id: AtomicU64,
  activity: watch::Sender<MutationActivity>,
}

impl MutationPipeline {
  pub fn new(
    fetch: FetchCoordinator,
    journal: Journal,
    transport: Arc<dyn TaskTransport>,
    update_defaults: UpdateDefaults,
  ) -> Self {
    let (activity, _) = watch::channel(MutationActivity::default());
    Self {
      inner: Arc::new(PipelineInner {
        store: fetch.store().clone(),
        journal,
        fetch,
        transport,
        update_defaults,
        next_id: AtomicU64::new(0),
        activity,
      }),
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<MutationActivity> {
    self.inner.activity.subscribe()
  }

  pub fn activity(&self) -> MutationActivity {
    self.inner.activity.borrow().clone()
  }

  /// Add a task. Omitted fields default to "New Task" / not completed.
  ///
  /// The task shows up at the front of the list under a reserved id before this
  /// returns. When the server answers, the record with that id is replaced by the
  /// server's record. If nothing is loaded yet the request is still sent, just
  /// without the optimistic insert. Under client id assignment that case fails
  /// with `NotLoaded` instead, since no id is known to be free.
  pub fn add(&self, draft: TaskDraft) -> Result<MutationHandle, CacheError> {
    let store = &self.inner.store;
    let value = draft
      .value
      .unwrap_or_else(|| DEFAULT_NEW_VALUE.to_string());
    let completed = draft.completed.unwrap_or(false);

    let reserved = store.reserve_id();
    let placeholder = Task {
      id: reserved,
      value: value.clone(),
      completed,
    };
    let insert = Patch::Insert {
      position: Position::Index(0),
      task: placeholder,
    };
    let token = match self.inner.journal.apply(store, MutationKind::Add, insert) {
      Ok(token) => Some(token),
      Err(CacheError::NotLoaded) if store.id_assignment() == IdAssignment::Server => {
        tracing::debug!(id = reserved, "task list not loaded, adding without optimistic insert");
        None
      }
      Err(CacheError::NotLoaded) => {
        // A client id is only safe once the server's ids have been seen
        tracing::debug!("task list not loaded, refusing to pick a client id");
        return Err(CacheError::NotLoaded);
      }
      Err(e) => {
        tracing::error!(id = reserved, error = %e, "reserved id collides with a cached task");
        return Err(e);
      }
    };

    let body = CreateTask {
      id: (store.id_assignment() == IdAssignment::Client).then_some(reserved),
      value,
      completed,
    };
    let (handle, tracker) = self.begin(MutationKind::Add, reserved, token.is_some());
    let transport = Arc::clone(&self.inner.transport);
    self.spawn_remote(
      tracker,
      token,
      async move { transport.create_task(&body).await },
      move |this, token, confirmed| {
        this.reconcile_add(token, reserved, &confirmed);
        Some(confirmed)
      },
    );
    Ok(handle)
  }

  /// Update a cached task, merging `draft` according to the configured defaults.
  ///
  /// A task that is not in the cache yields `NotFound` and nothing is sent.
  pub fn update(&self, id: TaskId, draft: TaskDraft) -> Result<MutationHandle, CacheError> {
    let Some(current) = self.inner.store.find(id) else {
      tracing::debug!(id, "update target not in cache, ignoring");
      return Err(CacheError::NotFound(id));
    };
    let (next, body) = self.inner.update_defaults.resolve(&current, draft);

    let replace = Patch::Replace { id, task: next };
    let token = self
      .inner
      .journal
      .apply(&self.inner.store, MutationKind::Update, replace)?;

    let (handle, tracker) = self.begin(MutationKind::Update, id, true);
    let transport = Arc::clone(&self.inner.transport);
    self.spawn_remote(
      tracker,
      Some(token),
      async move { transport.update_task(id, &body).await },
      |this, token, confirmed| {
        this.commit(token);
        Some(confirmed)
      },
    );
    Ok(handle)
  }

  /// Delete a cached task. A task that is not in the cache yields `NotFound`.
  pub fn delete(&self, id: TaskId) -> Result<MutationHandle, CacheError> {
    if self.inner.store.find(id).is_none() {
      tracing::debug!(id, "delete target not in cache, ignoring");
      return Err(CacheError::NotFound(id));
    }
    let token = self
      .inner
      .journal
      .apply(&self.inner.store, MutationKind::Delete, Patch::Remove { id })?;

    let (handle, tracker) = self.begin(MutationKind::Delete, id, true);
    let transport = Arc::clone(&self.inner.transport);
    self.spawn_remote(
      tracker,
      Some(token),
      async move { transport.delete_task(id).await },
      |this, token, ()| {
        this.commit(token);
        None
      },
    );
    Ok(handle)
  }

  fn begin(
    &self,
    kind: MutationKind,
    target: TaskId,
    optimistic: bool,
  ) -> (MutationHandle, Tracker) {
    let id = MutationId(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    let initial = if optimistic {
      MutationState::OptimisticApplied
    } else {
      MutationState::Pending
    };
    let (state, receiver) = watch::channel(initial);
    self.inner.activity.send_modify(|activity| {
      activity
        .in_flight
        .insert(id, InFlightMutation { kind, target });
    });
    tracing::debug!(mutation = %id, %kind, task = target, optimistic, "mutation dispatched");

    let handle = MutationHandle {
      id,
      kind,
      target,
      state: receiver,
    };
    let tracker = Tracker {
      id,
      kind,
      target,
      state,
    };
    (handle, tracker)
  }

  /// Run `request` on its own task, then reconcile or roll back and settle.
  fn spawn_remote<T, Fut, R>(
    &self,
    tracker: Tracker,
    token: Option<JournalToken>,
    request: Fut,
    reconcile: R,
  ) where
    T: Send + 'static,
    Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    R: FnOnce(&Self, Option<JournalToken>, T) -> Option<Task> + Send + 'static,
  {
    let this = self.clone();
    tokio::spawn(async move {
      let state = match request.await {
        Ok(response) => MutationState::Reconciled(reconcile(&this, token, response)),
        Err(error) => {
          tracing::warn!(
            mutation = %tracker.id,
            kind = %tracker.kind,
            task = tracker.target,
            %error,
            "remote mutation failed, rolling back"
          );
          if let Some(token) = token {
            this.inner.journal.undo(&this.inner.store, token);
          }
          MutationState::RolledBack(error)
        }
      };
      this.settle(tracker, state);
    });
  }

  fn commit(&self, token: Option<JournalToken>) {
    if let Some(token) = token {
      self.inner.journal.commit(token);
    }
  }

  /// Swap the placeholder for the server-confirmed record, matched by id.
  fn reconcile_add(&self, token: Option<JournalToken>, placeholder: TaskId, confirmed: &Task) {
    let Some(token) = token else {
      return;
    };
    let (store, journal) = (&self.inner.store, &self.inner.journal);
    journal.commit(token);

    let replace = Patch::Replace {
      id: placeholder,
      task: confirmed.clone(),
    };
    match journal.apply_permanent(store, &replace) {
      Ok(()) => {}
      Err(CacheError::IdentityConflict(_)) => {
        // A refetch already brought in the confirmed record
        let _ = journal.apply_permanent(store, &Patch::Remove { id: placeholder });
      }
      Err(e) => {
        tracing::debug!(placeholder, error = %e, "placeholder gone before reconciliation");
      }
    }
  }

  fn settle(&self, tracker: Tracker, state: MutationState) {
    self.inner.activity.send_modify(|activity| {
      activity.in_flight.remove(&tracker.id);
      activity.last_failure = match &state {
        MutationState::RolledBack(error) => Some(MutationFailure {
          id: tracker.id,
          kind: tracker.kind,
          target: tracker.target,
          error: error.clone(),
        }),
        _ => None,
      };
    });

    match &state {
      MutationState::RolledBack(_) => {
        tracing::info!(mutation = %tracker.id, kind = %tracker.kind, task = tracker.target, "mutation rolled back")
      }
      _ => {
        tracing::info!(mutation = %tracker.id, kind = %tracker.kind, task = tracker.target, "mutation reconciled")
      }
    }

    // Settled either way; a refetch repairs anything reconciliation or rollback missed
    self.inner.fetch.invalidate();
    tracker.state.send_replace(state);
  }
}
