//! The single cached copy of the task list.
//!
//! [`RecordStore`] owns the list and publishes every change through a
//! `tokio::sync::watch` channel, so subscribers always see the latest state and
//! never an older one. The list sits behind an `Arc`, which makes snapshots cheap
//! and lets writers swap in a new list instead of editing a shared one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::query::QueryStatus;
use super::CacheError;
use crate::config::IdAssignment;
use crate::task::{Task, TaskId};

/// Where [`Patch::Insert`] puts its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
  /// At this index, clamped to the list length
  Index(usize),
  /// Right before the task with id `id`, or at `fallback` (clamped) if it is gone
  Before { id: TaskId, fallback: usize },
  /// After every other task
  End,
}

/// A single edit to the cached list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
  Insert { position: Position, task: Task },
  /// Replace the task with id `id` by `task`, which may carry a different id
  Replace { id: TaskId, task: Task },
  /// Remove the task with id `id`
  Remove { id: TaskId },
}

impl Patch {
  /// Id of the record this patch looks up or creates.
  pub fn target(&self) -> TaskId {
    match self {
      Patch::Insert { task, .. } => task.id,
      Patch::Replace { id, .. } | Patch::Remove { id } => *id,
    }
  }
}

/// Captured list contents, restorable with [`RecordStore::restore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
  tasks: Option<Arc<Vec<Task>>>,
}

impl Snapshot {
  pub fn tasks(&self) -> Option<&[Task]> {
    self.tasks.as_deref().map(Vec::as_slice)
  }
}

/// Result of a successful [`RecordStore::apply`].
#[derive(Debug, Clone)]
pub struct Applied {
  /// Patch that undoes the applied one
  pub inverse: Patch,
  /// List contents right before the patch
  pub before: Snapshot,
  /// List version right after the patch
  pub version: u64,
}

/// What subscribers see: the list plus the state of the fetch that produced it.
#[derive(Debug, Clone, Default)]
pub struct CacheView {
  /// `None` until the first successful fetch (or after teardown)
  pub tasks: Option<Arc<Vec<Task>>>,
  pub status: QueryStatus,
  /// Set by invalidation, cleared by the next installed fetch
  pub is_stale: bool,
  pub fetched_at: Option<DateTime<Utc>>,
  /// Bumped on every change to `tasks`
  pub version: u64,
  installed_generation: u64,
}

impl CacheView {
  /// Tasks in display order, empty when nothing is loaded.
  pub fn tasks(&self) -> &[Task] {
    self.tasks.as_deref().map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn is_absent(&self) -> bool {
    self.tasks.is_none()
  }

  /// First load still running, nothing to show yet.
  pub fn is_loading(&self) -> bool {
    self.status.is_loading() && self.tasks.is_none()
  }

  /// Any fetch running, including background refreshes.
  pub fn is_fetching(&self) -> bool {
    self.status.is_loading()
  }

  pub fn error(&self) -> Option<&str> {
    self.status.error()
  }

  pub fn find(&self, id: TaskId) -> Option<&Task> {
    self.tasks().iter().find(|t| t.id == id)
  }
}

/// Hands out ids for added tasks, scoped to one store.
#[derive(Debug)]
struct IdReservation {
  assignment: IdAssignment,
  /// Next placeholder under server assignment, counts down from -1
  next_placeholder: AtomicI64,
  /// Highest id seen so far
  high_water: AtomicI64,
}

impl IdReservation {
  fn new(assignment: IdAssignment) -> Self {
    Self {
      assignment,
      next_placeholder: AtomicI64::new(-1),
      high_water: AtomicI64::new(0),
    }
  }

  fn reserve(&self) -> TaskId {
    match self.assignment {
      IdAssignment::Server => self.next_placeholder.fetch_sub(1, Ordering::SeqCst),
      IdAssignment::Client => self.high_water.fetch_add(1, Ordering::SeqCst) + 1,
    }
  }

  fn observe(&self, id: TaskId) {
    self.high_water.fetch_max(id, Ordering::SeqCst);
  }
}

/// The cached task list. Cloning shares the same list.
#[derive(Clone)]
pub struct RecordStore {
  inner: Arc<StoreInner>,
}

struct StoreInner {
  state: watch::Sender<CacheView>,
  ids: IdReservation,
}

impl RecordStore {
  pub fn new(assignment: IdAssignment) -> Self {
    let (state, _) = watch::channel(CacheView::default());
    Self {
      inner: Arc::new(StoreInner {
        state,
        ids: IdReservation::new(assignment),
      }),
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<CacheView> {
    self.inner.state.subscribe()
  }

  pub fn view(&self) -> CacheView {
    self.inner.state.borrow().clone()
  }

  /// Current list, `None` if it was never fetched.
  pub fn read(&self) -> Option<Arc<Vec<Task>>> {
    self.inner.state.borrow().tasks.clone()
  }

  pub fn version(&self) -> u64 {
    self.inner.state.borrow().version
  }

  pub fn find(&self, id: TaskId) -> Option<Task> {
    self.inner.state.borrow().find(id).cloned()
  }

  pub fn id_assignment(&self) -> IdAssignment {
    self.inner.ids.assignment
  }

  /// Reserve an id for a task that is about to be added.
  pub fn reserve_id(&self) -> TaskId {
    self.inner.ids.reserve()
  }

  /// Whether `id` is a placeholder waiting for a server-assigned id.
  pub fn is_placeholder(&self, id: TaskId) -> bool {
    self.inner.ids.assignment == IdAssignment::Server && id < 0
  }

  /// Apply `patch` and return its inverse.
  ///
  /// Fails with `NotLoaded` when there is no list, `NotFound` when a replace or
  /// remove target is missing, and `IdentityConflict` when the patch would put a
  /// second task with the same id in the list. A failed patch changes nothing.
  pub fn apply(&self, patch: &Patch) -> Result<Applied, CacheError> {
    let mut outcome = Err(CacheError::NotLoaded);
    self.inner.state.send_if_modified(|view| {
      let Some(tasks) = view.tasks.as_mut() else {
        return false;
      };
      let mut next = Vec::clone(tasks);
      match apply_patch(&mut next, patch) {
        Ok(inverse) => {
          let before = Snapshot {
            tasks: Some(std::mem::replace(tasks, Arc::new(next))),
          };
          view.version += 1;
          outcome = Ok(Applied {
            inverse,
            before,
            version: view.version,
          });
          true
        }
        Err(e) => {
          outcome = Err(e);
          false
        }
      }
    });

    if outcome.is_ok() {
      match patch {
        Patch::Insert { task, .. } | Patch::Replace { task, .. } => self.inner.ids.observe(task.id),
        Patch::Remove { .. } => {}
      }
    }
    outcome
  }

  pub fn snapshot(&self) -> Snapshot {
    Snapshot {
      tasks: self.read(),
    }
  }

  pub fn restore(&self, snapshot: Snapshot) {
    self.inner.state.send_modify(|view| {
      view.tasks = snapshot.tasks;
      view.version += 1;
    });
  }

  /// Restore `snapshot` only if nothing changed the list since `version`.
  pub fn restore_if_current(&self, version: u64, snapshot: Snapshot) -> bool {
    self.inner.state.send_if_modified(|view| {
      if view.version != version {
        return false;
      }
      view.tasks = snapshot.tasks;
      view.version += 1;
      true
    })
  }

  /// Install a fetched list.
  ///
  /// Results from a generation older than the installed one are dropped and
  /// `None` is returned. Duplicate ids keep their first occurrence.
  pub fn install(
    &self,
    mut tasks: Vec<Task>,
    generation: u64,
    stale: bool,
  ) -> Option<Arc<Vec<Task>>> {
    let mut seen = HashSet::with_capacity(tasks.len());
    let fetched = tasks.len();
    tasks.retain(|t| seen.insert(t.id));
    if tasks.len() != fetched {
      tracing::warn!(
        dropped = fetched - tasks.len(),
        "server returned duplicate task ids"
      );
    }
    if let Some(max) = tasks.iter().map(|t| t.id).max() {
      self.inner.ids.observe(max);
    }

    let tasks = Arc::new(tasks);
    let installed = self.inner.state.send_if_modified(|view| {
      if generation < view.installed_generation {
        return false;
      }
      view.tasks = Some(Arc::clone(&tasks));
      view.status = QueryStatus::Success;
      view.is_stale = stale;
      view.fetched_at = Some(Utc::now());
      view.installed_generation = generation;
      view.version += 1;
      true
    });
    installed.then_some(tasks)
  }

  pub fn begin_fetch(&self) {
    self.inner.state.send_modify(|view| view.status = QueryStatus::Loading);
  }

  /// Record a failed fetch. The list itself is left alone.
  pub fn fail_fetch(&self, message: String, generation: u64) {
    self.inner.state.send_if_modified(|view| {
      if generation < view.installed_generation {
        return false;
      }
      view.status = QueryStatus::Error(message);
      true
    });
  }

  pub fn mark_stale(&self) {
    self.inner.state.send_if_modified(|view| {
      let changed = !view.is_stale;
      view.is_stale = true;
      changed
    });
  }

  /// Drop the list, back to the never-fetched state.
  pub fn clear(&self) {
    self.inner.state.send_modify(|view| {
      view.tasks = None;
      view.status = QueryStatus::Idle;
      view.is_stale = false;
      view.fetched_at = None;
      view.version += 1;
    });
  }
}

/// Apply `patch` to `tasks`, returning the inverse patch.
fn apply_patch(tasks: &mut Vec<Task>, patch: &Patch) -> Result<Patch, CacheError> {
  let position = |tasks: &[Task], id: TaskId| tasks.iter().position(|t| t.id == id);

  match patch {
    Patch::Insert { position: at, task } => {
      if position(tasks, task.id).is_some() {
        return Err(CacheError::IdentityConflict(task.id));
      }
      let index = match *at {
        Position::Index(index) => index.min(tasks.len()),
        Position::Before { id, fallback } => {
          position(tasks, id).unwrap_or_else(|| fallback.min(tasks.len()))
        }
        Position::End => tasks.len(),
      };
      tasks.insert(index, task.clone());
      Ok(Patch::Remove { id: task.id })
    }
    Patch::Replace { id, task } => {
      let index = position(tasks, *id).ok_or(CacheError::NotFound(*id))?;
      if task.id != *id && position(tasks, task.id).is_some() {
        return Err(CacheError::IdentityConflict(task.id));
      }
      let previous = std::mem::replace(&mut tasks[index], task.clone());
      Ok(Patch::Replace {
        id: task.id,
        task: previous,
      })
    }
    Patch::Remove { id } => {
      let index = position(tasks, *id).ok_or(CacheError::NotFound(*id))?;
      let removed = tasks.remove(index);
      // Reinsert before the successor, wherever it has moved by then
      let anchor = match tasks.get(index) {
        Some(next) => Position::Before {
          id: next.id,
          fallback: index,
        },
        None => Position::End,
      };
      Ok(Patch::Insert {
        position: anchor,
        task: removed,
      })
    }
  }
}
