//! Undo journal for optimistic patches.
//!
//! Each entry keeps the forward patch, its precomputed inverse and the list as it
//! was before the patch. Undo restores that snapshot when nothing else touched the
//! list in between. Otherwise it applies only the inverse, so unrelated changes
//! made in the meantime survive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::mutation::MutationKind;
use super::store::{Applied, Patch, RecordStore, Snapshot};
use super::CacheError;
use crate::task::TaskId;

/// Handle to one journaled patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JournalToken(u64);

/// An optimistic patch that has not settled yet.
#[derive(Debug, Clone)]
pub struct PendingPatch {
  pub kind: MutationKind,
  pub target: TaskId,
  pub patch: Patch,
  pub inverse: Patch,
  before: Snapshot,
  after_version: u64,
}

/// Journal of outstanding optimistic patches. Cloning shares the journal.
#[derive(Clone, Default)]
pub struct Journal {
  inner: Arc<Mutex<JournalInner>>,
}

#[derive(Default)]
struct JournalInner {
  next_token: u64,
  entries: HashMap<JournalToken, PendingPatch>,
}

impl JournalInner {
  fn record(&mut self, kind: MutationKind, patch: Patch, applied: Applied) -> JournalToken {
    self.next_token += 1;
    let token = JournalToken(self.next_token);
    self.entries.insert(
      token,
      PendingPatch {
        kind,
        target: patch.target(),
        patch,
        inverse: applied.inverse,
        before: applied.before,
        after_version: applied.version,
      },
    );
    token
  }
}

impl Journal {
  pub fn new() -> Self {
    Self::default()
  }

  // Entries stay consistent even if a holder panicked: every write is a single insert/remove
  fn lock(&self) -> MutexGuard<'_, JournalInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Apply `patch` to `store` and journal it.
  ///
  /// Journaled patches are applied one at a time. Nothing is recorded when the
  /// store rejects the patch.
  pub fn apply(
    &self,
    store: &RecordStore,
    kind: MutationKind,
    patch: Patch,
  ) -> Result<JournalToken, CacheError> {
    let mut inner = self.lock();
    let applied = store.apply(&patch)?;
    let token = inner.record(kind, patch, applied);
    tracing::trace!(?token, %kind, "journaled optimistic patch");
    Ok(token)
  }

  /// Apply a patch that is final as soon as it lands (reconciliation).
  pub fn apply_permanent(&self, store: &RecordStore, patch: &Patch) -> Result<(), CacheError> {
    let _guard = self.lock();
    store.apply(patch).map(|_| ())
  }

  /// Undo the patch behind `token`.
  ///
  /// Returns `false` if the token was already undone or committed, in which case
  /// nothing happens.
  pub fn undo(&self, store: &RecordStore, token: JournalToken) -> bool {
    let mut inner = self.lock();
    let Some(entry) = inner.entries.remove(&token) else {
      return false;
    };

    if store.restore_if_current(entry.after_version, entry.before) {
      tracing::debug!(?token, task = entry.target, "undo restored pre-patch snapshot");
      return true;
    }

    match store.apply(&entry.inverse) {
      Ok(_) => {
        tracing::debug!(?token, task = entry.target, "undo applied inverse patch");
      }
      Err(CacheError::NotFound(_)) | Err(CacheError::NotLoaded) => {
        tracing::debug!(?token, task = entry.target, "undo target already gone");
      }
      Err(CacheError::IdentityConflict(id)) => {
        tracing::debug!(?token, id, "undo skipped, record already present");
      }
      Err(e) => {
        tracing::warn!(?token, error = %e, "undo failed");
      }
    }
    true
  }

  /// Make the patch behind `token` permanent.
  pub fn commit(&self, token: JournalToken) -> bool {
    self.lock().entries.remove(&token).is_some()
  }

  #[cfg(test)]
  pub(crate) fn get(&self, token: JournalToken) -> Option<PendingPatch> {
    self.lock().entries.get(&token).cloned()
  }

  /// Number of patches waiting to be committed or undone.
  pub fn pending(&self) -> usize {
    self.lock().entries.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::Position;
  use crate::config::IdAssignment;
  use crate::task::Task;
  use crate::transport::fake::task;

  fn loaded(tasks: Vec<Task>) -> RecordStore {
    let store = RecordStore::new(IdAssignment::Server);
    store.install(tasks, 0, false);
    store
  }

  #[test]
  fn test_undo_is_idempotent() {
    let store = loaded(vec![task(2, "b"), task(1, "a")]);
    let journal = Journal::new();
    let token = journal
      .apply(&store, MutationKind::Delete, Patch::Remove { id: 1 })
      .unwrap();

    assert!(journal.undo(&store, token));
    let once = store.read();
    assert!(!journal.undo(&store, token));
    assert_eq!(store.read(), once);
    assert_eq!(store.read().unwrap().as_slice(), &[task(2, "b"), task(1, "a")]);
  }

  #[test]
  fn test_rejected_patch_is_not_journaled() {
    let store = loaded(vec![task(1, "a")]);
    let journal = Journal::new();
    let err = journal
      .apply(&store, MutationKind::Update, Patch::Remove { id: 999 })
      .unwrap_err();
    assert_eq!(err, CacheError::NotFound(999));
    assert_eq!(journal.pending(), 0);
  }

  #[test]
  fn test_undo_keeps_interleaved_changes() {
    let store = loaded(vec![task(3, "c"), task(2, "b"), task(1, "a")]);
    let journal = Journal::new();
    let delete = journal
      .apply(&store, MutationKind::Delete, Patch::Remove { id: 2 })
      .unwrap();
    let update = journal
      .apply(
        &store,
        MutationKind::Update,
        Patch::Replace {
          id: 3,
          task: task(3, "c edited"),
        },
      )
      .unwrap();

    assert!(journal.undo(&store, delete));
    assert_eq!(
      store.read().unwrap().as_slice(),
      &[task(3, "c edited"), task(2, "b"), task(1, "a")]
    );

    assert!(journal.commit(update));
    assert_eq!(journal.pending(), 0);
  }

  #[test]
  fn test_undo_delete_keeps_neighbours_after_front_insert() {
    let store = loaded(vec![task(9, "i"), task(5, "e"), task(1, "a")]);
    let journal = Journal::new();
    let delete = journal
      .apply(&store, MutationKind::Delete, Patch::Remove { id: 5 })
      .unwrap();
    let add = journal
      .apply(
        &store,
        MutationKind::Add,
        Patch::Insert {
          position: Position::Index(0),
          task: task(-1, "new"),
        },
      )
      .unwrap();

    assert!(journal.undo(&store, delete));
    assert_eq!(
      store.read().unwrap().as_slice(),
      &[task(-1, "new"), task(9, "i"), task(5, "e"), task(1, "a")]
    );
    assert!(journal.commit(add));
  }

  #[test]
  fn test_undo_after_list_replaced_is_noop() {
    let store = loaded(vec![task(1, "a")]);
    let journal = Journal::new();
    let token = journal
      .apply(
        &store,
        MutationKind::Add,
        Patch::Insert {
          position: Position::Index(0),
          task: task(-1, "new"),
        },
      )
      .unwrap();
    store.install(vec![task(5, "fresh")], 1, false);

    assert!(journal.undo(&store, token));
    assert_eq!(store.read().unwrap().as_slice(), &[task(5, "fresh")]);
  }

  #[test]
  fn test_reinsert_skipped_when_record_came_back() {
    let store = loaded(vec![task(2, "b"), task(1, "a")]);
    let journal = Journal::new();
    let token = journal
      .apply(&store, MutationKind::Delete, Patch::Remove { id: 1 })
      .unwrap();
    store.install(vec![task(2, "b"), task(1, "a")], 1, false);

    assert!(journal.undo(&store, token));
    assert_eq!(store.read().unwrap().len(), 2);
  }

  #[test]
  fn test_pending_entry_describes_patch() {
    let store = loaded(vec![task(1, "a")]);
    let journal = Journal::new();
    let token = journal
      .apply(&store, MutationKind::Delete, Patch::Remove { id: 1 })
      .unwrap();
    let entry = journal.get(token).unwrap();
    assert_eq!(entry.kind, MutationKind::Delete);
    assert_eq!(entry.target, 1);
    assert_eq!(
      entry.inverse,
      Patch::Insert {
        position: Position::End,
        task: task(1, "a")
      }
    );
  }
}
