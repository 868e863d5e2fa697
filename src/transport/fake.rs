//! In-memory task server used by the cache tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{TaskTransport, TransportError};
use crate::task::{CreateTask, Task, TaskId, UpdateTask};

#[derive(Default)]
pub(crate) struct FakeServer {
  tasks: Mutex<Vec<Task>>,
  next_id: AtomicI64,
  fail_list: AtomicBool,
  fail_update: AtomicBool,
  fail_delete: AtomicBool,
  /// Creates whose value is in this set are rejected
  failing_values: Mutex<HashSet<String>>,
  list_calls: AtomicUsize,
  creates: Mutex<Vec<CreateTask>>,
  updates: Mutex<Vec<(TaskId, UpdateTask)>>,
  deletes: Mutex<Vec<TaskId>>,
}

impl FakeServer {
  /// A server holding `tasks` in creation order.
  pub fn with_tasks(tasks: Vec<Task>) -> Self {
    let next_id = tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
    Self {
      tasks: Mutex::new(tasks),
      next_id: AtomicI64::new(next_id),
      ..Default::default()
    }
  }

  pub fn set_next_id(&self, id: TaskId) {
    self.next_id.store(id, Ordering::SeqCst);
  }

  pub fn fail_list(&self, fail: bool) {
    self.fail_list.store(fail, Ordering::SeqCst);
  }

  pub fn fail_update(&self, fail: bool) {
    self.fail_update.store(fail, Ordering::SeqCst);
  }

  pub fn fail_delete(&self, fail: bool) {
    self.fail_delete.store(fail, Ordering::SeqCst);
  }

  pub fn fail_create_of(&self, value: &str) {
    self.failing_values.lock().unwrap().insert(value.to_string());
  }

  pub fn list_calls(&self) -> usize {
    self.list_calls.load(Ordering::SeqCst)
  }

  pub fn creates(&self) -> Vec<CreateTask> {
    self.creates.lock().unwrap().clone()
  }

  pub fn updates(&self) -> Vec<(TaskId, UpdateTask)> {
    self.updates.lock().unwrap().clone()
  }

  pub fn deletes(&self) -> Vec<TaskId> {
    self.deletes.lock().unwrap().clone()
  }

  pub fn tasks(&self) -> Vec<Task> {
    self.tasks.lock().unwrap().clone()
  }

  fn server_error() -> TransportError {
    TransportError::Status {
      status: 500,
      body: "internal error".to_string(),
    }
  }
}

#[async_trait]
impl TaskTransport for FakeServer {
  async fn list_tasks(&self) -> Result<Vec<Task>, TransportError> {
    self.list_calls.fetch_add(1, Ordering::SeqCst);
    tokio::task::yield_now().await;
    if self.fail_list.load(Ordering::SeqCst) {
      return Err(TransportError::Request("connection refused".to_string()));
    }
    Ok(self.tasks())
  }

  async fn create_task(&self, body: &CreateTask) -> Result<Task, TransportError> {
    self.creates.lock().unwrap().push(body.clone());
    tokio::task::yield_now().await;
    if self.failing_values.lock().unwrap().contains(&body.value) {
      return Err(Self::server_error());
    }
    let id = match body.id {
      Some(id) => id,
      None => self.next_id.fetch_add(1, Ordering::SeqCst),
    };
    let task = Task {
      id,
      value: body.value.clone(),
      completed: body.completed,
    };
    self.tasks.lock().unwrap().push(task.clone());
    Ok(task)
  }

  async fn update_task(&self, id: TaskId, body: &UpdateTask) -> Result<Task, TransportError> {
    self.updates.lock().unwrap().push((id, body.clone()));
    tokio::task::yield_now().await;
    if self.fail_update.load(Ordering::SeqCst) {
      return Err(Self::server_error());
    }
    let mut tasks = self.tasks.lock().unwrap();
    let task = tasks
      .iter_mut()
      .find(|t| t.id == id)
      .ok_or_else(|| TransportError::Status {
        status: 404,
        body: "not found".to_string(),
      })?;
    if let Some(value) = &body.value {
      task.value = value.clone();
    }
    if let Some(completed) = body.completed {
      task.completed = completed;
    }
    Ok(task.clone())
  }

  async fn delete_task(&self, id: TaskId) -> Result<(), TransportError> {
    self.deletes.lock().unwrap().push(id);
    tokio::task::yield_now().await;
    if self.fail_delete.load(Ordering::SeqCst) {
      return Err(Self::server_error());
    }
    self.tasks.lock().unwrap().retain(|t| t.id != id);
    Ok(())
  }
}

/// Shorthand for building fixtures.
pub(crate) fn task(id: TaskId, value: &str) -> Task {
  Task {
    id,
    value: value.to_string(),
    completed: false,
  }
}
