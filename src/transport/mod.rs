//! Remote access to the task collection.
//!
//! The cache never talks HTTP directly. It goes through [`TaskTransport`], so the
//! reqwest-backed [`HttpTransport`] can be swapped for an in-memory server in tests.

mod http;

#[cfg(test)]
pub(crate) mod fake;

pub use http::HttpTransport;

use async_trait::async_trait;

use crate::task::{CreateTask, Task, TaskId, UpdateTask};

/// Failure of a single remote request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  #[error("request failed: {0}")]
  Request(String),
  #[error("server returned {status}: {body}")]
  Status { status: u16, body: String },
  #[error("invalid response: {0}")]
  Decode(String),
}

/// Operations the cache needs from the backend.
#[async_trait]
pub trait TaskTransport: Send + Sync + 'static {
  /// `GET /tasks`, in server (creation) order.
  async fn list_tasks(&self) -> Result<Vec<Task>, TransportError>;

  /// `POST /tasks`, returns the server-confirmed record.
  async fn create_task(&self, body: &CreateTask) -> Result<Task, TransportError>;

  /// `PATCH /tasks/{id}`.
  async fn update_task(&self, id: TaskId, body: &UpdateTask) -> Result<Task, TransportError>;

  /// `DELETE /tasks/{id}`.
  async fn delete_task(&self, id: TaskId) -> Result<(), TransportError>;
}
