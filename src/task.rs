//! Task records and the request bodies built from them.

use serde::{Deserialize, Serialize};

/// Identity of a task. Server-confirmed ids are positive.
pub type TaskId = i64;

/// Value used for a new task when the caller leaves `value` out.
pub const DEFAULT_NEW_VALUE: &str = "New Task";

/// Value used for an updated task when the caller leaves `value` out.
pub const DEFAULT_UPDATED_VALUE: &str = "Updated Task";

/// A single task record as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
  pub id: TaskId,
  pub value: String,
  pub completed: bool,
}

/// Partial task supplied by callers of add/update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDraft {
  pub value: Option<String>,
  pub completed: Option<bool>,
}

impl TaskDraft {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn value(mut self, value: impl Into<String>) -> Self {
    self.value = Some(value.into());
    self
  }

  pub fn completed(mut self, completed: bool) -> Self {
    self.completed = Some(completed);
    self
  }

  /// A draft carrying every field of `task`, for updates that should leave
  /// nothing to defaults.
  pub fn from_task(task: &Task) -> Self {
    Self {
      value: Some(task.value.clone()),
      completed: Some(task.completed),
    }
  }
}

/// Body of `POST /tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateTask {
  /// Only sent when the client assigns identities.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<TaskId>,
  pub value: String,
  pub completed: bool,
}

/// Body of `PATCH /tasks/{id}`. Omitted fields are left out of the JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateTask {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub value: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub completed: Option<bool>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_task_json_shape() {
    let task: Task = serde_json::from_str(r#"{"id":3,"value":"milk","completed":true}"#).unwrap();
    assert_eq!(
      task,
      Task {
        id: 3,
        value: "milk".to_string(),
        completed: true
      }
    );
  }

  #[test]
  fn test_create_body_omits_id_for_server_assignment() {
    let body = CreateTask {
      id: None,
      value: "x".to_string(),
      completed: false,
    };
    assert_eq!(
      serde_json::to_value(&body).unwrap(),
      serde_json::json!({"value": "x", "completed": false})
    );
  }

  #[test]
  fn test_update_body_skips_missing_fields() {
    let body = UpdateTask {
      value: None,
      completed: Some(true),
    };
    assert_eq!(
      serde_json::to_value(&body).unwrap(),
      serde_json::json!({"completed": true})
    );
  }
}
