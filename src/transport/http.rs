use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use url::Url;

use super::{TaskTransport, TransportError};
use crate::config::ServerConfig;
use crate::task::{CreateTask, Task, TaskId, UpdateTask};

/// HTTP transport for the tasks REST API
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(config: &ServerConfig) -> Result<Self> {
    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: config.url.clone(),
    })
  }

  fn tasks_url(&self) -> Result<Url, TransportError> {
    self.endpoint("tasks")
  }

  fn task_url(&self, id: TaskId) -> Result<Url, TransportError> {
    self.endpoint(&format!("tasks/{}", id))
  }

  fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
    // Keep any path prefix on the base URL ("http://host/api" -> "http://host/api/tasks")
    let mut base = self.base_url.clone();
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }
    base
      .join(path)
      .map_err(|e| TransportError::Request(format!("invalid URL for {}: {}", path, e)))
  }
}

impl From<reqwest::Error> for TransportError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      TransportError::Decode(e.to_string())
    } else {
      TransportError::Request(e.to_string())
    }
  }
}

/// Turn a non-2xx response into a `TransportError::Status` carrying the body text.
async fn check_status(response: Response) -> Result<Response, TransportError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  Err(TransportError::Status {
    status: status.as_u16(),
    body,
  })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
  let response = check_status(response).await?;
  Ok(response.json::<T>().await?)
}

#[async_trait]
impl TaskTransport for HttpTransport {
  async fn list_tasks(&self) -> Result<Vec<Task>, TransportError> {
    let url = self.tasks_url()?;
    tracing::debug!(%url, "GET tasks");
    let response = self.client.get(url).send().await?;
    decode(response).await
  }

  async fn create_task(&self, body: &CreateTask) -> Result<Task, TransportError> {
    let url = self.tasks_url()?;
    tracing::debug!(%url, value = %body.value, "POST task");
    let response = self.client.post(url).json(body).send().await?;
    decode(response).await
  }

  async fn update_task(&self, id: TaskId, body: &UpdateTask) -> Result<Task, TransportError> {
    let url = self.task_url(id)?;
    tracing::debug!(%url, "PATCH task");
    let response = self.client.patch(url).json(body).send().await?;
    decode(response).await
  }

  async fn delete_task(&self, id: TaskId) -> Result<(), TransportError> {
    let url = self.task_url(id)?;
    tracing::debug!(%url, "DELETE task");
    let response = self.client.delete(url).send().await?;
    check_status(response).await?;
    Ok(())
  }
}
