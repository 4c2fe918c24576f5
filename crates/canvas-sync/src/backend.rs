//! Task REST API: entity types, the backend contract and its HTTP client.

use std::future::Future;

use canvas_crdt::TodoProps;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TaskApiError;

pub type TaskId = i64;
pub type ListId = i64;

/// A task as the backend stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntity {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub assigned_to: Option<i64>,
    #[serde(default)]
    pub assignee_username: Option<String>,
    /// ISO date string
    #[serde(default)]
    pub due_date: Option<String>,
    pub list_id: ListId,
    #[serde(default)]
    pub created_at: String,
}

/// Body of a create call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewTask {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

impl NewTask {
    pub fn from_todo(todo: &TodoProps) -> Self {
        Self {
            title: todo.title.clone(),
            description: None,
            assigned_to: todo.assignee_id,
            due_date: todo.due_date.clone(),
        }
    }
}

/// Body of an update call. Absent fields are left alone by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

impl TaskUpdate {
    /// Full current state of a card.
    pub fn from_todo(todo: &TodoProps) -> Self {
        Self {
            title: Some(todo.title.clone()),
            description: None,
            completed: Some(todo.completed),
            assigned_to: todo.assignee_id,
            due_date: todo.due_date.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TodoCreated,
    TodoUpdated,
    TodoDeleted,
}

/// Task fields carried by a push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
    pub id: TaskId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<i64>,
    #[serde(default)]
    pub assignee_username: Option<String>,
    #[serde(default)]
    pub list_id: Option<ListId>,
}

impl From<&TaskEntity> for NotificationData {
    fn from(task: &TaskEntity) -> Self {
        Self {
            id: task.id,
            title: task.title.clone(),
            completed: task.completed,
            due_date: task.due_date.clone(),
            assigned_to: task.assigned_to,
            assignee_username: task.assignee_username.clone(),
            list_id: Some(task.list_id),
        }
    }
}

/// Out-of-band change pushed by the backend, independent of replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNotification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub data: NotificationData,
}

impl TaskNotification {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// The task REST contract the reconciler drives.
pub trait TaskBackend: Send + Sync {
    fn create_task(
        &self,
        list_id: ListId,
        task: &NewTask,
        token: &str,
    ) -> impl Future<Output = Result<TaskEntity, TaskApiError>> + Send;

    fn update_task(
        &self,
        id: TaskId,
        update: &TaskUpdate,
        token: &str,
    ) -> impl Future<Output = Result<TaskEntity, TaskApiError>> + Send;

    fn delete_task(
        &self,
        id: TaskId,
        token: &str,
    ) -> impl Future<Output = Result<(), TaskApiError>> + Send;

    fn list_tasks(
        &self,
        list_id: ListId,
        token: &str,
    ) -> impl Future<Output = Result<Vec<TaskEntity>, TaskApiError>> + Send;

    fn toggle_task(
        &self,
        id: TaskId,
        token: &str,
    ) -> impl Future<Output = Result<TaskEntity, TaskApiError>> + Send;
}

/// [`TaskBackend`] over HTTP with bearer-token auth.
#[derive(Debug, Clone)]
pub struct HttpTaskBackend {
    client: reqwest::Client,
    base: Url,
}

impl HttpTaskBackend {
    pub fn new(base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
        }
    }

    pub fn with_client(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }

    pub fn from_config(config: &canvas_common::SyncConfig) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(&config.api_url)?))
    }

    /// `base` with `segments` appended as path segments.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, TaskApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TaskApiError::network(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, TaskApiError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body: Option<serde_json::Value> = response.json().await.ok();
        let err = TaskApiError::from_body(status.as_u16(), body.as_ref());
        tracing::debug!(status = status.as_u16(), message = %err.message, "task api error");
        Err(err)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TaskApiError> {
        Ok(self.send(request).await?.json().await?)
    }
}

impl TaskBackend for HttpTaskBackend {
    async fn create_task(
        &self,
        list_id: ListId,
        task: &NewTask,
        token: &str,
    ) -> Result<TaskEntity, TaskApiError> {
        let url = self.endpoint(&["lists", &list_id.to_string(), "todos"])?;
        self.send_json(self.client.post(url).bearer_auth(token).json(task))
            .await
    }

    async fn update_task(
        &self,
        id: TaskId,
        update: &TaskUpdate,
        token: &str,
    ) -> Result<TaskEntity, TaskApiError> {
        let url = self.endpoint(&["todos", &id.to_string()])?;
        self.send_json(self.client.put(url).bearer_auth(token).json(update))
            .await
    }

    async fn delete_task(&self, id: TaskId, token: &str) -> Result<(), TaskApiError> {
        let url = self.endpoint(&["todos", &id.to_string()])?;
        // 204, no body
        self.send(self.client.delete(url).bearer_auth(token)).await?;
        Ok(())
    }

    async fn list_tasks(&self, list_id: ListId, token: &str) -> Result<Vec<TaskEntity>, TaskApiError> {
        let url = self.endpoint(&["lists", &list_id.to_string(), "todos"])?;
        self.send_json(self.client.get(url).bearer_auth(token)).await
    }

    async fn toggle_task(&self, id: TaskId, token: &str) -> Result<TaskEntity, TaskApiError> {
        let url = self.endpoint(&["todos", &id.to_string(), "toggle"])?;
        self.send_json(self.client.patch(url).bearer_auth(token)).await
    }
}
