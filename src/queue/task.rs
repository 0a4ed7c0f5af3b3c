//! Queued task model and its status transitions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: String,
    pub queue_name: String,
    pub description: String,
    pub project_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueuedTask {
    pub fn new(
        queue_name: impl Into<String>,
        description: impl Into<String>,
        project_dir: PathBuf,
        priority: i32,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            queue_name: queue_name.into(),
            description: description.into(),
            project_dir,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            priority,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
        }
    }

    pub fn begin(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, result: String) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        self.error = None;
    }

    pub fn fail(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Failed → pending again, same id, one more retry on the books.
    pub fn requeue_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
    }
}
