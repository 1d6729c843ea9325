use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ai::ModelOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::Processing => "Processing",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Statuses only move forward; staying put is allowed so message/progress
    /// writes can carry the current status.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        self.rank() <= next.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(TaskStatus::Queued),
            "Processing" => Ok(TaskStatus::Processing),
            "Completed" => Ok(TaskStatus::Completed),
            "Failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn queued(id: String, prompt: String) -> Self {
        Self {
            id,
            prompt,
            status: TaskStatus::Queued,
            progress: 0,
            message: "Task queued".to_string(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Apply a partial write, rejecting backwards status moves and progress
    /// regressions while processing.
    pub fn apply(&mut self, update: &TaskUpdate) -> Result<(), TransitionError> {
        let next_status = update.status.unwrap_or(self.status);
        if !self.status.can_advance_to(next_status) {
            return Err(TransitionError::Status {
                from: self.status,
                to: next_status,
            });
        }
        if let Some(progress) = update.progress {
            if progress > 100 {
                return Err(TransitionError::OutOfRange(progress));
            }
            if self.status == TaskStatus::Processing
                && next_status == TaskStatus::Processing
                && progress < self.progress
            {
                return Err(TransitionError::Progress {
                    from: self.progress,
                    to: progress,
                });
            }
        }

        self.status = next_status;
        if let Some(progress) = update.progress {
            self.progress = progress;
        }
        if let Some(message) = &update.message {
            self.message = message.clone();
        }
        if update.finished_at.is_some() {
            self.finished_at = update.finished_at;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("status cannot move from {from} to {to}")]
    Status { from: TaskStatus, to: TaskStatus },
    #[error("progress cannot go back from {from} to {to}")]
    Progress { from: u8, to: u8 },
    #[error("progress {0} is out of range")]
    OutOfRange(u8),
}

/// Partial task write. Unset fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn finished_now(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }
}

#[derive(Deserialize)]
pub struct StartTaskRequest {
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartTaskResponse {
    pub task_id: String,
}

#[derive(Deserialize)]
pub struct RunTaskRequest {
    pub task_id: Option<String>,
}

#[derive(Serialize)]
pub struct RunTaskResponse {
    pub status: &'static str,
}

#[derive(Deserialize)]
pub struct ChatRequest {
    pub prompt: Option<String>,
}

#[derive(Deserialize)]
pub struct VideoChatRequest {
    pub prompt: Option<String>,
    pub blob_name: Option<String>,
    pub start_offset: Option<String>,
    pub end_offset: Option<String>,
    pub resolution: Option<String>,
    pub web_search: Option<bool>,
    pub response_schema: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub response_text: ModelOutput,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
}

impl From<&Task> for ProgressUpdate {
    fn from(task: &Task) -> Self {
        Self {
            status: task.status,
            progress: task.progress,
            message: task.message.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct MockResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_as_pascal_case() {
        let value = serde_json::to_value(TaskStatus::Completed).expect("serialize");
        assert_eq!(value, serde_json::json!("Completed"));
        assert_eq!("Processing".parse::<TaskStatus>(), Ok(TaskStatus::Processing));
    }

    #[test]
    fn rejects_backwards_status() {
        let mut task = Task::queued("t1".to_string(), "hello".to_string());
        task.apply(&TaskUpdate::status(TaskStatus::Processing))
            .expect("queued to processing");
        let err = task
            .apply(&TaskUpdate::status(TaskStatus::Queued))
            .expect_err("processing to queued");
        assert!(matches!(err, TransitionError::Status { .. }));
    }

    #[test]
    fn terminal_status_is_final() {
        let mut task = Task::queued("t1".to_string(), "hello".to_string());
        task.apply(&TaskUpdate::status(TaskStatus::Failed).message("boom"))
            .expect("queued to failed");
        assert!(task
            .apply(&TaskUpdate::status(TaskStatus::Processing))
            .is_err());
        assert!(task
            .apply(&TaskUpdate::status(TaskStatus::Completed))
            .is_err());
        assert_eq!(task.message, "boom");
    }

    #[test]
    fn progress_cannot_regress_while_processing() {
        let mut task = Task::queued("t1".to_string(), "hello".to_string());
        task.apply(&TaskUpdate::status(TaskStatus::Processing).progress(40))
            .expect("advance");
        let err = task
            .apply(&TaskUpdate::status(TaskStatus::Processing).progress(20))
            .expect_err("regress");
        assert_eq!(err, TransitionError::Progress { from: 40, to: 20 });
        assert_eq!(task.progress, 40);
    }
}
