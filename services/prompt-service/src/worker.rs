use async_trait::async_trait;
use promptflow_common::{env_millis, env_or};
use std::{sync::Arc, time::Duration};

use crate::error::{StoreError, WorkerError};
use crate::models::{Task, TaskStatus, TaskUpdate};
use crate::store::TaskStore;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub total_steps: u32,
    pub step_delay: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            total_steps: env_or("WORKER_TOTAL_STEPS", 5u32).max(1),
            step_delay: env_millis("WORKER_STEP_DELAY_MS", 1000),
        }
    }
}

/// One unit of the long-running job.
#[async_trait]
pub trait JobStep: Send + Sync {
    async fn run(&self, task: &Task, step: u32, total: u32) -> Result<(), String>;
}

/// Stands in for real work by suspending the task between steps.
pub struct SimulatedStep {
    delay: Duration,
}

impl SimulatedStep {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl JobStep for SimulatedStep {
    async fn run(&self, task: &Task, step: u32, total: u32) -> Result<(), String> {
        tracing::debug!(task_id = task.id.as_str(), step, total, "step running");
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub enum RunOutcome {
    Completed,
    AlreadyCompleted,
}

pub fn step_progress(step: u32, total: u32) -> u8 {
    let percent = (u64::from(step) * 100 + u64::from(total) / 2) / u64::from(total.max(1));
    percent.min(100) as u8
}

/// Steps already reflected in a recorded progress value.
fn completed_steps(progress: u8, total: u32) -> u32 {
    (0..=total)
        .take_while(|step| step_progress(*step, total) <= progress)
        .last()
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn TaskStore>,
    step: Arc<dyn JobStep>,
    total_steps: u32,
}

impl Worker {
    pub fn new(store: Arc<dyn TaskStore>, step: Arc<dyn JobStep>, total_steps: u32) -> Self {
        Self {
            store,
            step,
            total_steps: total_steps.max(1),
        }
    }

    pub fn from_config(store: Arc<dyn TaskStore>, config: &WorkerConfig) -> Self {
        Self::new(
            store,
            Arc::new(SimulatedStep::new(config.step_delay)),
            config.total_steps,
        )
    }

    /// Drive a task to a terminal state. Redelivery of a task left in
    /// `Processing` resumes after the last recorded step.
    pub async fn run(&self, task_id: &str) -> Result<RunOutcome, WorkerError> {
        let Some(task) = self.store.get(task_id).await? else {
            tracing::warn!(task_id, "run requested for unknown task");
            return Err(WorkerError::NotFound(task_id.to_string()));
        };

        match task.status {
            TaskStatus::Completed => {
                tracing::info!(task_id, "task already completed, acknowledging redelivery");
                return Ok(RunOutcome::AlreadyCompleted);
            }
            TaskStatus::Failed => return Err(WorkerError::AlreadyFailed(task_id.to_string())),
            TaskStatus::Queued | TaskStatus::Processing => {}
        }

        match self.drive(task).await {
            Ok(()) => Ok(RunOutcome::Completed),
            Err(err) => {
                self.mark_failed(task_id, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(&self, mut task: Task) -> Result<(), WorkerError> {
        let total = self.total_steps;
        let first_step = if task.status == TaskStatus::Processing {
            let done = completed_steps(task.progress, total);
            tracing::info!(task_id = task.id.as_str(), resume_after = done, "resuming task");
            done + 1
        } else {
            task = self
                .store
                .update(
                    &task.id,
                    TaskUpdate::status(TaskStatus::Processing).message("Processing started"),
                )
                .await?;
            tracing::info!(task_id = task.id.as_str(), total, "task processing");
            1
        };

        for step in first_step..=total {
            self.step
                .run(&task, step, total)
                .await
                .map_err(|reason| WorkerError::Step { step, reason })?;
            task = self
                .store
                .update(
                    &task.id,
                    TaskUpdate::status(TaskStatus::Processing)
                        .progress(step_progress(step, total))
                        .message(format!("Step {step}/{total} completed")),
                )
                .await?;
            tracing::info!(task_id = task.id.as_str(), step, progress = task.progress, "step completed");
        }

        self.store
            .update(
                &task.id,
                TaskUpdate::status(TaskStatus::Completed)
                    .progress(100)
                    .message("Task completed")
                    .finished_now(),
            )
            .await?;
        tracing::info!(task_id = task.id.as_str(), "task completed");
        Ok(())
    }

    async fn mark_failed(&self, task_id: &str, err: &WorkerError) {
        tracing::error!(task_id, error = %err, "task failed");
        let update = TaskUpdate::status(TaskStatus::Failed)
            .message(err.to_string())
            .finished_now();
        match self.store.update(task_id, update).await {
            Ok(_) => {}
            Err(StoreError::Transition { source, .. }) => {
                tracing::warn!(task_id, error = %source, "task not marked failed");
            }
            Err(store_err) => {
                tracing::error!(task_id, error = %store_err, "mark task failed");
            }
        }
    }
}
