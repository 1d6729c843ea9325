use promptflow_common::Shutdown;
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_stream::Stream;

use crate::models::{ProgressUpdate, TaskStatus};
use crate::store::TaskStore;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Update(ProgressUpdate),
    NotFound,
    End(TaskStatus),
}

/// Poll a task and yield an update whenever its message changes, ending after
/// a terminal status or a missing task. Dropping the stream stops the polling.
pub fn progress_events(
    store: Arc<dyn TaskStore>,
    task_id: String,
    interval: Duration,
    shutdown: Shutdown,
) -> impl Stream<Item = ProgressEvent> {
    async_stream::stream! {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_message: Option<String> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = shutdown.wait() => {
                    tracing::debug!(task_id = task_id.as_str(), "progress stream closed by shutdown");
                    break;
                }
            }

            let task = match store.get(&task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tracing::info!(task_id = task_id.as_str(), "progress requested for unknown task");
                    yield ProgressEvent::NotFound;
                    break;
                }
                Err(err) => {
                    tracing::warn!(task_id = task_id.as_str(), error = %err, "progress poll failed");
                    continue;
                }
            };

            if last_message.as_deref() != Some(task.message.as_str()) {
                last_message = Some(task.message.clone());
                yield ProgressEvent::Update(ProgressUpdate::from(&task));
            }

            if task.status.is_terminal() {
                yield ProgressEvent::End(task.status);
                break;
            }
        }
    }
}
