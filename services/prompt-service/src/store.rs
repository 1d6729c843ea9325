use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::models::{Task, TaskUpdate};

/// Document store for task state. Each call is atomic for a single task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: &Task) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Apply a partial write and return the stored result.
    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Task, StoreError>;
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    writes: AtomicUsize,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful create/update calls, for asserting side effects.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id.clone()));
        }
        tasks.insert(task.id.clone(), task.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        // Apply to a copy so a rejected write leaves the document untouched.
        let mut next = task.clone();
        next.apply(&update).map_err(|source| StoreError::Transition {
            id: id.to_string(),
            source,
        })?;
        *task = next.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;

    #[tokio::test]
    async fn create_then_read_back() {
        let store = MemoryTaskStore::new();
        let task = Task::queued("t1".to_string(), "hello".to_string());
        store.create(&task).await.expect("create");

        let loaded = store.get("t1").await.expect("get").expect("present");
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert_eq!(loaded.progress, 0);
        assert!(store.get("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = MemoryTaskStore::new();
        let task = Task::queued("t1".to_string(), "hello".to_string());
        store.create(&task).await.expect("create");
        assert!(matches!(
            store.create(&task).await,
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn rejected_update_leaves_document_unchanged() {
        let store = MemoryTaskStore::new();
        store
            .create(&Task::queued("t1".to_string(), "hello".to_string()))
            .await
            .expect("create");
        store
            .update("t1", TaskUpdate::status(TaskStatus::Completed).progress(100))
            .await
            .expect("complete");

        let err = store
            .update(
                "t1",
                TaskUpdate::status(TaskStatus::Processing).message("again"),
            )
            .await
            .expect_err("completed is terminal");
        assert!(matches!(err, StoreError::Transition { .. }));

        let loaded = store.get("t1").await.expect("get").expect("present");
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.message, "Task queued");
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let store = MemoryTaskStore::new();
        let err = store
            .update("nope", TaskUpdate::status(TaskStatus::Processing))
            .await
            .expect_err("missing");
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.writes(), 0);
    }
}
