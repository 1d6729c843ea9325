use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio_postgres::{Client, GenericClient, NoTls, Row};

use crate::dispatch::{DispatchQueue, WorkItem};
use crate::error::{DispatchError, StoreError};
use crate::models::{Task, TaskStatus, TaskUpdate};
use crate::store::TaskStore;

const SQL_CREATE_TASKS: &str = "CREATE TABLE IF NOT EXISTS tasks (\
    id TEXT PRIMARY KEY, \
    prompt TEXT NOT NULL, \
    status TEXT NOT NULL, \
    progress SMALLINT NOT NULL DEFAULT 0, \
    message TEXT NOT NULL, \
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
    finished_at TIMESTAMPTZ)";
const SQL_CREATE_DISPATCH: &str = "CREATE TABLE IF NOT EXISTS task_dispatch (\
    id BIGSERIAL PRIMARY KEY, \
    task_id TEXT NOT NULL, \
    target_url TEXT NOT NULL, \
    attempts INTEGER NOT NULL DEFAULT 0, \
    available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
    last_error TEXT, \
    dead BOOLEAN NOT NULL DEFAULT FALSE, \
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())";
const SQL_CREATE_DISPATCH_INDEX: &str = "CREATE INDEX IF NOT EXISTS task_dispatch_due_idx \
    ON task_dispatch (available_at) WHERE NOT dead";

const SQL_INSERT_TASK: &str = "INSERT INTO tasks \
    (id, prompt, status, progress, message, created_at, finished_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (id) DO NOTHING";
const SQL_SELECT_TASK: &str = "SELECT id, prompt, status, progress, message, created_at, finished_at \
    FROM tasks WHERE id = $1";
const SQL_SELECT_TASK_FOR_UPDATE: &str = "SELECT id, prompt, status, progress, message, created_at, finished_at \
    FROM tasks WHERE id = $1 FOR UPDATE";
const SQL_UPDATE_TASK: &str = "UPDATE tasks \
    SET status = $2, progress = $3, message = $4, finished_at = $5 WHERE id = $1";

const SQL_INSERT_DISPATCH: &str =
    "INSERT INTO task_dispatch (task_id, target_url) VALUES ($1, $2) RETURNING id";
// Claiming pushes available_at past the lease so concurrent pollers skip the row.
const SQL_CLAIM_DISPATCH: &str = "UPDATE task_dispatch \
    SET available_at = NOW() + make_interval(secs => $2) \
    WHERE id IN (\
        SELECT id FROM task_dispatch \
        WHERE NOT dead AND available_at <= NOW() \
        ORDER BY available_at, id LIMIT $1 \
        FOR UPDATE SKIP LOCKED) \
    RETURNING id, task_id, target_url, attempts";
const SQL_ACK_DISPATCH: &str = "DELETE FROM task_dispatch WHERE id = $1";
const SQL_RETRY_DISPATCH: &str = "UPDATE task_dispatch \
    SET attempts = $2, available_at = NOW() + make_interval(secs => $3), last_error = $4 \
    WHERE id = $1";
const SQL_DEAD_DISPATCH: &str = "UPDATE task_dispatch \
    SET attempts = $2, dead = TRUE, last_error = $3 WHERE id = $1";

pub type SharedClient = Arc<Mutex<Client>>;

pub async fn connect(database_url: &str) -> Result<SharedClient, tokio_postgres::Error> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
    tokio::spawn(async move {
        // Drive the connection in the background.
        if let Err(err) = connection.await {
            tracing::error!(error = %err, "database connection error");
        }
    });
    Ok(Arc::new(Mutex::new(client)))
}

pub async fn ensure_schema(db: &impl GenericClient) -> Result<(), tokio_postgres::Error> {
    for sql in [SQL_CREATE_TASKS, SQL_CREATE_DISPATCH, SQL_CREATE_DISPATCH_INDEX] {
        db.execute(sql, &[]).await?;
    }
    Ok(())
}

fn decode_status(value: &str) -> Result<TaskStatus, StoreError> {
    value.parse::<TaskStatus>().map_err(StoreError::Corrupt)
}

fn decode_progress(value: i16) -> Result<u8, StoreError> {
    u8::try_from(value)
        .ok()
        .filter(|progress| *progress <= 100)
        .ok_or_else(|| StoreError::Corrupt(format!("progress {value}")))
}

fn task_from_row(row: &Row) -> Result<Task, StoreError> {
    Ok(Task {
        id: row.get("id"),
        prompt: row.get("prompt"),
        status: decode_status(row.get("status"))?,
        progress: decode_progress(row.get("progress"))?,
        message: row.get("message"),
        created_at: row.get("created_at"),
        finished_at: row.get("finished_at"),
    })
}

/// Stored attempts are never negative; clamp rather than wrap if one is.
fn decode_attempts(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn work_item_from_row(row: &Row) -> WorkItem {
    WorkItem {
        id: row.get("id"),
        task_id: row.get("task_id"),
        target_url: row.get("target_url"),
        attempts: decode_attempts(row.get("attempts")),
    }
}

pub struct PgTaskStore {
    db: SharedClient,
}

impl PgTaskStore {
    pub fn new(db: SharedClient) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let inserted = db
            .execute(
                SQL_INSERT_TASK,
                &[
                    &task.id,
                    &task.prompt,
                    &task.status.as_str(),
                    &i16::from(task.progress),
                    &task.message,
                    &task.created_at,
                    &task.finished_at,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(task.id.clone()));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let db = self.db.lock().await;
        let row = db.query_opt(SQL_SELECT_TASK, &[&id]).await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Task, StoreError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction().await?;
        let row = tx
            .query_opt(SQL_SELECT_TASK_FOR_UPDATE, &[&id])
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut task = task_from_row(&row)?;
        task.apply(&update).map_err(|source| StoreError::Transition {
            id: id.to_string(),
            source,
        })?;
        tx.execute(
            SQL_UPDATE_TASK,
            &[
                &task.id,
                &task.status.as_str(),
                &i16::from(task.progress),
                &task.message,
                &task.finished_at,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(task)
    }
}

pub struct PgDispatchQueue {
    db: SharedClient,
}

impl PgDispatchQueue {
    pub fn new(db: SharedClient) -> Self {
        Self { db }
    }
}

fn attempts_param(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl DispatchQueue for PgDispatchQueue {
    async fn push(&self, task_id: &str, target_url: &str) -> Result<i64, DispatchError> {
        let db = self.db.lock().await;
        let row = db
            .query_one(SQL_INSERT_DISPATCH, &[&task_id, &target_url])
            .await?;
        Ok(row.get("id"))
    }

    async fn claim(&self, limit: usize, lease: Duration) -> Result<Vec<WorkItem>, DispatchError> {
        let limit = limit_param(limit);
        let lease_secs = lease.as_secs_f64();
        let db = self.db.lock().await;
        let rows = db
            .query(SQL_CLAIM_DISPATCH, &[&limit, &lease_secs])
            .await?;
        Ok(rows.iter().map(work_item_from_row).collect())
    }

    async fn ack(&self, item_id: i64) -> Result<(), DispatchError> {
        let db = self.db.lock().await;
        if db.execute(SQL_ACK_DISPATCH, &[&item_id]).await? == 0 {
            return Err(DispatchError::UnknownItem(item_id));
        }
        Ok(())
    }

    async fn retry(
        &self,
        item_id: i64,
        attempts: u32,
        delay: Duration,
        error: &str,
    ) -> Result<(), DispatchError> {
        let delay_secs = delay.as_secs_f64();
        let db = self.db.lock().await;
        let updated = db
            .execute(
                SQL_RETRY_DISPATCH,
                &[&item_id, &attempts_param(attempts), &delay_secs, &error],
            )
            .await?;
        if updated == 0 {
            return Err(DispatchError::UnknownItem(item_id));
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        item_id: i64,
        attempts: u32,
        error: &str,
    ) -> Result<(), DispatchError> {
        let db = self.db.lock().await;
        let updated = db
            .execute(
                SQL_DEAD_DISPATCH,
                &[&item_id, &attempts_param(attempts), &error],
            )
            .await?;
        if updated == 0 {
            return Err(DispatchError::UnknownItem(item_id));
        }
        Ok(())
    }
}
