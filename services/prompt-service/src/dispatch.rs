use async_trait::async_trait;
use promptflow_common::{clip, env_millis, env_or, Shutdown};
use rand::Rng;
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::Mutex, task::JoinSet};

use crate::error::{DeliveryError, DispatchError};

/// A claimed queue entry, owned by the delivery loop until acked or rescheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: i64,
    pub task_id: String,
    pub target_url: String,
    pub attempts: u32,
}

/// Durable at-least-once queue of worker invocations.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn push(&self, task_id: &str, target_url: &str) -> Result<i64, DispatchError>;

    /// Lease up to `limit` due items; unacked items become due again when the lease ends.
    async fn claim(&self, limit: usize, lease: Duration) -> Result<Vec<WorkItem>, DispatchError>;

    async fn ack(&self, item_id: i64) -> Result<(), DispatchError>;

    async fn retry(
        &self,
        item_id: i64,
        attempts: u32,
        delay: Duration,
        error: &str,
    ) -> Result<(), DispatchError>;

    async fn dead_letter(&self, item_id: i64, attempts: u32, error: &str)
        -> Result<(), DispatchError>;
}

/// Delivers one work item to the worker endpoint.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn deliver(&self, item: &WorkItem) -> Result<(), DeliveryError>;
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub poll_interval: Duration,
    pub lease: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: env_millis("DISPATCH_POLL_INTERVAL_MS", 500),
            lease: Duration::from_secs(env_or("DISPATCH_LEASE_SECS", 900u64)),
            batch_size: env_or("DISPATCH_BATCH_SIZE", 16usize),
            max_attempts: env_or("DISPATCH_MAX_ATTEMPTS", 5u32).max(1),
            backoff_base: env_millis("DISPATCH_BACKOFF_BASE_MS", 1000),
            backoff_max: env_millis("DISPATCH_BACKOFF_MAX_MS", 60_000),
            request_timeout: Duration::from_secs(env_or("DISPATCH_REQUEST_TIMEOUT_SECS", 600u64)),
        }
    }

    /// Delay before the next attempt after `attempts` failures, without jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Enqueues worker invocations for new tasks.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn DispatchQueue>,
    target_url: String,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn DispatchQueue>, worker_base_url: &str) -> Self {
        Self {
            queue,
            target_url: format!("{}/run-task", worker_base_url.trim_end_matches('/')),
        }
    }

    pub async fn enqueue(&self, task_id: &str) -> Result<(), DispatchError> {
        let item_id = self.queue.push(task_id, &self.target_url).await?;
        tracing::info!(task_id, item_id, target = self.target_url.as_str(), "work item enqueued");
        Ok(())
    }
}

struct QueuedItem {
    item: WorkItem,
    available_at: Instant,
    dead: bool,
    last_error: Option<String>,
}

#[derive(Default)]
struct MemoryQueueInner {
    next_id: i64,
    items: Vec<QueuedItem>,
}

const MAX_DEAD_LETTERS: usize = 256;

/// Process-local queue used when no database is configured. Items survive
/// delivery failures but not a restart. Only the newest dead letters are kept.
pub struct MemoryDispatchQueue {
    inner: Mutex<MemoryQueueInner>,
    max_dead_letters: usize,
}

impl Default for MemoryDispatchQueue {
    fn default() -> Self {
        Self::with_dead_letter_limit(MAX_DEAD_LETTERS)
    }
}

impl MemoryDispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dead_letter_limit(max_dead_letters: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryQueueInner::default()),
            max_dead_letters,
        }
    }

    /// Task ids still waiting for a successful delivery, dead letters included.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn pending_task_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .items
            .iter()
            .map(|entry| entry.item.task_id.clone())
            .collect()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn dead_letters(&self) -> Vec<(WorkItem, Option<String>)> {
        let inner = self.inner.lock().await;
        inner
            .items
            .iter()
            .filter(|entry| entry.dead)
            .map(|entry| (entry.item.clone(), entry.last_error.clone()))
            .collect()
    }
}

#[async_trait]
impl DispatchQueue for MemoryDispatchQueue {
    async fn push(&self, task_id: &str, target_url: &str) -> Result<i64, DispatchError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.items.push(QueuedItem {
            item: WorkItem {
                id,
                task_id: task_id.to_string(),
                target_url: target_url.to_string(),
                attempts: 0,
            },
            available_at: Instant::now(),
            dead: false,
            last_error: None,
        });
        Ok(id)
    }

    async fn claim(&self, limit: usize, lease: Duration) -> Result<Vec<WorkItem>, DispatchError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut claimed = Vec::new();
        for entry in inner.items.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if entry.dead || entry.available_at > now {
                continue;
            }
            entry.available_at = now + lease;
            claimed.push(entry.item.clone());
        }
        Ok(claimed)
    }

    async fn ack(&self, item_id: i64) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock().await;
        let before = inner.items.len();
        inner.items.retain(|entry| entry.item.id != item_id);
        if inner.items.len() == before {
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
        let mut inner = self.inner.lock().await;
        let entry = inner
            .items
            .iter_mut()
            .find(|entry| entry.item.id == item_id)
            .ok_or(DispatchError::UnknownItem(item_id))?;
        entry.item.attempts = attempts;
        entry.available_at = Instant::now() + delay;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn dead_letter(
        &self,
        item_id: i64,
        attempts: u32,
        error: &str,
    ) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .items
            .iter_mut()
            .find(|entry| entry.item.id == item_id)
            .ok_or(DispatchError::UnknownItem(item_id))?;
        entry.item.attempts = attempts;
        entry.dead = true;
        entry.last_error = Some(error.to_string());

        let dead = inner.items.iter().filter(|entry| entry.dead).count();
        if dead > self.max_dead_letters {
            // Items keep insertion order, so the first dead entry is the oldest.
            if let Some(oldest) = inner.items.iter().position(|entry| entry.dead) {
                let dropped = inner.items.remove(oldest);
                tracing::warn!(
                    task_id = dropped.item.task_id.as_str(),
                    error = dropped.last_error.as_deref().unwrap_or(""),
                    "dead letter dropped, limit reached"
                );
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct RunTaskBody<'a> {
    task_id: &'a str,
}

pub struct HttpWorkerClient {
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn deliver(&self, item: &WorkItem) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(item.target_url.as_str())
            .json(&RunTaskBody {
                task_id: item.task_id.as_str(),
            })
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body: clip(&body, 512).to_string(),
        })
    }
}

/// Claim due items and spawn one delivery per item into `inflight`.
pub async fn poll_once(
    queue: &Arc<dyn DispatchQueue>,
    client: &Arc<dyn WorkerClient>,
    config: &DispatchConfig,
    inflight: &mut JoinSet<()>,
) -> Result<usize, DispatchError> {
    let items = queue.claim(config.batch_size, config.lease).await?;
    let claimed = items.len();
    for item in items {
        let queue = queue.clone();
        let client = client.clone();
        let config = config.clone();
        inflight.spawn(async move { deliver_one(queue, client, config, item).await });
    }
    Ok(claimed)
}

async fn deliver_one(
    queue: Arc<dyn DispatchQueue>,
    client: Arc<dyn WorkerClient>,
    config: DispatchConfig,
    item: WorkItem,
) {
    let attempt = item.attempts + 1;
    let outcome = match client.deliver(&item).await {
        Ok(()) => {
            tracing::info!(task_id = item.task_id.as_str(), attempt, "work item delivered");
            queue.ack(item.id).await
        }
        Err(err) if err.is_permanent() => {
            tracing::warn!(
                task_id = item.task_id.as_str(),
                attempt,
                error = %err,
                "worker refused work item, not retrying"
            );
            queue.dead_letter(item.id, attempt, &err.to_string()).await
        }
        Err(err) if attempt >= config.max_attempts => {
            tracing::error!(
                task_id = item.task_id.as_str(),
                attempt,
                error = %err,
                "work item exhausted its attempts"
            );
            queue.dead_letter(item.id, attempt, &err.to_string()).await
        }
        Err(err) => {
            let delay = with_jitter(config.backoff(attempt));
            tracing::warn!(
                task_id = item.task_id.as_str(),
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "work item delivery failed"
            );
            queue.retry(item.id, attempt, delay, &err.to_string()).await
        }
    };
    if let Err(err) = outcome {
        // The lease will expire and the item is delivered again.
        tracing::error!(item_id = item.id, error = %err, "settle work item failed");
    }
}

pub async fn run_delivery_loop(
    queue: Arc<dyn DispatchQueue>,
    client: Arc<dyn WorkerClient>,
    config: DispatchConfig,
    shutdown: Shutdown,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut inflight = JoinSet::new();

    tracing::info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        max_attempts = config.max_attempts,
        "delivery loop started"
    );
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {},
        }

        while inflight.try_join_next().is_some() {}

        if let Err(err) = poll_once(&queue, &client, &config, &mut inflight).await {
            tracing::error!(error = %err, "claim work items failed");
        }
    }

    // Abandoned deliveries are retried once their lease runs out.
    inflight.shutdown().await;
    tracing::info!("delivery loop stopped");
}
