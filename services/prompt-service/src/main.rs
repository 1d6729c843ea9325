mod ai;
mod app;
mod config;
mod db;
mod dispatch;
mod error;
mod handlers;
mod models;
mod progress;
mod service;
mod state;
mod store;
mod worker;

use promptflow_common::{bind_listener, init_tracing, shutdown_signal, Shutdown};
use std::sync::Arc;

use crate::ai::VertexClient;
use crate::config::ServiceConfig;
use crate::dispatch::{
    run_delivery_loop, DispatchQueue, Dispatcher, HttpWorkerClient, MemoryDispatchQueue,
    WorkerClient,
};
use crate::state::AppState;
use crate::store::{MemoryTaskStore, TaskStore};
use crate::worker::Worker;

#[tokio::main]
async fn main() {
    let _guards = init_tracing("prompt-service");
    let config = ServiceConfig::from_env();

    let (store, queue): (Arc<dyn TaskStore>, Arc<dyn DispatchQueue>) =
        match config.database_url.as_deref() {
            Some(database_url) => {
                let client = db::connect(database_url).await.expect("connect db");
                db::ensure_schema(&*client.lock().await)
                    .await
                    .expect("create schema");
                tracing::info!("using postgres task store");
                (
                    Arc::new(db::PgTaskStore::new(client.clone())),
                    Arc::new(db::PgDispatchQueue::new(client)),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set, tasks are kept in memory");
                (
                    Arc::new(MemoryTaskStore::new()),
                    Arc::new(MemoryDispatchQueue::new()),
                )
            }
        };

    let worker_client: Arc<dyn WorkerClient> = Arc::new(
        HttpWorkerClient::new(config.dispatch.request_timeout).expect("worker http client"),
    );
    let ai = VertexClient::new(config.ai.clone()).expect("vertex client");
    if config.ai.project_id.is_none() {
        tracing::warn!("GCP_PROJECT_ID not set, chat endpoints will answer 503");
    }

    let shutdown = Shutdown::new();
    let delivery = tokio::spawn(run_delivery_loop(
        queue.clone(),
        worker_client,
        config.dispatch.clone(),
        shutdown.clone(),
    ));

    let state = AppState {
        store: store.clone(),
        dispatcher: Dispatcher::new(queue, &config.worker_base_url),
        worker: Worker::from_config(store, &config.worker),
        ai: Arc::new(ai),
        stream_interval: config.stream_interval,
        shutdown: shutdown.clone(),
    };

    let app = app::build_router(state, &config.static_dir);
    let listener = bind_listener(config.port).await.expect("bind listener");

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open progress streams and the delivery loop watch this flag.
            stop.trigger();
        })
        .await
        .expect("serve");

    if let Err(err) = delivery.await {
        tracing::error!(error = %err, "delivery loop panicked");
    }
}
