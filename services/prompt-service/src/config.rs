use promptflow_common::{env_millis, env_opt, env_or};
use std::{path::PathBuf, time::Duration};

use crate::ai::AiConfig;
use crate::dispatch::DispatchConfig;
use crate::worker::WorkerConfig;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub port: u16,
    /// In-memory store and queue when unset.
    pub database_url: Option<String>,
    pub worker_base_url: String,
    pub static_dir: PathBuf,
    pub stream_interval: Duration,
    pub worker: WorkerConfig,
    pub dispatch: DispatchConfig,
    pub ai: AiConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let port = env_or("PORT", 8080u16);
        Self {
            port,
            database_url: env_opt("DATABASE_URL"),
            worker_base_url: env_opt("WORKER_BASE_URL")
                .unwrap_or_else(|| format!("http://127.0.0.1:{port}")),
            static_dir: PathBuf::from(
                env_opt("STATIC_DIR").unwrap_or_else(|| "static".to_string()),
            ),
            stream_interval: env_millis("STREAM_INTERVAL_MS", 1000),
            worker: WorkerConfig::from_env(),
            dispatch: DispatchConfig::from_env(),
            ai: AiConfig::from_env(),
        }
    }
}
