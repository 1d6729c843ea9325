use crate::models::TransitionError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already exists")]
    Duplicate(String),

    #[error("task {id}: {source}")]
    Transition {
        id: String,
        #[source]
        source: TransitionError,
    },

    #[error("corrupt task row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("queue item {0} not found")]
    UnknownItem(i64),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
}

/// Failure to hand a work item to the worker endpoint.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("worker answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl DeliveryError {
    /// The worker refused the item for good (409: task already failed), so
    /// redelivery cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Status { status: 409, .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("input media is not set")]
    MediaNotSet,

    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),

    #[error("access token unavailable: {0}")]
    Auth(String),

    #[error("model request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API answered {status}: {body}")]
    Api { status: u16, body: String },

    #[error("model returned no text: {0}")]
    EmptyResponse(String),

    #[error("structured output is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already failed")]
    AlreadyFailed(String),

    #[error("step {step} failed: {reason}")]
    Step { step: u32, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
