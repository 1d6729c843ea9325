use axum::http::StatusCode;
use uuid::Uuid;

use crate::ai::{Capabilities, MediaInput, ModelCaller, SIMPLE_CHAT_MODEL, VIDEO_CHAT_MODEL};
use crate::error::{AiError, DispatchError, StoreError, WorkerError};
use crate::models::{
    ChatRequest, ChatResponse, ErrorResponse, RunTaskRequest, RunTaskResponse, StartTaskRequest,
    StartTaskResponse, Task, TaskStatus, TaskUpdate, VideoChatRequest,
};
use crate::state::AppState;
use crate::worker::RunOutcome;

const SIMPLE_CHAT_THINKING_BUDGET: u32 = 0;
const VIDEO_CHAT_THINKING_BUDGET: u32 = 1024;

pub struct ServiceError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ServiceError {
    pub fn new(status: StatusCode, code: &'static str, message: String) -> Self {
        Self {
            status,
            body: ErrorResponse { code, message },
        }
    }

    fn bad_request(code: &'static str, message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message.to_string())
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        let (status, code) = match &err {
            StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "task_not_found"),
            StoreError::Duplicate(_) => (StatusCode::CONFLICT, "task_exists"),
            StoreError::Transition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            StoreError::Corrupt(_) | StoreError::Database(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error")
            }
        };
        Self::new(status, code, err.to_string())
    }
}

impl From<DispatchError> for ServiceError {
    fn from(err: DispatchError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "dispatch_failed",
            err.to_string(),
        )
    }
}

impl From<WorkerError> for ServiceError {
    fn from(err: WorkerError) -> Self {
        let (status, code) = match &err {
            WorkerError::NotFound(_) => (StatusCode::NOT_FOUND, "task_not_found"),
            WorkerError::AlreadyFailed(_) => (StatusCode::CONFLICT, "task_failed"),
            WorkerError::Step { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "step_failed"),
            WorkerError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl From<AiError> for ServiceError {
    fn from(err: AiError) -> Self {
        let (status, code) = match &err {
            AiError::MediaNotSet => (StatusCode::BAD_REQUEST, "media_required"),
            AiError::MissingConfig(_) => (StatusCode::SERVICE_UNAVAILABLE, "ai_not_configured"),
            AiError::Auth(_) => (StatusCode::BAD_GATEWAY, "ai_auth_failed"),
            AiError::Http(_)
            | AiError::Api { .. }
            | AiError::EmptyResponse(_)
            | AiError::InvalidJson(_) => (StatusCode::BAD_GATEWAY, "model_error"),
        };
        Self::new(status, code, err.to_string())
    }
}

/// Trimmed, non-empty text field.
fn required(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub async fn start_task(
    state: &AppState,
    payload: StartTaskRequest,
) -> Result<StartTaskResponse, ServiceError> {
    // Validated trimmed, stored as submitted.
    let prompt = payload
        .prompt
        .filter(|prompt| !prompt.trim().is_empty())
        .ok_or_else(|| ServiceError::bad_request("invalid_prompt", "prompt is required"))?;

    let task = Task::queued(Uuid::new_v4().to_string(), prompt);
    state.store.create(&task).await?;
    tracing::info!(task_id = task.id.as_str(), "task created");

    if let Err(err) = state.dispatcher.enqueue(&task.id).await {
        tracing::error!(task_id = task.id.as_str(), error = %err, "enqueue failed");
        // Nothing will ever run this task, so do not leave it looking queued.
        let update = TaskUpdate::status(TaskStatus::Failed)
            .message(format!("dispatch failed: {err}"))
            .finished_now();
        if let Err(store_err) = state.store.update(&task.id, update).await {
            tracing::error!(task_id = task.id.as_str(), error = %store_err, "mark task failed");
        }
        return Err(err.into());
    }

    Ok(StartTaskResponse { task_id: task.id })
}

pub async fn run_task(
    state: &AppState,
    payload: RunTaskRequest,
) -> Result<RunTaskResponse, ServiceError> {
    let task_id = required(payload.task_id)
        .ok_or_else(|| ServiceError::bad_request("invalid_task_id", "task_id is required"))?;

    // Detached so a caller that hangs up (delivery timeout, shutdown) cannot
    // stop the job between steps.
    let worker = state.worker.clone();
    let job = tokio::spawn(async move { worker.run(&task_id).await });
    let outcome = job.await.map_err(|err| {
        tracing::error!(error = %err, "worker task aborted");
        ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "worker_aborted",
            err.to_string(),
        )
    })??;

    match outcome {
        RunOutcome::Completed | RunOutcome::AlreadyCompleted => {
            Ok(RunTaskResponse { status: "success" })
        }
    }
}

pub async fn get_task(state: &AppState, task_id: &str) -> Result<Task, ServiceError> {
    state
        .store
        .get(task_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(task_id.to_string()).into())
}

pub async fn simple_chat(
    state: &AppState,
    payload: ChatRequest,
) -> Result<ChatResponse, ServiceError> {
    let prompt = required(payload.prompt)
        .ok_or_else(|| ServiceError::bad_request("invalid_prompt", "prompt is required"))?;

    let caller = ModelCaller::new(SIMPLE_CHAT_MODEL, SIMPLE_CHAT_THINKING_BUDGET);
    let (response_text, response) = caller.text_to_text(state.ai.as_ref(), &prompt).await?;
    Ok(ChatResponse {
        response_text,
        response,
    })
}

pub async fn video_chat(
    state: &AppState,
    payload: VideoChatRequest,
) -> Result<ChatResponse, ServiceError> {
    let prompt = required(payload.prompt)
        .ok_or_else(|| ServiceError::bad_request("invalid_prompt", "prompt is required"))?;
    let blob_name = required(payload.blob_name)
        .ok_or_else(|| ServiceError::bad_request("invalid_media", "blob_name is required"))?;

    let mut caller = ModelCaller::new(VIDEO_CHAT_MODEL, VIDEO_CHAT_THINKING_BUDGET)
        .with_media(MediaInput {
            blob_name,
            start_offset: required(payload.start_offset),
            end_offset: required(payload.end_offset),
            resolution: required(payload.resolution),
        })
        .with_capabilities(Capabilities {
            web_search: payload.web_search.unwrap_or(false),
        });
    if let Some(schema) = payload.response_schema {
        caller = caller.with_schema(schema);
    }

    let (response_text, response) = caller.video_to_text(state.ai.as_ref(), &prompt).await?;
    Ok(ChatResponse {
        response_text,
        response,
    })
}
