use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{sse::Event, sse::KeepAlive, sse::Sse, IntoResponse},
    Json,
};
use serde_json::json;
use std::{convert::Infallible, time::Duration};

use crate::models::{ChatRequest, MockResponse, RunTaskRequest, StartTaskRequest, VideoChatRequest};
use crate::progress::{progress_events, ProgressEvent};
use crate::service::{self, ServiceError};
use crate::state::AppState;

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub async fn readyz() -> StatusCode {
    StatusCode::OK
}

pub async fn mock_endpoint() -> Json<MockResponse> {
    Json(MockResponse {
        message: "This is a mock endpoint.",
    })
}

/// Malformed or non-JSON bodies answer with the same 400 shape as a missing field.
fn invalid_body(rejection: JsonRejection) -> ServiceError {
    tracing::info!(error = %rejection, "request body rejected");
    ServiceError::new(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text())
}

pub async fn start_task(
    State(state): State<AppState>,
    payload: Result<Json<StartTaskRequest>, JsonRejection>,
) -> impl IntoResponse {
    let result = match payload {
        Ok(Json(payload)) => service::start_task(&state, payload).await,
        Err(rejection) => Err(invalid_body(rejection)),
    };
    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn run_task(
    State(state): State<AppState>,
    payload: Result<Json<RunTaskRequest>, JsonRejection>,
) -> impl IntoResponse {
    let result = match payload {
        Ok(Json(payload)) => service::run_task(&state, payload).await,
        Err(rejection) => Err(invalid_body(rejection)),
    };
    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match service::get_task(&state, &task_id).await {
        Ok(task) => (StatusCode::OK, Json(task)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    tracing::info!(task_id = task_id.as_str(), "progress stream opened");
    let events = progress_events(
        state.store.clone(),
        task_id,
        state.stream_interval,
        state.shutdown.clone(),
    );

    let stream = async_stream::stream! {
        for await event in events {
            if let Some(event) = sse_event(event) {
                yield Ok(event);
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn sse_event(event: ProgressEvent) -> Option<Event> {
    let encoded = match event {
        ProgressEvent::Update(update) => Event::default().event("update").json_data(update),
        ProgressEvent::NotFound => Event::default()
            .event("error")
            .json_data(json!({ "message": "Task not found" })),
        ProgressEvent::End(status) => Event::default()
            .event("end")
            .json_data(json!({ "status": status })),
    };
    match encoded {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::warn!(error = %err, "encode progress event failed");
            None
        }
    }
}

pub async fn simple_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> impl IntoResponse {
    let result = match payload {
        Ok(Json(payload)) => service::simple_chat(&state, payload).await,
        Err(rejection) => Err(invalid_body(rejection)),
    };
    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn video_chat(
    State(state): State<AppState>,
    payload: Result<Json<VideoChatRequest>, JsonRejection>,
) -> impl IntoResponse {
    let result = match payload {
        Ok(Json(payload)) => service::video_chat(&state, payload).await,
        Err(rejection) => Err(invalid_body(rejection)),
    };
    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}
