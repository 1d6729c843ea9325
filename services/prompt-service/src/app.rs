use axum::{
    routing::{get, post},
    Router,
};
use std::path::Path;
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use crate::handlers::{
    get_task, healthz, mock_endpoint, progress, readyz, run_task, simple_chat, start_task,
    video_chat,
};
use crate::state::AppState;

pub fn build_router(state: AppState, static_dir: &Path) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/mock-endpoint", get(mock_endpoint))
        .route("/start-task", post(start_task))
        .route("/run-task", post(run_task))
        .route("/tasks/:task_id", get(get_task))
        .route("/progress/:task_id", get(progress))
        .route("/simple-chat", post(simple_chat))
        .route("/video-chat", post(video_chat))
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .route_service("/video", ServeFile::new(static_dir.join("video_analysis.html")))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, TaskStatus, TaskUpdate};
    use crate::state::TestHarness;
    use crate::store::TaskStore;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn router(harness: &TestHarness) -> Router {
        build_router(harness.state.clone(), Path::new("static"))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).expect("request")
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_str(&body_text(response).await).expect("json body")
    }

    #[tokio::test]
    async fn health_and_mock_endpoints_answer() {
        let harness = TestHarness::new();
        let response = router(&harness).oneshot(get("/healthz")).await.expect("call");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router(&harness)
            .oneshot(get("/mock-endpoint"))
            .await
            .expect("call");
        assert_eq!(
            body_json(response).await,
            json!({ "message": "This is a mock endpoint." })
        );
    }

    #[tokio::test]
    async fn start_task_returns_id_and_rejects_empty_prompt() {
        let harness = TestHarness::new();
        let response = router(&harness)
            .oneshot(post_json("/start-task", json!({ "prompt": "hello" })))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let task_id = body["task_id"].as_str().expect("task id").to_string();

        let response = router(&harness)
            .oneshot(get(&format!("/tasks/{task_id}")))
            .await
            .expect("call");
        let task = body_json(response).await;
        assert_eq!(task["status"], "Queued");
        assert_eq!(task["progress"], 0);

        let response = router(&harness)
            .oneshot(post_json("/start-task", json!({ "prompt": "" })))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "invalid_prompt");
    }

    #[tokio::test]
    async fn unreadable_bodies_get_json_bad_request() {
        let harness = TestHarness::new();
        let plain = Request::post("/start-task")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("hello"))
            .expect("request");
        let malformed = Request::post("/simple-chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"prompt\":"))
            .expect("request");

        for request in [plain, malformed] {
            let response = router(&harness).oneshot(request).await.expect("call");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(response).await["code"], "invalid_body");
        }
        assert_eq!(harness.store.writes(), 0);
    }

    #[tokio::test]
    async fn run_task_status_codes() {
        let harness = TestHarness::new();
        let response = router(&harness)
            .oneshot(post_json("/run-task", json!({ "task_id": "missing" })))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(harness.store.writes(), 0);

        harness
            .store
            .create(&Task::queued("t1".to_string(), "hello".to_string()))
            .await
            .expect("create");
        harness
            .store
            .update("t1", TaskUpdate::status(TaskStatus::Failed).message("boom"))
            .await
            .expect("fail");
        let response = router(&harness)
            .oneshot(post_json("/run-task", json!({ "task_id": "t1" })))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "task_failed");
    }

    #[tokio::test]
    async fn submitted_task_streams_to_completion() {
        let harness = TestHarness::new();
        let response = router(&harness)
            .oneshot(post_json("/start-task", json!({ "prompt": "hello" })))
            .await
            .expect("call");
        let task_id = body_json(response).await["task_id"]
            .as_str()
            .expect("task id")
            .to_string();

        let response = router(&harness)
            .oneshot(post_json("/run-task", json!({ "task_id": task_id })))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "status": "success" }));

        let response = router(&harness)
            .oneshot(get(&format!("/progress/{task_id}")))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::OK);
        let stream = body_text(response).await;
        assert!(stream.contains("event: update"));
        assert!(stream.contains(r#""status":"Completed""#));
        assert!(stream.contains(r#""progress":100"#));
        assert!(stream.contains("event: end"));
    }

    #[tokio::test]
    async fn progress_for_unknown_task_is_single_error() {
        let harness = TestHarness::new();
        let response = router(&harness)
            .oneshot(get("/progress/missing"))
            .await
            .expect("call");
        let stream = body_text(response).await;
        assert_eq!(stream.matches("event: error").count(), 1);
        assert!(stream.contains("Task not found"));
        assert!(!stream.contains("event: update"));
    }

    #[tokio::test]
    async fn simple_chat_requires_prompt() {
        let harness = TestHarness::new();
        let response = router(&harness)
            .oneshot(post_json("/simple-chat", json!({})))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router(&harness)
            .oneshot(post_json("/simple-chat", json!({ "prompt": "hi" })))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["response_text"], "canned answer");
    }

    #[tokio::test]
    async fn index_page_is_served_from_static_dir() {
        let dir: PathBuf =
            std::env::temp_dir().join(format!("promptflow-static-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("static dir");
        std::fs::write(dir.join("index.html"), "<h1>promptflow</h1>").expect("index");

        let harness = TestHarness::new();
        let response = build_router(harness.state.clone(), &dir)
            .oneshot(get("/"))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("promptflow"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
