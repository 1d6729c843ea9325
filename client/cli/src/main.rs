mod config;
mod sse;

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{env, process::ExitCode};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{load_config, CliConfig};
use crate::sse::{SseDecoder, SseEvent};

#[derive(Deserialize)]
struct StartTaskResponse {
    task_id: String,
}

#[derive(Deserialize)]
struct ProgressUpdate {
    status: String,
    progress: u8,
    message: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, PartialEq)]
enum Command {
    Task(String),
    Chat(String),
}

/// What the follower does after one stream event.
#[derive(Debug, PartialEq)]
enum Step {
    Continue,
    Finished(bool),
}

fn parse_args(args: &[String]) -> Option<Command> {
    match args {
        [flag, rest @ ..] if flag == "--chat" && !rest.is_empty() => {
            Some(Command::Chat(rest.join(" ")))
        }
        [first, ..] if !first.starts_with("--") => Some(Command::Task(args.join(" "))),
        _ => None,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = parse_args(&args) else {
        eprintln!("usage: promptflow-cli <prompt>\n       promptflow-cli --chat <prompt>");
        return ExitCode::from(2);
    };

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(server_url = config.server_url.as_str(), "using server");

    let client = reqwest::Client::new();
    let result = match command {
        Command::Task(prompt) => run_task(&client, &config, &prompt).await,
        Command::Chat(prompt) => run_chat(&client, &config, &prompt).await,
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => format!("{status}: {}", body.message),
        Err(_) => status.to_string(),
    }
}

async fn run_task(client: &reqwest::Client, config: &CliConfig, prompt: &str) -> Result<bool, String> {
    let response = client
        .post(format!("{}/start-task", config.server_url))
        .json(&json!({ "prompt": prompt }))
        .send()
        .await
        .map_err(|err| format!("start task: {err}"))?;
    if !response.status().is_success() {
        return Err(format!("start task: {}", error_message(response).await));
    }
    let started: StartTaskResponse = response
        .json()
        .await
        .map_err(|err| format!("decode start response: {err}"))?;
    println!("task {}", started.task_id);

    let response = client
        .get(format!("{}/progress/{}", config.server_url, started.task_id))
        .send()
        .await
        .map_err(|err| format!("open progress stream: {err}"))?;
    if !response.status().is_success() {
        return Err(format!("open progress stream: {}", error_message(response).await));
    }

    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|err| format!("read progress stream: {err}"))?;
        for event in decoder.push(&bytes) {
            if let Step::Finished(ok) = handle_event(&event) {
                return Ok(ok);
            }
        }
    }
    Err("progress stream closed before the task finished".to_string())
}

fn handle_event(event: &SseEvent) -> Step {
    match event.event.as_str() {
        "update" => {
            match serde_json::from_str::<ProgressUpdate>(&event.data) {
                Ok(update) => println!(
                    "[{:>3}%] {:<10} {}",
                    update.progress, update.status, update.message
                ),
                Err(err) => tracing::warn!(error = %err, "malformed update event"),
            }
            Step::Continue
        }
        "error" => {
            let message = serde_json::from_str::<ErrorBody>(&event.data)
                .map(|body| body.message)
                .unwrap_or_else(|_| event.data.clone());
            eprintln!("error: {message}");
            Step::Finished(false)
        }
        "end" => {
            let status = serde_json::from_str::<Value>(&event.data)
                .ok()
                .and_then(|value| value.get("status").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            println!("finished: {status}");
            Step::Finished(status == "Completed")
        }
        other => {
            tracing::debug!(event = other, "ignoring event");
            Step::Continue
        }
    }
}

async fn run_chat(client: &reqwest::Client, config: &CliConfig, prompt: &str) -> Result<bool, String> {
    let response = client
        .post(format!("{}/simple-chat", config.server_url))
        .json(&json!({ "prompt": prompt }))
        .send()
        .await
        .map_err(|err| format!("chat: {err}"))?;
    if !response.status().is_success() {
        return Err(format!("chat: {}", error_message(response).await));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|err| format!("decode chat response: {err}"))?;
    match &body["response_text"] {
        Value::String(text) => println!("{text}"),
        other => println!("{other:#}"),
    }
    Ok(true)
}
