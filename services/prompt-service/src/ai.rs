use async_trait::async_trait;
use promptflow_common::{clip, env_opt, env_or};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    path::Path,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

use crate::error::AiError;

pub const SIMPLE_CHAT_MODEL: &str = "gemini-2.5-flash-lite";
pub const VIDEO_CHAT_MODEL: &str = "gemini-2.5-flash";

const MAX_OUTPUT_TOKENS: u32 = 65535;
const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_HARASSMENT",
];
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Clone, Debug)]
pub struct AiConfig {
    pub project_id: Option<String>,
    pub location: String,
    pub bucket: Option<String>,
    pub access_token: Option<String>,
    pub request_timeout: Duration,
}

impl AiConfig {
    pub fn from_env() -> Self {
        Self {
            project_id: env_opt("GCP_PROJECT_ID"),
            location: env_opt("LOCATION").unwrap_or_else(|| "us-central1".to_string()),
            bucket: env_opt("GCS_BUCKET_NAME"),
            access_token: env_opt("GOOGLE_ACCESS_TOKEN"),
            request_timeout: Duration::from_secs(env_or("AI_REQUEST_TIMEOUT_SECS", 300u64)),
        }
    }
}

// ---- request shape -------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
    pub safety_settings: Vec<SafetySetting>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub role: &'static str,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_metadata: Option<VideoMetadata>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub file_uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub start_offset: String,
    pub end_offset: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub seed: i32,
    pub max_output_tokens: u32,
    pub response_modalities: Vec<&'static str>,
    pub thinking_config: ThinkingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_resolution: Option<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub thinking_budget: u32,
}

#[derive(Debug, Serialize)]
pub struct SafetySetting {
    pub category: &'static str,
    pub threshold: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub google_search: GoogleSearch,
}

#[derive(Debug, Serialize)]
pub struct GoogleSearch {}

// ---- caller configuration ------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    pub web_search: bool,
}

/// Remote video reference, bound to the configured bucket at call time.
#[derive(Clone, Debug)]
pub struct MediaInput {
    pub blob_name: String,
    pub start_offset: Option<String>,
    pub end_offset: Option<String>,
    pub resolution: Option<String>,
}

impl MediaInput {
    fn to_part(&self, bucket: &str) -> Part {
        let extension = Path::new(&self.blob_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("mp4")
            .to_ascii_lowercase();
        let video_metadata = match (&self.start_offset, &self.end_offset) {
            (Some(start), Some(end)) if !start.is_empty() && !end.is_empty() => {
                Some(VideoMetadata {
                    start_offset: start.clone(),
                    end_offset: end.clone(),
                })
            }
            _ => None,
        };
        Part {
            file_data: Some(FileData {
                file_uri: format!("gs://{bucket}/{}", self.blob_name),
                mime_type: format!("video/{extension}"),
            }),
            video_metadata,
            ..Part::default()
        }
    }

    fn wants_low_resolution(&self) -> bool {
        self.resolution
            .as_deref()
            .is_some_and(|value| !value.is_empty())
    }
}

/// Text or schema-conformant JSON, depending on whether a schema was set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ModelOutput {
    Text(String),
    Structured(Value),
}

/// Transport for `generateContent`; returns the raw response document.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<Value, AiError>;

    fn media_bucket(&self) -> Option<&str>;
}

/// One model invocation profile. Safety filtering is always off and decoding
/// is deterministic.
#[derive(Clone, Debug)]
pub struct ModelCaller {
    model: String,
    thinking_budget: u32,
    response_schema: Option<Value>,
    media: Option<MediaInput>,
    capabilities: Capabilities,
}

impl ModelCaller {
    pub fn new(model: impl Into<String>, thinking_budget: u32) -> Self {
        Self {
            model: model.into(),
            thinking_budget,
            response_schema: None,
            media: None,
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_media(mut self, media: MediaInput) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn generation_config(&self) -> GenerationConfig {
        let structured = self.response_schema.is_some();
        GenerationConfig {
            temperature: 0.0,
            top_p: 1.0,
            seed: 0,
            max_output_tokens: MAX_OUTPUT_TOKENS,
            response_modalities: vec!["TEXT"],
            thinking_config: ThinkingConfig {
                thinking_budget: self.thinking_budget,
            },
            response_mime_type: structured.then_some("application/json"),
            response_schema: self.response_schema.clone(),
            media_resolution: self
                .media
                .as_ref()
                .filter(|media| media.wants_low_resolution())
                .map(|_| "MEDIA_RESOLUTION_LOW"),
        }
    }

    pub fn build_request(&self, prompt: &str, media: Option<Part>) -> GenerateContentRequest {
        let mut parts: Vec<Part> = media.into_iter().collect();
        parts.push(Part {
            text: Some(prompt.trim().to_string()),
            ..Part::default()
        });
        let tools = if self.capabilities.web_search {
            vec![Tool {
                google_search: GoogleSearch {},
            }]
        } else {
            Vec::new()
        };
        GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts,
            }],
            generation_config: self.generation_config(),
            safety_settings: SAFETY_CATEGORIES
                .into_iter()
                .map(|category| SafetySetting {
                    category,
                    threshold: "OFF",
                })
                .collect(),
            tools,
        }
    }

    pub async fn text_to_text(
        &self,
        generator: &dyn ContentGenerator,
        prompt: &str,
    ) -> Result<(ModelOutput, Value), AiError> {
        let request = self.build_request(prompt, None);
        self.invoke(generator, &request).await
    }

    pub async fn video_to_text(
        &self,
        generator: &dyn ContentGenerator,
        prompt: &str,
    ) -> Result<(ModelOutput, Value), AiError> {
        let media = self.media.as_ref().ok_or(AiError::MediaNotSet)?;
        let bucket = generator
            .media_bucket()
            .ok_or(AiError::MissingConfig("GCS_BUCKET_NAME"))?;
        let request = self.build_request(prompt, Some(media.to_part(bucket)));
        self.invoke(generator, &request).await
    }

    async fn invoke(
        &self,
        generator: &dyn ContentGenerator,
        request: &GenerateContentRequest,
    ) -> Result<(ModelOutput, Value), AiError> {
        tracing::info!(
            model = self.model.as_str(),
            thinking_budget = self.thinking_budget,
            web_search = self.capabilities.web_search,
            structured = self.response_schema.is_some(),
            "model call"
        );
        let response = generator.generate(&self.model, request).await?;
        let text = response_text(&response)?;
        let output = if self.response_schema.is_some() {
            ModelOutput::Structured(serde_json::from_str(&text)?)
        } else {
            ModelOutput::Text(text)
        };
        Ok((output, response))
    }
}

/// Concatenate the answer text of the first candidate, skipping thought parts.
pub fn response_text(response: &Value) -> Result<String, AiError> {
    let parts = response
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array);
    let text: String = parts
        .into_iter()
        .flatten()
        .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        let reason = response
            .pointer("/promptFeedback/blockReason")
            .or_else(|| response.pointer("/candidates/0/finishReason"))
            .and_then(Value::as_str)
            .unwrap_or("no candidates");
        return Err(AiError::EmptyResponse(reason.to_string()));
    }
    Ok(text)
}

// ---- Vertex AI transport ---------------------------------------------------

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

enum TokenSource {
    Static(String),
    Metadata(Mutex<Option<CachedToken>>),
}

pub struct VertexClient {
    http: reqwest::Client,
    config: AiConfig,
    token: TokenSource,
}

impl VertexClient {
    pub fn new(config: AiConfig) -> Result<Self, AiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let token = match &config.access_token {
            Some(token) => TokenSource::Static(token.clone()),
            None => TokenSource::Metadata(Mutex::new(None)),
        };
        Ok(Self {
            http,
            config,
            token,
        })
    }

    pub fn endpoint(&self, model: &str) -> Result<String, AiError> {
        let project = self
            .config
            .project_id
            .as_deref()
            .ok_or(AiError::MissingConfig("GCP_PROJECT_ID"))?;
        Ok(endpoint_url(project, &self.config.location, model))
    }

    async fn access_token(&self) -> Result<String, AiError> {
        let cache = match &self.token {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata(cache) => cache,
        };
        let mut cached = cache.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| AiError::Auth(format!("metadata server: {err}")))?;
        if !response.status().is_success() {
            return Err(AiError::Auth(format!(
                "metadata server answered {}",
                response.status()
            )));
        }
        let token: MetadataToken = response
            .json()
            .await
            .map_err(|err| AiError::Auth(format!("decode token: {err}")))?;
        // Refresh a minute early so in-flight calls never carry an expired token.
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

pub fn endpoint_url(project: &str, location: &str, model: &str) -> String {
    let host = if location == "global" {
        "aiplatform.googleapis.com".to_string()
    } else {
        format!("{location}-aiplatform.googleapis.com")
    };
    format!(
        "https://{host}/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:generateContent"
    )
}

#[async_trait]
impl ContentGenerator for VertexClient {
    async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<Value, AiError> {
        let url = self.endpoint(model)?;
        let token = self.access_token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(model, status = status.as_u16(), "model call rejected");
            return Err(AiError::Api {
                status: status.as_u16(),
                body: clip(&body, 2048).to_string(),
            });
        }
        Ok(response.json::<Value>().await?)
    }

    fn media_bucket(&self) -> Option<&str> {
        self.config.bucket.as_deref()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Returns a canned response and keeps every request it saw.
    pub(crate) struct FakeGenerator {
        pub response: Value,
        pub bucket: Option<String>,
        pub requests: StdMutex<Vec<(String, Value)>>,
    }

    impl FakeGenerator {
        pub(crate) fn answering(text: &str) -> Self {
            Self {
                response: json!({
                    "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }]
                }),
                bucket: Some("media-bucket".to_string()),
                requests: StdMutex::new(Vec::new()),
            }
        }

        pub(crate) fn last_request(&self) -> (String, Value) {
            self.requests
                .lock()
                .expect("lock")
                .last()
                .cloned()
                .expect("a request was sent")
        }
    }

    #[async_trait]
    impl ContentGenerator for FakeGenerator {
        async fn generate(
            &self,
            model: &str,
            request: &GenerateContentRequest,
        ) -> Result<Value, AiError> {
            let body = serde_json::to_value(request)?;
            self.requests
                .lock()
                .expect("lock")
                .push((model.to_string(), body));
            Ok(self.response.clone())
        }

        fn media_bucket(&self) -> Option<&str> {
            self.bucket.as_deref()
        }
    }

    fn media(start: Option<&str>, end: Option<&str>) -> MediaInput {
        MediaInput {
            blob_name: "clips/Intro.MP4".to_string(),
            start_offset: start.map(str::to_string),
            end_offset: end.map(str::to_string),
            resolution: None,
        }
    }

    #[test]
    fn request_is_deterministic_and_unfiltered() {
        let request = ModelCaller::new(SIMPLE_CHAT_MODEL, 0).build_request("  hi  ", None);
        let body = serde_json::to_value(&request).expect("serialize");

        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        let config = &body["generationConfig"];
        assert_eq!(config["temperature"], 0.0);
        assert_eq!(config["topP"], 1.0);
        assert_eq!(config["seed"], 0);
        assert_eq!(config["maxOutputTokens"], 65535);
        assert_eq!(config["thinkingConfig"]["thinkingBudget"], 0);
        assert!(config.get("responseMimeType").is_none());

        let settings = body["safetySettings"].as_array().expect("settings");
        assert_eq!(settings.len(), 4);
        assert!(settings.iter().all(|setting| setting["threshold"] == "OFF"));
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn web_search_adds_grounding_tool() {
        let request = ModelCaller::new(SIMPLE_CHAT_MODEL, 512)
            .with_capabilities(Capabilities { web_search: true })
            .build_request("news", None);
        let body = serde_json::to_value(&request).expect("serialize");
        assert_eq!(body["tools"], json!([{ "googleSearch": {} }]));
        assert_eq!(body["generationConfig"]["thinkingConfig"]["thinkingBudget"], 512);
        assert_eq!(body["safetySettings"].as_array().map(Vec::len), Some(4));
    }

    #[test]
    fn schema_requests_json_output() {
        let schema = json!({ "type": "OBJECT", "properties": { "title": { "type": "STRING" } } });
        let request = ModelCaller::new(SIMPLE_CHAT_MODEL, 0)
            .with_schema(schema.clone())
            .build_request("title?", None);
        let body = serde_json::to_value(&request).expect("serialize");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["responseSchema"], schema);
    }

    #[test]
    fn media_part_uses_bucket_uri_and_clip_offsets() {
        let part = media(Some("0s"), Some("30s")).to_part("media-bucket");
        let body = serde_json::to_value(&part).expect("serialize");
        assert_eq!(body["fileData"]["fileUri"], "gs://media-bucket/clips/Intro.MP4");
        assert_eq!(body["fileData"]["mimeType"], "video/mp4");
        assert_eq!(body["videoMetadata"]["startOffset"], "0s");
        assert_eq!(body["videoMetadata"]["endOffset"], "30s");

        let open_ended = media(Some("0s"), None).to_part("media-bucket");
        assert!(open_ended.video_metadata.is_none());
    }

    #[tokio::test]
    async fn video_call_puts_media_before_prompt() {
        let generator = FakeGenerator::answering("a cat");
        let mut input = media(None, None);
        input.resolution = Some("low".to_string());
        let (output, _) = ModelCaller::new(VIDEO_CHAT_MODEL, 0)
            .with_media(input)
            .video_to_text(&generator, "what is shown?")
            .await
            .expect("call");
        assert_eq!(output, ModelOutput::Text("a cat".to_string()));

        let (model, body) = generator.last_request();
        assert_eq!(model, VIDEO_CHAT_MODEL);
        let parts = body["contents"][0]["parts"].as_array().expect("parts");
        assert!(parts[0].get("fileData").is_some());
        assert_eq!(parts[1]["text"], "what is shown?");
        assert_eq!(body["generationConfig"]["mediaResolution"], "MEDIA_RESOLUTION_LOW");
    }

    #[tokio::test]
    async fn video_call_without_media_fails() {
        let generator = FakeGenerator::answering("unused");
        let err = ModelCaller::new(VIDEO_CHAT_MODEL, 0)
            .video_to_text(&generator, "what is shown?")
            .await
            .expect_err("no media");
        assert!(matches!(err, AiError::MediaNotSet));
        assert!(generator.requests.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn structured_output_is_parsed() {
        let generator = FakeGenerator::answering(r#"{"title":"Hello"}"#);
        let (output, raw) = ModelCaller::new(SIMPLE_CHAT_MODEL, 0)
            .with_schema(json!({ "type": "OBJECT" }))
            .text_to_text(&generator, "title?")
            .await
            .expect("call");
        assert_eq!(output, ModelOutput::Structured(json!({ "title": "Hello" })));
        assert!(raw.get("candidates").is_some());
    }

    #[test]
    fn response_text_skips_thoughts_and_joins_parts() {
        let response = json!({
            "candidates": [{ "content": { "parts": [
                { "text": "thinking...", "thought": true },
                { "text": "Hello, " },
                { "text": "world" }
            ] } }]
        });
        assert_eq!(response_text(&response).expect("text"), "Hello, world");
    }

    #[test]
    fn blocked_prompt_reports_reason() {
        let response = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        let err = response_text(&response).expect_err("blocked");
        assert!(matches!(err, AiError::EmptyResponse(reason) if reason == "SAFETY"));
    }

    #[test]
    fn endpoint_depends_on_location() {
        assert_eq!(
            endpoint_url("proj", "us-central1", SIMPLE_CHAT_MODEL),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/proj/locations/us-central1/publishers/google/models/gemini-2.5-flash-lite:generateContent"
        );
        assert!(endpoint_url("proj", "global", SIMPLE_CHAT_MODEL)
            .starts_with("https://aiplatform.googleapis.com/v1/projects/proj/locations/global/"));
    }
}
