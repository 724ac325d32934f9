use crate::{
    conversation::Message,
    error::ApiError,
    resilient::{DegradationStrategy, PlainTextFallback, ResilientClient},
};
use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, info};

pub const DEFAULT_MODEL: &str = "gemini-flash-latest";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z]*").expect("valid code fence pattern"));

/// Removes Markdown code-fence markers (```` ```json ````, ```` ```html ````,
/// bare ```` ``` ````) that models like to wrap their answers in.
pub fn strip_code_fences(text: &str) -> String {
    CODE_FENCE.replace_all(text, "").trim().to_string()
}

/// How the model is asked to shape a single-shot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Structured-output mode: `responseMimeType: application/json`.
    Json,
    /// Free text.
    Text,
}

/// A generic client for the generation model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Makes a single-shot call with one prompt and returns the answer text.
    ///
    /// In [`ResponseMode::Json`], a request rejected as a bad request is sent
    /// once more without the structured-output flag.
    async fn generate_text(
        &self,
        credential: &SecretString,
        prompt: &str,
        mode: ResponseMode,
    ) -> Result<String, ApiError>;

    /// Sends the whole conversation and returns the model's next reply.
    async fn converse(
        &self,
        credential: &SecretString,
        history: &[Message],
    ) -> Result<String, ApiError>;
}

/// `LLMClient` for the Gemini `generateContent` REST endpoint.
pub struct GeminiClient {
    http: ResilientClient,
    api_base: String,
    model: String,
}

impl GeminiClient {
    /// Creates a new client.
    ///
    /// # Arguments
    ///
    /// * `http` - The resilient client every request goes through.
    /// * `api_base` - Base URL up to and including the API version.
    /// * `model` - Model identifier or alias (e.g., "gemini-flash-latest").
    pub fn new(http: ResilientClient, api_base: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    fn endpoint(&self, credential: &SecretString) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base,
            self.model,
            credential.expose_secret()
        )
    }
}

#[async_trait]
impl LLMClient for GeminiClient {
    async fn generate_text(
        &self,
        credential: &SecretString,
        prompt: &str,
        mode: ResponseMode,
    ) -> Result<String, ApiError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: None,
                parts: vec![Part { text: prompt }],
            }],
            generation_config: (mode == ResponseMode::Json).then_some(GenerationConfig {
                response_mime_type: "application/json",
            }),
        };
        info!(model = %self.model, ?mode, "Sending single-shot generation request");
        let fallback: Option<&dyn DegradationStrategy> = match mode {
            ResponseMode::Json => Some(&PlainTextFallback),
            ResponseMode::Text => None,
        };
        let body = self
            .http
            .call(&self.endpoint(credential), &encode(&request)?, fallback)
            .await?;
        first_text(body)
    }

    async fn converse(
        &self,
        credential: &SecretString,
        history: &[Message],
    ) -> Result<String, ApiError> {
        let request = GenerateContentRequest {
            contents: history
                .iter()
                .map(|m| Content {
                    role: Some(m.role.as_str()),
                    parts: vec![Part { text: &m.content }],
                })
                .collect(),
            generation_config: None,
        };
        info!(model = %self.model, messages = history.len(), "Sending conversation request");
        let body = self
            .http
            .call(&self.endpoint(credential), &encode(&request)?, None)
            .await?;
        first_text(body)
    }
}

// --- Wire types ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<PartResponse>,
}

#[derive(Deserialize)]
struct PartResponse {
    text: Option<String>,
}

fn encode(request: &GenerateContentRequest<'_>) -> Result<Value, ApiError> {
    serde_json::to_value(request)
        .map_err(|e| ApiError::BadRequest(format!("failed to encode request: {}", e)))
}

/// Text of the first part of the first candidate.
fn first_text(body: Value) -> Result<String, ApiError> {
    let response: GenerateContentResponse = serde_json::from_value(body)
        .map_err(|e| ApiError::MalformedResponse(format!("unexpected response shape: {}", e)))?;
    let text = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .ok_or_else(|| {
            ApiError::MalformedResponse("no text in the first response candidate".to_string())
        })?;
    debug!(chars = text.len(), "Received model text");
    Ok(text)
}
