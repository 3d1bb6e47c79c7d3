//! HTTP client for the Ollama inference endpoint
//!
//! Real blocking HTTP calls against a model server. The endpoint contract is versioned and
//! this client tolerates the two shapes it has shipped:
//!
//! - a single JSON object (`stream: false`)
//! - newline-delimited JSON objects (`stream: true`), the last complete one authoritative
//!
//! ## Endpoints
//! - `POST /api/generate` `{model, prompt, stream}`
//! - `POST /api/pull` `{model, stream}` → `{status}`
//! - `POST /api/show` `{model, stream}` → `{details: {parameter_size, quantization_level}}`
//! - `GET /api/tags` → `{models: [{name}]}`
//!
//! ## References
//! - Ollama API: https://github.com/ollama/ollama/blob/main/docs/api.md

use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::EvalPhase;
use crate::error::{MedidorError, Result};

/// Status string the pull endpoint reports on completion
pub const PULL_SUCCESS_STATUS: &str = "success";

/// `POST /api/generate` body
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    /// Model identifier
    pub model: String,
    /// Input prompt
    pub prompt: String,
    /// Whether the server should stream NDJSON chunks
    pub stream: bool,
}

/// `POST /api/pull` and `POST /api/show` body
#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    /// Model identifier
    pub model: String,
    /// Whether the server should stream NDJSON progress
    pub stream: bool,
}

/// One generate response object (the whole response, or one stream chunk)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateResponse {
    /// Model used
    #[serde(default)]
    pub model: String,
    /// Generated text (the chunk's text when streaming)
    #[serde(default)]
    pub response: String,
    /// Whether generation is done
    #[serde(default)]
    pub done: bool,
    /// Total duration
    #[serde(default)]
    pub total_duration: i64,
    /// Model load duration
    #[serde(default)]
    pub load_duration: i64,
    /// Prompt tokens evaluated
    #[serde(default)]
    pub prompt_eval_count: i64,
    /// Prompt evaluation duration
    #[serde(default)]
    pub prompt_eval_duration: i64,
    /// Tokens generated
    #[serde(default)]
    pub eval_count: i64,
    /// Generation duration
    #[serde(default)]
    pub eval_duration: i64,
    /// Error reported in-band by the server
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerateResponse {
    /// `(token count, duration)` for the requested evaluation phase
    #[must_use]
    pub fn eval_counters(&self, phase: EvalPhase) -> (i64, i64) {
        match phase {
            EvalPhase::Generation => (self.eval_count, self.eval_duration),
            EvalPhase::Prompt => (self.prompt_eval_count, self.prompt_eval_duration),
        }
    }
}

/// Model metadata from `POST /api/show`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelDetails {
    /// Magnitude-suffixed parameter count, e.g. `"7B"`
    #[serde(default)]
    pub parameter_size: String,
    /// Quantization label, e.g. `"Q4_0"`
    #[serde(default)]
    pub quantization_level: String,
    /// Model family, e.g. `"llama"`
    #[serde(default)]
    pub family: String,
    /// Weight file format, e.g. `"gguf"`
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Deserialize)]
struct ShowResponse {
    details: ModelDetails,
}

#[derive(Debug, Deserialize)]
struct PullStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Inference endpoint contract used by the benchmark runner
pub trait InferenceEndpoint: Send + Sync {
    /// Run one generation and return the authoritative (final) response object
    ///
    /// # Errors
    /// Returns `Transport` or `ResponseFormat` on any failure
    fn generate(&self, model: &str, prompt: &str) -> Result<GenerateResponse>;

    /// Download `model` onto the server
    ///
    /// # Errors
    /// Returns `Transport` if the pull does not end in the success status
    fn pull(&self, model: &str) -> Result<()>;

    /// Fetch parameter size and quantization level of `model`
    ///
    /// # Errors
    /// Returns `Transport` or `ResponseFormat` on any failure
    fn show(&self, model: &str) -> Result<ModelDetails>;

    /// Names of the models installed on the server
    ///
    /// # Errors
    /// Returns `Transport` or `ResponseFormat` on any failure
    fn list_models(&self) -> Result<Vec<String>>;
}

/// Base URL for a `host:port` address; an explicit scheme is kept as given
#[must_use]
pub fn endpoint_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// Decode every complete JSON object in `body`
///
/// A body that parses as one object (possibly pretty-printed) is returned as is. Otherwise
/// each non-empty line is decoded on its own and undecodable lines are skipped, so a
/// malformed chunk never hides the objects after it.
///
/// # Errors
/// Returns `ResponseFormat` if `body` holds no complete object
pub fn decode_json_stream<T: DeserializeOwned>(body: &str) -> Result<Vec<T>> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(MedidorError::ResponseFormat {
            reason: "empty response body".to_string(),
        });
    }
    if let Ok(object) = serde_json::from_str::<T>(trimmed) {
        return Ok(vec![object]);
    }

    let mut objects = Vec::new();
    let mut last_error = None;
    for (line_no, line) in trimmed.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(object) => objects.push(object),
            Err(e) => {
                tracing::warn!(
                    line = line_no + 1,
                    error = %e,
                    "skipping undecodable response line"
                );
                last_error = Some(e);
            },
        }
    }
    if objects.is_empty() {
        let reason = last_error.map_or_else(
            || "empty response body".to_string(),
            |e| format!("no decodable JSON object in response: {e}"),
        );
        return Err(MedidorError::ResponseFormat { reason });
    }
    Ok(objects)
}

/// Fold a generate body into its authoritative response, concatenating streamed text
///
/// # Errors
/// Returns `ResponseFormat` for an undecodable body, `Transport` for an in-band server error
pub fn decode_generate_body(body: &str) -> Result<GenerateResponse> {
    let chunks: Vec<GenerateResponse> = decode_json_stream(body)?;
    let text: String = chunks.iter().map(|c| c.response.as_str()).collect();

    let mut last = chunks
        .into_iter()
        .last()
        .ok_or_else(|| MedidorError::ResponseFormat {
            reason: "empty response body".to_string(),
        })?;

    if let Some(error) = last.error.take() {
        return Err(MedidorError::Transport(format!(
            "endpoint reported error: {error}"
        )));
    }
    last.response = text;
    Ok(last)
}

/// Blocking HTTP client for one Ollama server
pub struct OllamaClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    stream: bool,
}

impl std::fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("stream", &self.stream)
            .finish()
    }
}

impl OllamaClient {
    /// Create a client for `address` (`host:port` or a full URL)
    ///
    /// Every request is bounded by `timeout`.
    ///
    /// # Errors
    /// Returns `Transport` if the HTTP client cannot be built
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MedidorError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: endpoint_url(address),
            timeout,
            stream: false,
        })
    }

    /// Ask the server for NDJSON streaming on generate
    #[must_use]
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Base URL requests go to
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Request timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST `body` to `path` and return the full response text
    fn post_text<B: Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| MedidorError::Transport(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| MedidorError::Transport(format!("failed to read body from {url}: {e}")))?;

        if !status.is_success() {
            return Err(MedidorError::Transport(format!(
                "HTTP {status} from {url}: {text}"
            )));
        }
        Ok(text)
    }
}

impl InferenceEndpoint for OllamaClient {
    fn generate(&self, model: &str, prompt: &str) -> Result<GenerateResponse> {
        let request = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            stream: self.stream,
        };
        let body = self.post_text("/api/generate", &request)?;
        decode_generate_body(&body)
    }

    fn pull(&self, model: &str) -> Result<()> {
        let request = ModelRequest {
            model: model.to_string(),
            stream: false,
        };
        let body = self.post_text("/api/pull", &request)?;
        let statuses: Vec<PullStatus> = decode_json_stream(&body)?;

        match statuses.last() {
            Some(PullStatus {
                error: Some(error), ..
            }) => Err(MedidorError::Transport(format!(
                "pull of {model} failed: {error}"
            ))),
            Some(last) if last.status == PULL_SUCCESS_STATUS => Ok(()),
            Some(last) => Err(MedidorError::Transport(format!(
                "pull of {model} ended with status '{}'",
                last.status
            ))),
            None => Err(MedidorError::ResponseFormat {
                reason: "empty pull response".to_string(),
            }),
        }
    }

    fn show(&self, model: &str) -> Result<ModelDetails> {
        let request = ModelRequest {
            model: model.to_string(),
            stream: false,
        };
        let body = self.post_text("/api/show", &request)?;
        let show: ShowResponse =
            serde_json::from_str(&body).map_err(|e| MedidorError::ResponseFormat {
                reason: format!("failed to parse show response: {e}"),
            })?;
        Ok(show.details)
    }

    fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| MedidorError::Transport(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(MedidorError::Transport(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }

        let tags: TagsResponse = response.json().map_err(|e| MedidorError::ResponseFormat {
            reason: format!("failed to parse tags response: {e}"),
        })?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}
