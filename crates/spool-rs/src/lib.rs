//! Streaming client and context-budget pipeline for KoboldCpp-compatible
//! text-generation servers.
//!
//! `spool-rs` turns the backend's blocking "submit prompt, poll for progress"
//! HTTP protocol into a real-time incremental text stream, and keeps the
//! submitted prompt inside the server's context-length budget. The core
//! abstraction is the [`Generator`](stream::Generator) — one call builds the
//! final prompt, compresses it under budget if needed, submits the blocking
//! generate request in a background task, and concurrently polls the progress
//! endpoint to emit [`StreamEvent`](stream::StreamEvent) deltas.
//!
//! # Getting started
//!
//! ```ignore
//! use spool_rs::context::{BudgetProbe, UnavailableSummarizer};
//! use spool_rs::stream::{Generator, StreamEvent};
//! use spool_rs::{GenerationRequest, KoboldClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), spool_rs::Error> {
//!     let client = KoboldClient::new("http://127.0.0.1:5001")?;
//!     let probe = BudgetProbe::new(client.clone());
//!     let no_aux = UnavailableSummarizer;
//!
//!     let req = GenerationRequest::new("[Instructions]\nContinue the story.\n\n[Story]\n", "Once upon a time...");
//!     let generator = Generator::new(client, &probe, &no_aux);
//!     let events = generator
//!         .stream_live(&req, |ev| {
//!             if let StreamEvent::Delta(text) = ev {
//!                 print!("{text}");
//!             }
//!         })
//!         .await?;
//!     println!("\n{} events", events.len());
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! If you're looking for how to...
//!
//! - **Talk to the backend:** see [`KoboldClient`] — JSON POST/GET helpers,
//!   the generation-endpoint candidate list, shape-tolerant text extraction,
//!   and best-effort [`abort`](KoboldClient::abort).
//!
//! - **Measure and enforce the context budget:** see
//!   [`BudgetProbe`](context::BudgetProbe) (token counting against the
//!   backend's counting endpoint) and
//!   [`CompressionEngine`](context::CompressionEngine) (truncate-from-oldest
//!   or summarize-and-fold via a small auxiliary model).
//!
//! - **Stream a generation:** see [`Generator`](stream::Generator) and
//!   [`StreamEvent`](stream::StreamEvent). Deltas arrive through a callback
//!   while the blocking generate call runs in a background task.
//!
//! - **Manage server processes:** see [`ServerProcess`](process::ServerProcess)
//!   (spawn/TCP-probe/stop) and [`AuxiliaryModel`](process::AuxiliaryModel),
//!   the lazily-started summarization backend.
//!
//! - **Resolve prompts and templates:** see [`PromptSections`](prompt::PromptSections)
//!   for the instruction header and [`ChatTemplate`](template::ChatTemplate)
//!   for the closed set of model chat formats.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Token-budget probe and the two compression strategies |
//! | [`stream`] | Poll-based delta streaming of one generation request |
//! | [`process`] | Backend and auxiliary model process lifecycle |
//! | [`catalog`] | Model catalog: name → download URL + launch hints |
//! | [`template`] | Chat templates as a closed set of tagged variants |
//! | [`prompt`] | Instruction-header composition from titled sections |

pub mod catalog;
pub mod context;
pub mod process;
pub mod prompt;
pub mod stream;
pub mod template;

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};

// ── Constants ──────────────────────────────────────────────────────

/// Default backend base URL (a locally-running KoboldCpp instance).
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5001";

/// Default HTTP timeout. Generous because the blocking generate call only
/// returns once the whole completion has been produced.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Generation endpoints tried in order; the first structurally-valid
/// response wins. Different KoboldCpp builds expose different paths.
pub const GENERATE_ENDPOINTS: [&str; 3] =
    ["/api/v1/generate", "/api/v1/generate/text", "/api/generate"];

/// Abort endpoints, tried in order, best-effort.
pub const ABORT_ENDPOINTS: [&str; 2] = ["/api/v1/abort", "/api/abort"];

/// Progress snapshot endpoint polled during streaming.
pub const CHECK_ENDPOINT: &str = "/api/extra/generate/check";

/// Active model name endpoint.
pub const MODEL_ENDPOINT: &str = "/api/v1/model";

/// Prompt token counting endpoint.
pub const TOKEN_COUNT_ENDPOINT: &str = "/api/extra/tokencount";

/// Server-reported maximum context length endpoint.
pub const MAX_CONTEXT_ENDPOINT: &str = "/api/extra/true_max_context_length";

/// Maximum characters of a backend payload included in a
/// [`Error::ResponseShape`] diagnostic dump.
pub const SHAPE_DUMP_CHARS: usize = 400;

// ── Errors ─────────────────────────────────────────────────────────

/// Error taxonomy for backend interaction and budget enforcement.
///
/// Process management deliberately does *not* use this type — starting and
/// stopping server processes reports descriptive status strings instead
/// (see [`process`]), so callers check return values there.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP failure, timeout, or unreachable backend.
    #[error("{0}")]
    Transport(String),
    /// A 2xx response carrying none of the accepted text shapes. Includes a
    /// truncated dump of the offending payload for diagnosis.
    #[error("unrecognized response shape: {0}")]
    ResponseShape(String),
    /// A compression mode string that names no known strategy.
    #[error("unsupported compression mode {0:?} (expected \"simple\" or \"summarize\")")]
    UnsupportedMode(String),
    /// The auxiliary summarization model could not be made available.
    #[error("auxiliary model unavailable: {0}")]
    AuxiliaryUnavailable(String),
}

// ── Sampling parameters ────────────────────────────────────────────

/// Sampling parameters for one generation request.
///
/// Each field is passed through to the backend unmodified; range enforcement
/// is the server's job, not the client's.
#[derive(Serialize, Clone, Debug)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub max_new_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.1,
            max_new_tokens: 400,
        }
    }
}

impl SamplingParams {
    /// Override the sampling temperature.
    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    /// Override the per-request generation length.
    pub fn with_max_new_tokens(mut self, tokens: u32) -> Self {
        self.max_new_tokens = tokens;
        self
    }

    /// Build the Kobold-style generate payload for `prompt`.
    ///
    /// Field names follow the Kobold API (`rep_pen`, `max_length`) rather
    /// than this struct's own naming.
    pub fn to_payload(&self, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "prompt": prompt,
            "temperature": self.temperature,
            "top_k": self.top_k,
            "top_p": self.top_p,
            "rep_pen": self.repeat_penalty,
            "max_length": self.max_new_tokens,
        })
    }
}

// ── Compression mode ───────────────────────────────────────────────

/// Strategy used to bring an over-budget prompt back under the context limit.
///
/// The set is closed: a mode string that matches neither variant fails to
/// parse with [`Error::UnsupportedMode`] instead of silently compressing to
/// nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionMode {
    /// Drop whole lines from the oldest content until the prompt fits.
    Simple,
    /// Fold the oldest content into short summaries produced by a small
    /// auxiliary model, keeping recent content verbatim.
    Summarize,
}

impl std::str::FromStr for CompressionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_lowercase().as_str() {
            "simple" | "truncate" => Ok(CompressionMode::Simple),
            "summarize" | "auxiliary" => Ok(CompressionMode::Summarize),
            other => Err(Error::UnsupportedMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionMode::Simple => write!(f, "simple"),
            CompressionMode::Summarize => write!(f, "summarize"),
        }
    }
}

// ── Generation request ─────────────────────────────────────────────

/// Everything one streaming generation needs. Immutable once constructed;
/// drives exactly one [`Generator`](stream::Generator) call.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// Instruction header placed ahead of the document body.
    pub header: String,
    /// Accumulated document text (the compressible part of the prompt).
    pub body: String,
    /// Chat template override. `None` resolves the template from the
    /// backend's reported model name.
    pub template: Option<template::ChatTemplate>,
    pub sampling: SamplingParams,
    pub mode: CompressionMode,
    /// Tokens held back for the generation itself when checking the budget.
    pub reserve: u32,
}

impl GenerationRequest {
    pub fn new(header: impl Into<String>, body: impl Into<String>) -> Self {
        let sampling = SamplingParams::default();
        let reserve = sampling.max_new_tokens;
        Self {
            header: header.into(),
            body: body.into(),
            template: None,
            sampling,
            mode: CompressionMode::Simple,
            reserve,
        }
    }

    /// Pin the chat template instead of resolving it from the model name.
    pub fn with_template(mut self, template: template::ChatTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_mode(mut self, mode: CompressionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the reserved generation budget (defaults to
    /// `sampling.max_new_tokens`).
    pub fn with_reserve(mut self, tokens: u32) -> Self {
        self.reserve = tokens;
        self
    }
}

// ── Response text extraction ───────────────────────────────────────

/// Pull generated text out of a backend response, trying the accepted
/// shapes in order: `results[0].text`, `text`, `data.text`.
///
/// Returns `None` when no shape matches; never fails. Use [`extract_text`]
/// when an empty string is an acceptable answer.
pub fn text_shape(data: &serde_json::Value) -> Option<String> {
    if let Some(text) = data
        .get("results")
        .and_then(|r| r.get(0))
        .and_then(|item| item.get("text"))
        .and_then(|t| t.as_str())
    {
        return Some(text.to_string());
    }
    if let Some(text) = data.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    data.get("data")
        .and_then(|d| d.get("text"))
        .and_then(|t| t.as_str())
        .map(|text| text.to_string())
}

/// Lenient variant of [`text_shape`]: empty string when nothing matches.
pub fn extract_text(data: &serde_json::Value) -> String {
    text_shape(data).unwrap_or_default()
}

/// Truncate a payload to a diagnostic-sized dump for error messages.
fn shape_dump(data: &serde_json::Value) -> String {
    let raw = data.to_string();
    if raw.chars().count() <= SHAPE_DUMP_CHARS {
        raw
    } else {
        let head: String = raw.chars().take(SHAPE_DUMP_CHARS).collect();
        format!("{head}...")
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for a KoboldCpp-compatible backend.
///
/// No state beyond endpoint configuration — cheap to clone, and clones share
/// the underlying connection pool.
#[derive(Clone)]
pub struct KoboldClient {
    client: reqwest::Client,
    base_url: String,
}

impl KoboldClient {
    /// Create a client with the default request timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent("spool-rs/0.3")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// The configured base URL (no trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON payload and parse the JSON response.
    ///
    /// Timeouts and non-2xx statuses surface as [`Error::Transport`]; a 2xx
    /// body that isn't JSON surfaces as [`Error::ResponseShape`].
    pub async fn post_json(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let url = format!("{}{path}", self.base_url);
        trace!("POST {url}");
        let resp = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request to {path} failed: {e}")))?;
        Self::read_json(path, resp).await
    }

    /// GET a path and parse the JSON response.
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value, Error> {
        let url = format!("{}{path}", self.base_url);
        trace!("GET {url}");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request to {path} failed: {e}")))?;
        Self::read_json(path, resp).await
    }

    async fn read_json(path: &str, resp: reqwest::Response) -> Result<serde_json::Value, Error> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response from {path}: {e}")))?;
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "backend HTTP {status} from {path}: {text}"
            )));
        }
        serde_json::from_str(&text).map_err(|_| {
            let head: String = text.chars().take(SHAPE_DUMP_CHARS).collect();
            Error::ResponseShape(head)
        })
    }

    /// Submit a blocking generate call and return the completed text.
    ///
    /// Tries each entry of [`GENERATE_ENDPOINTS`] in order; the first
    /// response carrying an accepted text shape wins. When every candidate
    /// fails, the last error is surfaced.
    pub async fn generate(&self, payload: &serde_json::Value) -> Result<String, Error> {
        let mut last_err = Error::Transport(format!(
            "no generation endpoint reachable at {}",
            self.base_url
        ));
        for path in GENERATE_ENDPOINTS {
            match self.post_json(path, payload).await {
                Ok(data) => match text_shape(&data) {
                    Some(text) => {
                        debug!("generate via {path}: {} chars", text.len());
                        return Ok(text);
                    }
                    None => {
                        debug!("generate via {path}: unrecognized shape");
                        last_err = Error::ResponseShape(shape_dump(&data));
                    }
                },
                Err(e) => {
                    debug!("generate via {path} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Snapshot of the in-progress generation text so far.
    ///
    /// Extraction is lenient — a shape the client doesn't recognize reads as
    /// an empty snapshot, not an error.
    pub async fn check_progress(&self) -> Result<String, Error> {
        let data = self.post_json(CHECK_ENDPOINT, &serde_json::json!({})).await?;
        Ok(extract_text(&data))
    }

    /// The backend's currently-loaded model name.
    pub async fn model_name(&self) -> Result<String, Error> {
        let data = self.get_json(MODEL_ENDPOINT).await?;
        data.get("result")
            .and_then(|r| r.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::ResponseShape(shape_dump(&data)))
    }

    /// Best-effort generation abort.
    ///
    /// Tries the known abort endpoints in order and stops at the first
    /// success; failures are ignored. Cancellation is advisory — the poll
    /// loop ends on its own terms, not because of this call.
    pub async fn abort(&self) {
        for path in ABORT_ENDPOINTS {
            match self.post_json(path, &serde_json::json!({})).await {
                Ok(_) => {
                    debug!("abort accepted via {path}");
                    return;
                }
                Err(e) => trace!("abort via {path} failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn extract_results_shape() {
        let data = serde_json::json!({"results": [{"text": "hello"}]});
        assert_eq!(extract_text(&data), "hello");
    }

    #[test]
    fn extract_flat_text_shape() {
        let data = serde_json::json!({"text": "flat"});
        assert_eq!(extract_text(&data), "flat");
    }

    #[test]
    fn extract_nested_data_shape() {
        let data = serde_json::json!({"data": {"text": "nested"}});
        assert_eq!(extract_text(&data), "nested");
    }

    #[test]
    fn extract_unknown_shape_is_empty() {
        let data = serde_json::json!({"status": "ok"});
        assert_eq!(extract_text(&data), "");
        assert!(text_shape(&data).is_none());
    }

    #[test]
    fn extract_prefers_results_over_flat_text() {
        let data = serde_json::json!({"results": [{"text": "a"}], "text": "b"});
        assert_eq!(extract_text(&data), "a");
    }

    #[test]
    fn payload_uses_kobold_field_names() {
        let params = SamplingParams::default();
        let payload = params.to_payload("once upon a time");
        assert_eq!(payload["prompt"], "once upon a time");
        assert_eq!(payload["rep_pen"], 1.1);
        assert_eq!(payload["max_length"], 400);
        assert_eq!(payload["top_k"], 40);
        assert!(payload.get("repeat_penalty").is_none());
    }

    #[test]
    fn mode_parses_known_names() {
        assert_eq!(
            CompressionMode::from_str("simple").unwrap(),
            CompressionMode::Simple
        );
        assert_eq!(
            CompressionMode::from_str("Summarize").unwrap(),
            CompressionMode::Summarize
        );
    }

    #[test]
    fn mode_rejects_unknown_names_loudly() {
        let err = CompressionMode::from_str("zip").unwrap_err();
        assert!(matches!(err, Error::UnsupportedMode(ref m) if m == "zip"));
        assert!(err.to_string().contains("unsupported compression mode"));
    }

    #[test]
    fn request_defaults_reserve_to_generation_length() {
        let req = GenerationRequest::new("header", "body");
        assert_eq!(req.reserve, req.sampling.max_new_tokens);
        assert_eq!(req.mode, CompressionMode::Simple);
        assert!(req.template.is_none());
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = KoboldClient::new("http://localhost:5001/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:5001");
    }

    #[test]
    fn shape_dump_truncates_large_payloads() {
        let data = serde_json::json!({"blob": "x".repeat(2000)});
        let dump = shape_dump(&data);
        assert!(dump.chars().count() <= SHAPE_DUMP_CHARS + 3);
        assert!(dump.ends_with("..."));
    }
}
