//! Vision OCR: recognise a rendered page with a vision language model.
//!
//! The default [`TextRecognizer`] sends the page to any OpenAI-compatible
//! `/chat/completions` endpoint (OpenAI, Azure, Ollama, vLLM, LM Studio)
//! and asks for a verbatim transcription.
//!
//! ## Why PNG with `detail: "high"`?
//!
//! PNG is lossless, and JPEG artefacts around small glyphs ("½", "°")
//! confuse vision models far more than the extra bytes cost. `detail:
//! "high"` lets tiling models look at the page at full resolution instead
//! of a single 512 px overview.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 5xx responses and connection errors are transient under
//! load. They are retried with exponential backoff
//! (`retry_backoff * 2^(retry-1)`); other 4xx responses fail immediately.

use crate::document::Bitmap;
use crate::error::AdapterError;
use crate::pipeline::ocr::{RecognitionOptions, RecognizedText, TextRecognizer};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Base URL of the chat completions API (without `/chat/completions`).
pub const VISION_URL_ENV: &str = "RECIPE_EXTRACT_VISION_URL";
/// Model name sent with each request.
pub const VISION_MODEL_ENV: &str = "RECIPE_EXTRACT_VISION_MODEL";
/// Bearer token; optional for local servers.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT: &str = "\
You are an OCR engine for recipes. Transcribe every piece of visible text \
in the image exactly as printed, top to bottom, preserving line breaks. \
Keep quantities, fractions, temperatures and units exactly as shown. \
Do not add commentary, headings, Markdown or translations. \
If the image contains no text, reply with nothing.";

/// Connection settings for [`VisionRecognizer`].
#[derive(Clone)]
pub struct VisionConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    pub max_tokens: u32,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl std::fmt::Debug for VisionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(60),
            max_tokens: 2048,
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl VisionConfig {
    /// Read [`VISION_URL_ENV`], [`VISION_MODEL_ENV`] and [`API_KEY_ENV`].
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            base_url: non_empty(VISION_URL_ENV).unwrap_or(defaults.base_url),
            model: non_empty(VISION_MODEL_ENV).unwrap_or(defaults.model),
            api_key: non_empty(API_KEY_ENV),
            ..defaults
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Recognises text through a vision language model.
#[derive(Debug, Clone)]
pub struct VisionRecognizer {
    client: reqwest::Client,
    config: VisionConfig,
}

impl VisionRecognizer {
    pub fn new(config: VisionConfig) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AdapterError::Unavailable(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Build from the environment.
    ///
    /// The hosted default endpoint needs an API key; a custom endpoint
    /// (typically a local server) does not.
    pub fn from_env() -> Result<Self, AdapterError> {
        let config = VisionConfig::from_env();
        if config.api_key.is_none() && config.base_url == DEFAULT_BASE_URL {
            return Err(AdapterError::Unavailable(format!(
                "no vision provider configured: set {API_KEY_ENV} or {VISION_URL_ENV}"
            )));
        }
        info!(model = %config.model, url = %config.base_url, "vision recognizer configured");
        Self::new(config)
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    async fn send_once(&self, body: &serde_json::Value) -> Result<String, Attempt> {
        let mut request = self.client.post(self.config.endpoint()).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Attempt::Retry(AdapterError::Transport(e.to_string())))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail = format!("HTTP {status}: {}", detail.chars().take(300).collect::<String>());
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                Attempt::Retry(AdapterError::Transport(detail))
            } else {
                Attempt::Fatal(AdapterError::Failed(detail))
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Attempt::Fatal(AdapterError::Failed(format!("malformed response: {e}"))))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| Attempt::Fatal(AdapterError::Failed("response has no choices".into())))
    }
}

enum Attempt {
    Retry(AdapterError),
    Fatal(AdapterError),
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[async_trait]
impl TextRecognizer for VisionRecognizer {
    async fn recognize_text(
        &self,
        bitmap: &Bitmap,
        options: &RecognitionOptions,
    ) -> Result<RecognizedText, AdapterError> {
        let start = Instant::now();
        let data_uri = encode_bitmap(bitmap)?;
        let body = request_body(&self.config, &data_uri, &options.char_allowlist);

        let mut last_err = AdapterError::Failed("no attempt made".into());
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    "Vision OCR: retry {}/{} after {:?}",
                    attempt, self.config.max_retries, backoff
                );
                sleep(backoff).await;
            }

            match self.send_once(&body).await {
                Ok(raw) => {
                    let text = filter_allowlist(&raw, &options.char_allowlist);
                    let confidence = heuristic_confidence(&text);
                    info!(
                        model = %self.config.model,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        chars = text.len(),
                        confidence,
                        "Vision OCR complete"
                    );
                    return Ok(RecognizedText { text, confidence });
                }
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(e)) => {
                    warn!("Vision OCR: attempt {} failed: {}", attempt + 1, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

// ── Request building ─────────────────────────────────────────────────────────

fn user_prompt(allowlist: &str) -> String {
    format!(
        "Transcribe the recipe text in this image. Use only these characters \
         (plus spaces and line breaks): {allowlist}"
    )
}

fn request_body(config: &VisionConfig, data_uri: &str, allowlist: &str) -> serde_json::Value {
    json!({
        "model": config.model,
        "temperature": 0.0,
        "max_tokens": config.max_tokens,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": user_prompt(allowlist) },
                    { "type": "image_url", "image_url": { "url": data_uri, "detail": "high" } }
                ]
            }
        ]
    })
}

/// Encode a bitmap as a `data:image/png;base64,...` URI.
pub fn encode_bitmap(bitmap: &Bitmap) -> Result<String, AdapterError> {
    let png = bitmap
        .to_png()
        .map_err(|e| AdapterError::Failed(format!("PNG encoding failed: {e}")))?;
    let b64 = STANDARD.encode(&png);
    debug!("Encoded image → {} bytes base64", b64.len());
    Ok(format!("data:image/png;base64,{b64}"))
}

/// Drop every character that is neither whitespace nor in `allowlist`.
pub fn filter_allowlist(text: &str, allowlist: &str) -> String {
    text.chars()
        .filter(|c| c.is_whitespace() || allowlist.contains(*c))
        .collect()
}

/// Vision models report no per-word confidence; estimate it from output
/// length, with a bonus when the text looks like a recipe.
fn heuristic_confidence(text: &str) -> f32 {
    let len = text.trim().chars().count();
    if len == 0 {
        return 0.0;
    }
    let base: f32 = match len {
        0..=49 => 0.2,
        50..=199 => 0.4,
        200..=499 => 0.6,
        _ => 0.8,
    };

    let lower = text.to_lowercase();
    let mut bonus = 0.0;
    if lower.contains("ingredients") || lower.contains("method") || lower.contains("directions") {
        bonus += 0.05;
    }
    if text.chars().any(|c| c.is_ascii_digit() || "½⅓⅔¼¾⅛".contains(c)) {
        bonus += 0.05;
    }
    (base + bonus).min(0.95)
}
