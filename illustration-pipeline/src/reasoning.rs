use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{ReasoningConfig, ReasoningProvider};
use crate::retry::Retryable;
use crate::types::{AssessmentFailure, AssessmentFailureKind, ConfigError, Theme};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningTask {
    RelevanceAssessment,
    ThemeMatching,
}

/// One structured-output call: instructions, the article text, and the JSON
/// shape the reply must take.
#[derive(Debug, Clone, Serialize)]
pub struct ReasoningRequest {
    pub task: ReasoningTask,
    pub instructions: String,
    pub article_text: String,
    pub output_schema: Value,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReasoningError {
    #[error("reasoning service unavailable: {0}")]
    Unavailable(String),

    #[error("reasoning service rate limited: {0}")]
    RateLimited(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("invalid reply: {0}")]
    Invalid(String),
}

impl ReasoningError {
    pub fn kind(&self) -> AssessmentFailureKind {
        match self {
            ReasoningError::Unavailable(_) => AssessmentFailureKind::ServiceUnavailable,
            ReasoningError::RateLimited(_) => AssessmentFailureKind::RateLimited,
            ReasoningError::Timeout(_) => AssessmentFailureKind::Timeout,
            ReasoningError::Invalid(_) => AssessmentFailureKind::InvalidResponse,
        }
    }

    pub fn into_failure(self, attempts: u32) -> AssessmentFailure {
        AssessmentFailure {
            kind: self.kind(),
            attempts,
            message: self.to_string(),
        }
    }
}

impl Retryable for ReasoningError {
    fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// External language-reasoning capability used for scoring and theme matching.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Recorded on every assessment this service produces.
    fn model_id(&self) -> String;

    async fn complete(&self, request: &ReasoningRequest) -> Result<Value, ReasoningError>;
}

pub fn build_reasoner(config: &ReasoningConfig) -> Result<Arc<dyn ReasoningService>, ConfigError> {
    match config.provider {
        ReasoningProvider::Mock => Ok(Arc::new(MockReasoner::new())),
        ReasoningProvider::Claude => {
            let reasoner = ClaudeReasoner::new(config.api_key()?, &config.model)
                .with_base_url(&config.base_url)
                .with_timeout(config.timeout())
                .with_max_response_bytes(config.max_response_bytes);
            Ok(Arc::new(reasoner))
        }
    }
}

/// Anthropic Messages API.
pub struct ClaudeReasoner {
    api_key: String,
    model: String,
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    max_response_bytes: usize,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: String,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl ClaudeReasoner {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            http: reqwest::Client::new(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            timeout: Duration::from_secs(60),
            max_response_bytes: 64 * 1024,
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }

    fn headers(&self) -> Result<HeaderMap, ReasoningError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| ReasoningError::Unavailable("API key is not a valid header value".to_string()))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn transport_error(&self, e: reqwest::Error) -> ReasoningError {
        if e.is_timeout() {
            ReasoningError::Timeout(self.timeout)
        } else {
            ReasoningError::Unavailable(e.to_string())
        }
    }

    /// Reads the body chunk by chunk, giving up as soon as it passes
    /// `max_response_bytes`.
    async fn read_capped(&self, mut response: Response) -> Result<Vec<u8>, ReasoningError> {
        if let Some(length) = response.content_length() {
            if length as usize > self.max_response_bytes {
                return Err(ReasoningError::Invalid(format!(
                    "declared reply of {length} bytes exceeds limit of {}",
                    self.max_response_bytes
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(e))? {
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(ReasoningError::Invalid(format!(
                    "reply exceeds limit of {} bytes",
                    self.max_response_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn classify_status(status: StatusCode, body: &str) -> ReasoningError {
        let message = format!("Claude API error ({status}): {}", body.chars().take(200).collect::<String>());
        match status.as_u16() {
            429 => ReasoningError::RateLimited(message),
            401 | 403 | 408 | 500..=599 => ReasoningError::Unavailable(message),
            _ => ReasoningError::Invalid(message),
        }
    }
}

#[async_trait]
impl ReasoningService for ClaudeReasoner {
    fn model_id(&self) -> String {
        self.model.clone()
    }

    async fn complete(&self, request: &ReasoningRequest) -> Result<Value, ReasoningError> {
        let url = format!("{}/messages", self.base_url);
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: format!(
                "{}\n\nRespond with JSON matching this schema:\n{}\nOnly return the JSON, no other text.",
                request.instructions, request.output_schema
            ),
            messages: vec![WireMessage {
                role: "user",
                content: &request.article_text,
            }],
        };

        debug!(model = %self.model, task = ?request.task, "Claude request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = self.read_capped(response).await.unwrap_or_default();
            return Err(Self::classify_status(status, &String::from_utf8_lossy(&body)));
        }

        let body = self.read_capped(response).await?;
        let parsed: MessagesResponse =
            serde_json::from_slice(&body).map_err(|e| ReasoningError::Invalid(format!("unexpected envelope: {e}")))?;
        let reply: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();

        extract_json(&reply)
    }
}

/// Pulls the JSON object out of a model reply, tolerating Markdown fences and
/// chatter around it.
pub fn extract_json(reply: &str) -> Result<Value, ReasoningError> {
    let mut text = reply.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        text = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }

    if let Ok(value) = serde_json::from_str(text) {
        return Ok(value);
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&text[start..=end])
            .map_err(|e| ReasoningError::Invalid(format!("reply is not JSON: {e}"))),
        _ => Err(ReasoningError::Invalid("reply contains no JSON object".to_string())),
    }
}

/// Offline stand-in: scores and tags by keyword cues. Deterministic.
#[derive(Debug, Clone, Default)]
pub struct MockReasoner;

const MORAL_CUES: &[&str] = &[
    "forgive", "rescue", "sacrific", "hope", "volunteer", "kindness", "courage", "redeem", "reconcil",
    "stranger", "generous", "neighbour", "neighbor", "grief", "recover", "second chance", "community",
    "faith", "love", "mercy", "heal", "persever", "serve", "justice",
];

fn theme_cues(theme: Theme) -> &'static [&'static str] {
    match theme {
        Theme::Grace => &["grace", "undeserved", "unearned"],
        Theme::Redemption => &["redeem", "redemption", "second chance"],
        Theme::Hope => &["hope", "optimis"],
        Theme::Love => &["love", "compassion", "kindness"],
        Theme::Forgiveness => &["forgive", "pardon", "reconcil"],
        Theme::Faith => &["faith", "trust", "belief"],
        Theme::Justice => &["justice", "fairness", "wrongful"],
        Theme::Mercy => &["mercy", "leniency", "clemency"],
        Theme::Healing => &["heal", "recover", "therapy"],
        Theme::Perseverance => &["persever", "endur", "never gave up"],
        Theme::Community => &["community", "neighbour", "neighbor", "together"],
        Theme::Service => &["volunteer", "serve", "service"],
        Theme::Stewardship => &["steward", "conservation", "responsib"],
        Theme::Wisdom => &["wisdom", "wise", "insight"],
        Theme::Transformation => &["transform", "turned his life", "turned her life", "changed"],
        Theme::Sacrifice => &["sacrific", "gave up", "donat"],
        Theme::Restoration => &["restor", "rebuil", "renew"],
        Theme::Unity => &["unity", "united", "across the divide"],
        Theme::Purpose => &["purpose", "calling", "meaning"],
        Theme::Provision => &["provid", "provision", "food bank"],
    }
}

impl MockReasoner {
    pub fn new() -> Self {
        Self
    }

    fn assess(&self, request: &ReasoningRequest) -> Value {
        let text = request.article_text.to_lowercase();
        let hits: Vec<&str> = MORAL_CUES.iter().copied().filter(|cue| text.contains(cue)).collect();
        let fraction = (hits.len() as f64 * 0.15).min(1.0);

        let min = schema_bound(&request.output_schema, "minimum").unwrap_or(0.0);
        let max = schema_bound(&request.output_schema, "maximum").unwrap_or(1.0);
        let rationale = if hits.is_empty() {
            "no narrative or moral cues found".to_string()
        } else {
            format!("cues: {}", hits.join(", "))
        };
        json!({ "score": min + fraction * (max - min), "rationale": rationale })
    }

    fn match_themes(&self, request: &ReasoningRequest) -> Value {
        let text = request.article_text.to_lowercase();
        let themes: Vec<Value> = Theme::ALL
            .into_iter()
            .filter_map(|theme| {
                let hits = theme_cues(theme).iter().filter(|cue| text.contains(*cue)).count();
                (hits > 0).then(|| {
                    json!({ "theme": theme.as_str(), "confidence": (0.5 + 0.15 * hits as f64).min(0.95) })
                })
            })
            .collect();
        json!({ "themes": themes })
    }
}

fn schema_bound(schema: &Value, bound: &str) -> Option<f64> {
    schema.pointer(&format!("/properties/score/{bound}")).and_then(Value::as_f64)
}

#[async_trait]
impl ReasoningService for MockReasoner {
    fn model_id(&self) -> String {
        "mock-keyword-v1".to_string()
    }

    async fn complete(&self, request: &ReasoningRequest) -> Result<Value, ReasoningError> {
        Ok(match request.task {
            ReasoningTask::RelevanceAssessment => self.assess(request),
            ReasoningTask::ThemeMatching => self.match_themes(request),
        })
    }
}
