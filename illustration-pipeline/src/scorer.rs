use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::limiter::RateLimiter;
use crate::reasoning::{ReasoningError, ReasoningRequest, ReasoningService, ReasoningTask};
use crate::retry::{retry, RetryPolicy};
use crate::types::{Article, AssessmentFailure, RelevanceAssessment};

const MAX_ARTICLE_CHARS: usize = 2000;
const MAX_RATIONALE_CHARS: usize = 2000;

const RUBRIC: &str = "You evaluate news articles for their potential as sermon illustrations. \
Judge the article on: human interest (a compelling story about real people), \
moral or ethical dimension, universal human experience, redemption or hope, \
and how readily it applies to a sermon point. Give a single overall score and a \
short rationale naming the strongest of these qualities.";

/// Inclusive score range the reasoning service must answer within.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreScale {
    pub min: f64,
    pub max: f64,
}

impl Default for ScoreScale {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl ScoreScale {
    pub fn contains(&self, score: f64) -> bool {
        score.is_finite() && score >= self.min && score <= self.max
    }
}

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub timeout: Duration,
    pub max_response_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_response_bytes: 64 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// A rate-limited, time-boxed, retried call to the reasoning service. Shared by
/// the scorer and the matcher.
pub(crate) async fn call_reasoner(
    reasoner: &dyn ReasoningService,
    limiter: &RateLimiter,
    settings: &CallSettings,
    request: &ReasoningRequest,
) -> Result<Value, AssessmentFailure> {
    let operation = match request.task {
        ReasoningTask::RelevanceAssessment => "relevance assessment",
        ReasoningTask::ThemeMatching => "theme matching",
    };

    let (result, attempts) = retry(&settings.retry, operation, |_| async {
        limiter
            .acquire()
            .await
            .map_err(|saturated| ReasoningError::RateLimited(saturated.to_string()))?;
        match tokio::time::timeout(settings.timeout, reasoner.complete(request)).await {
            Ok(reply) => reply,
            Err(_) => Err(ReasoningError::Timeout(settings.timeout)),
        }
    })
    .await;

    let value = result.map_err(|e| e.into_failure(attempts))?;
    let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(usize::MAX);
    if size > settings.max_response_bytes {
        return Err(AssessmentFailure::invalid(format!(
            "reply of {size} bytes exceeds limit of {}",
            settings.max_response_bytes
        )));
    }
    Ok(value)
}

pub struct RelevanceScorer {
    reasoner: Arc<dyn ReasoningService>,
    limiter: Arc<RateLimiter>,
    scale: ScoreScale,
    min_content_chars: usize,
    call: CallSettings,
}

impl RelevanceScorer {
    pub fn new(
        reasoner: Arc<dyn ReasoningService>,
        limiter: Arc<RateLimiter>,
        scale: ScoreScale,
        min_content_chars: usize,
        call: CallSettings,
    ) -> Self {
        Self {
            reasoner,
            limiter,
            scale,
            min_content_chars,
            call,
        }
    }

    pub fn scale(&self) -> ScoreScale {
        self.scale
    }

    /// Articles too short to judge are never sent.
    pub fn is_assessable(&self, article: &Article) -> bool {
        article.content_chars() >= self.min_content_chars
    }

    pub async fn assess(&self, article: &Article) -> Result<RelevanceAssessment, AssessmentFailure> {
        let request = self.request_for(article);
        let reply = call_reasoner(self.reasoner.as_ref(), &self.limiter, &self.call, &request).await;

        let assessment = reply.and_then(|value| self.validate(article, &value));
        match &assessment {
            Ok(a) => debug!(fingerprint = article.fingerprint.short(), score = a.score, "assessed"),
            Err(e) => warn!(fingerprint = article.fingerprint.short(), kind = ?e.kind, error = %e, "assessment failed"),
        }
        assessment
    }

    fn request_for(&self, article: &Article) -> ReasoningRequest {
        let text: String = article.reasoning_text().chars().take(MAX_ARTICLE_CHARS).collect();
        ReasoningRequest {
            task: ReasoningTask::RelevanceAssessment,
            instructions: format!(
                "{RUBRIC} Scores range from {} (no illustrative value) to {} (exceptional).",
                self.scale.min, self.scale.max
            ),
            article_text: format!("Discipline: {}\n\n{}", article.discipline, text),
            output_schema: json!({
                "type": "object",
                "required": ["score", "rationale"],
                "properties": {
                    "score": { "type": "number", "minimum": self.scale.min, "maximum": self.scale.max },
                    "rationale": { "type": "string" }
                }
            }),
        }
    }

    fn validate(&self, article: &Article, value: &Value) -> Result<RelevanceAssessment, AssessmentFailure> {
        let score = value
            .get("score")
            .and_then(Value::as_f64)
            .ok_or_else(|| AssessmentFailure::invalid("reply has no numeric score"))?;
        if !self.scale.contains(score) {
            return Err(AssessmentFailure::invalid(format!(
                "score {score} outside [{}, {}]",
                self.scale.min, self.scale.max
            )));
        }

        let rationale = match value.get("rationale") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.chars().take(MAX_RATIONALE_CHARS).collect(),
            Some(_) => return Err(AssessmentFailure::invalid("rationale is not a string")),
        };

        Ok(RelevanceAssessment {
            fingerprint: article.fingerprint.clone(),
            score,
            rationale,
            assessed_at: Utc::now(),
            assessor_model: self.reasoner.model_id(),
        })
    }
}
