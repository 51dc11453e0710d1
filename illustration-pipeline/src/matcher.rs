use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::limiter::RateLimiter;
use crate::reasoning::{ReasoningRequest, ReasoningService, ReasoningTask};
use crate::scorer::{call_reasoner, CallSettings};
use crate::types::{Article, MatchFailure, RelevanceAssessment, Theme, ThemeMatch, VocabularyViolation};

const MAX_ARTICLE_CHARS: usize = 2000;

/// The closed set of themes articles may be tagged with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeVocabulary(BTreeSet<Theme>);

impl ThemeVocabulary {
    pub fn new(themes: impl IntoIterator<Item = Theme>) -> Self {
        Self(themes.into_iter().collect())
    }

    pub fn all() -> Self {
        Self::new(Theme::ALL)
    }

    pub fn contains(&self, theme: Theme) -> bool {
        self.0.contains(&theme)
    }

    /// Maps a returned label onto the vocabulary, if it belongs there.
    pub fn resolve(&self, label: &str) -> Option<Theme> {
        label.parse::<Theme>().ok().filter(|t| self.contains(*t))
    }

    pub fn iter(&self) -> impl Iterator<Item = Theme> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Accepted matches plus what was rejected on the way.
#[derive(Debug, Clone, Default)]
pub struct ThemeMatchReport {
    pub matches: Vec<ThemeMatch>,
    pub violations: Vec<VocabularyViolation>,
    pub below_confidence: usize,
    pub invalid_entries: usize,
}

pub struct ThemeMatcher {
    reasoner: Arc<dyn ReasoningService>,
    limiter: Arc<RateLimiter>,
    vocabulary: ThemeVocabulary,
    relevance_threshold: f64,
    min_confidence: f64,
    call: CallSettings,
}

impl ThemeMatcher {
    pub fn new(
        reasoner: Arc<dyn ReasoningService>,
        limiter: Arc<RateLimiter>,
        vocabulary: ThemeVocabulary,
        relevance_threshold: f64,
        min_confidence: f64,
        call: CallSettings,
    ) -> Self {
        Self {
            reasoner,
            limiter,
            vocabulary,
            relevance_threshold,
            min_confidence,
            call,
        }
    }

    pub fn vocabulary(&self) -> &ThemeVocabulary {
        &self.vocabulary
    }

    pub fn should_match(&self, assessment: &RelevanceAssessment) -> bool {
        assessment.score >= self.relevance_threshold
    }

    pub async fn match_themes(
        &self,
        article: &Article,
        assessment: &RelevanceAssessment,
    ) -> Result<ThemeMatchReport, MatchFailure> {
        if !self.should_match(assessment) {
            return Ok(ThemeMatchReport::default());
        }

        let request = self.request_for(article, assessment);
        let value = call_reasoner(self.reasoner.as_ref(), &self.limiter, &self.call, &request)
            .await
            .map_err(|e| {
                warn!(fingerprint = article.fingerprint.short(), kind = ?e.kind, error = %e, "theme matching failed");
                e
            })?;

        let report = self.interpret(article, &value)?;
        debug!(
            fingerprint = article.fingerprint.short(),
            matched = report.matches.len(),
            violations = report.violations.len(),
            below_confidence = report.below_confidence,
            "themes matched"
        );
        Ok(report)
    }

    fn request_for(&self, article: &Article, assessment: &RelevanceAssessment) -> ReasoningRequest {
        let themes: Vec<String> = self
            .vocabulary
            .iter()
            .map(|t| format!("- {}: {}", t.as_str(), t.description()))
            .collect();
        let text: String = article.reasoning_text().chars().take(MAX_ARTICLE_CHARS).collect();

        ReasoningRequest {
            task: ReasoningTask::ThemeMatching,
            instructions: format!(
                "Tag the article with the sermon themes it could illustrate. Use only these labels:\n{}\n\
                 Give each chosen theme a confidence between 0 and 1. Return an empty list if none apply.",
                themes.join("\n")
            ),
            article_text: format!(
                "Relevance rationale: {}\n\n{}",
                assessment.rationale, text
            ),
            output_schema: json!({
                "type": "object",
                "required": ["themes"],
                "properties": {
                    "themes": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["theme", "confidence"],
                            "properties": {
                                "theme": { "type": "string", "enum": self.vocabulary.iter().map(|t| t.as_str()).collect::<Vec<_>>() },
                                "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
                            }
                        }
                    }
                }
            }),
        }
    }

    fn interpret(&self, article: &Article, value: &Value) -> Result<ThemeMatchReport, MatchFailure> {
        let entries = value
            .get("themes")
            .and_then(Value::as_array)
            .ok_or_else(|| MatchFailure::invalid("reply has no themes array"))?;

        let mut report = ThemeMatchReport::default();
        let mut best: BTreeMap<Theme, f64> = BTreeMap::new();

        for entry in entries {
            let (Some(label), Some(confidence)) = (
                entry.get("theme").and_then(Value::as_str),
                entry.get("confidence").and_then(Value::as_f64),
            ) else {
                report.invalid_entries += 1;
                warn!(fingerprint = article.fingerprint.short(), %entry, "theme entry missing label or confidence");
                continue;
            };

            let Some(theme) = self.vocabulary.resolve(label) else {
                warn!(fingerprint = article.fingerprint.short(), label, "vocabulary violation");
                report.violations.push(VocabularyViolation {
                    fingerprint: article.fingerprint.clone(),
                    label: label.to_string(),
                });
                continue;
            };

            if !(0.0..=1.0).contains(&confidence) {
                report.invalid_entries += 1;
                warn!(fingerprint = article.fingerprint.short(), label, confidence, "confidence outside [0, 1]");
                continue;
            }

            if confidence < self.min_confidence {
                report.below_confidence += 1;
                continue;
            }

            let slot = best.entry(theme).or_insert(confidence);
            *slot = slot.max(confidence);
        }

        let matched_at = Utc::now();
        report.matches = best
            .into_iter()
            .map(|(theme, confidence)| ThemeMatch {
                fingerprint: article.fingerprint.clone(),
                theme,
                confidence,
                matched_at,
            })
            .collect();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_resolves_case_insensitively() {
        let vocabulary = ThemeVocabulary::new([Theme::Grace, Theme::Hope]);
        assert_eq!(vocabulary.resolve("Grace"), Some(Theme::Grace));
        assert_eq!(vocabulary.resolve(" HOPE "), Some(Theme::Hope));
        assert_eq!(vocabulary.resolve("mercy"), None);
        assert_eq!(vocabulary.resolve("serendipity"), None);
    }
}
