//! Run report types. A `PipelineRun` is the only externally observable summary
//! of one pipeline invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defs::{Fingerprint, Sighting, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Fetching,
    Normalizing,
    Deduplicating,
    Scoring,
    Matching,
    Completed,
    Failed,
}

impl RunPhase {
    /// Legal forward transitions. `Failed` is reachable from every non-terminal phase.
    pub fn can_advance_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Fetching)
            | (Fetching, Normalizing)
            | (Normalizing, Deduplicating)
            | (Deduplicating, Scoring)
            | (Scoring, Matching)
            | (Matching, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailureKind {
    Unreachable,
    Timeout,
    MalformedResponse,
    RateLimited,
}

impl FetchFailureKind {
    /// `MalformedResponse` is a source-quality defect and is never retried.
    pub fn is_transient(self) -> bool {
        !matches!(self, FetchFailureKind::MalformedResponse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentFailureKind {
    ServiceUnavailable,
    RateLimited,
    Timeout,
    InvalidResponse,
}

impl AssessmentFailureKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, AssessmentFailureKind::InvalidResponse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    #[error("no usable title or body")]
    EmptyContent,
    #[error("no canonical url and no title to derive an identity from")]
    MissingIdentity,
    #[error("published too long ago")]
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceStatus {
    Succeeded,
    Failed {
        kind: FetchFailureKind,
        attempts: u32,
        message: String,
    },
    /// Not finished before the run's wall-clock budget ran out.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_id: SourceId,
    pub status: SourceStatus,
    pub attempts: u32,
    pub items_fetched: usize,
    /// Items that normalized into an article.
    pub success_count: usize,
    /// Items dropped at normalization, plus one when the fetch itself failed.
    pub failure_count: usize,
    pub new_articles: usize,
    pub seen_unchanged: usize,
    pub seen_updated: usize,
    pub error_summary: Option<String>,
}

impl SourceOutcome {
    pub fn pending(source_id: SourceId) -> Self {
        Self {
            source_id,
            status: SourceStatus::Skipped,
            attempts: 0,
            items_fetched: 0,
            success_count: 0,
            failure_count: 0,
            new_articles: 0,
            seen_unchanged: 0,
            seen_updated: 0,
            error_summary: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotAttemptedReason {
    /// Relevance score under the configured threshold.
    BelowThreshold,
    /// No relevance assessment exists to gate on.
    NoAssessment,
    /// Article text shorter than the minimum worth sending out.
    TooShort,
    /// The run's wall-clock budget ran out first.
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AssessmentStatus {
    Assessed { score: f64 },
    NotAttempted { reason: NotAttemptedReason },
    Failed { kind: AssessmentFailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MatchStatus {
    Matched { count: usize },
    NoMatches,
    NotAttempted { reason: NotAttemptedReason },
    Failed { kind: AssessmentFailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleOutcome {
    pub fingerprint: Fingerprint,
    pub source_id: SourceId,
    pub title: String,
    pub sighting: Sighting,
    pub assessment: AssessmentStatus,
    pub themes: MatchStatus,
    pub vocabulary_violations: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub items_fetched: usize,
    pub normalized: usize,
    pub dropped_empty_content: usize,
    pub dropped_missing_identity: usize,
    pub dropped_stale: usize,
    pub new_articles: usize,
    pub seen_unchanged: usize,
    pub seen_updated: usize,
    pub reprocessed: usize,
    pub assessed: usize,
    pub assessment_failed: usize,
    pub assessment_not_attempted: usize,
    pub matched_articles: usize,
    pub no_matches: usize,
    pub match_not_attempted: usize,
    pub match_failed: usize,
    pub theme_matches_stored: usize,
    pub vocabulary_violations: usize,
}

impl StageCounts {
    pub fn record_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::EmptyContent => self.dropped_empty_content += 1,
            DropReason::MissingIdentity => self.dropped_missing_identity += 1,
            DropReason::Stale => self.dropped_stale += 1,
        }
    }
}

/// Append-only audit record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: RunPhase,
    pub status: RunStatus,
    pub budget_exhausted: bool,
    pub sources: Vec<SourceOutcome>,
    pub stages: StageCounts,
    pub articles: Vec<ArticleOutcome>,
}

impl PipelineRun {
    pub fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: None,
            phase: RunPhase::Idle,
            status: RunStatus::Completed,
            budget_exhausted: false,
            sources: Vec::new(),
            stages: StageCounts::default(),
            articles: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, RunStatus::Completed)
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceOutcome> {
        self.sources.iter().find(|s| &s.source_id == id)
    }

    pub fn article(&self, fingerprint: &Fingerprint) -> Option<&ArticleOutcome> {
        self.articles.iter().find(|a| &a.fingerprint == fingerprint)
    }
}
