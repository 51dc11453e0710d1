use std::path::PathBuf;

pub use interfaces::defs::*;
pub use interfaces::report::*;

use crate::retry::Retryable;

/// Transport-level failure for a single fetch attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct FetchError {
    pub kind: FetchFailureKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(FetchFailureKind::Unreachable, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FetchFailureKind::MalformedResponse, message)
    }
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Terminal fetch outcome for a source after retries.
#[derive(Debug, Clone, thiserror::Error)]
#[error("fetching {source_id} failed after {attempts} attempt(s) ({kind:?}): {message}")]
pub struct FetchFailure {
    pub source_id: SourceId,
    pub kind: FetchFailureKind,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?} after {attempts} attempt(s): {message}")]
pub struct AssessmentFailure {
    pub kind: AssessmentFailureKind,
    pub attempts: u32,
    pub message: String,
}

impl AssessmentFailure {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            kind: AssessmentFailureKind::InvalidResponse,
            attempts: 1,
            message: message.into(),
        }
    }
}

/// Theme matching fails the same ways an assessment does.
pub type MatchFailure = AssessmentFailure;

/// A theme label the reasoning service returned that is not in the configured vocabulary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("theme label {label:?} outside the vocabulary (article {fingerprint})")]
pub struct VocabularyViolation {
    pub fingerprint: Fingerprint,
    pub label: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate source id: {0}")]
    DuplicateSource(SourceId),

    #[error("source {source_id}: {reason}")]
    InvalidSource { source_id: SourceId, reason: String },

    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("environment variable {0} is not set")]
    MissingEnv(String),
}

impl ConfigError {
    pub fn setting(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageFailure),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
