use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::report::PipelineRun;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} label: {label:?}")]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub label: String,
}

/// Subject area a source reports on. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    Politics,
    Economics,
    Tech,
    Psychology,
    Medicine,
    Science,
    Culture,
}

impl Discipline {
    pub const ALL: [Discipline; 7] = [
        Discipline::Politics,
        Discipline::Economics,
        Discipline::Tech,
        Discipline::Psychology,
        Discipline::Medicine,
        Discipline::Science,
        Discipline::Culture,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Discipline::Politics => "politics",
            Discipline::Economics => "economics",
            Discipline::Tech => "tech",
            Discipline::Psychology => "psychology",
            Discipline::Medicine => "medicine",
            Discipline::Science => "science",
            Discipline::Culture => "culture",
        }
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Discipline {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Discipline::ALL
            .into_iter()
            .find(|d| d.as_str() == wanted)
            .ok_or_else(|| UnknownLabel {
                kind: "discipline",
                label: s.to_string(),
            })
    }
}

/// Thematic label an article can be tagged with.
///
/// The enum is the universe of themes the pipeline knows about; the configured
/// vocabulary selects a subset of it. Anything a reasoning service returns that
/// does not parse into one of these variants is a vocabulary violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Grace,
    Redemption,
    Hope,
    Love,
    Forgiveness,
    Faith,
    Justice,
    Mercy,
    Healing,
    Perseverance,
    Community,
    Service,
    Stewardship,
    Wisdom,
    Transformation,
    Sacrifice,
    Restoration,
    Unity,
    Purpose,
    Provision,
}

impl Theme {
    pub const ALL: [Theme; 20] = [
        Theme::Grace,
        Theme::Redemption,
        Theme::Hope,
        Theme::Love,
        Theme::Forgiveness,
        Theme::Faith,
        Theme::Justice,
        Theme::Mercy,
        Theme::Healing,
        Theme::Perseverance,
        Theme::Community,
        Theme::Service,
        Theme::Stewardship,
        Theme::Wisdom,
        Theme::Transformation,
        Theme::Sacrifice,
        Theme::Restoration,
        Theme::Unity,
        Theme::Purpose,
        Theme::Provision,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Grace => "grace",
            Theme::Redemption => "redemption",
            Theme::Hope => "hope",
            Theme::Love => "love",
            Theme::Forgiveness => "forgiveness",
            Theme::Faith => "faith",
            Theme::Justice => "justice",
            Theme::Mercy => "mercy",
            Theme::Healing => "healing",
            Theme::Perseverance => "perseverance",
            Theme::Community => "community",
            Theme::Service => "service",
            Theme::Stewardship => "stewardship",
            Theme::Wisdom => "wisdom",
            Theme::Transformation => "transformation",
            Theme::Sacrifice => "sacrifice",
            Theme::Restoration => "restoration",
            Theme::Unity => "unity",
            Theme::Purpose => "purpose",
            Theme::Provision => "provision",
        }
    }

    /// One-line gloss handed to the reasoning service alongside the label.
    pub fn description(&self) -> &'static str {
        match self {
            Theme::Grace => "unmerited favor and forgiveness",
            Theme::Redemption => "being rescued or bought back from a fallen state",
            Theme::Hope => "expectation of good, trust in promises",
            Theme::Love => "sacrificial love, compassion",
            Theme::Forgiveness => "pardoning offenses, reconciliation",
            Theme::Faith => "trust, belief without seeing",
            Theme::Justice => "fairness, righteousness, moral rightness",
            Theme::Mercy => "compassion and kindness to the suffering",
            Theme::Healing => "physical, emotional, or spiritual restoration",
            Theme::Perseverance => "endurance through trials, steadfastness",
            Theme::Community => "fellowship and togetherness",
            Theme::Service => "serving others, humility, selflessness",
            Theme::Stewardship => "responsible management of what is entrusted",
            Theme::Wisdom => "insight, discernment, understanding",
            Theme::Transformation => "change, renewal, becoming new",
            Theme::Sacrifice => "giving something up for a greater good",
            Theme::Restoration => "return to a whole state, renewal",
            Theme::Unity => "oneness, harmony, working together",
            Theme::Purpose => "calling, meaning, intentionality",
            Theme::Provision => "needs being supplied",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Theme {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Theme::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| UnknownLabel {
                kind: "theme",
                label: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A configured feed. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub discipline: Discipline,
    pub endpoint: String,
    pub fetch_interval: Duration,
    pub enabled: bool,
    pub reprocess_on_change: bool,
}

/// Entry fields as they came off the wire; any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPayload {
    pub guid: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub body: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub source_id: SourceId,
    pub fetched_at: DateTime<Utc>,
    pub payload: RawPayload,
}

#[derive(Debug, Clone)]
pub struct RawItemBatch {
    pub source_id: SourceId,
    pub fetched_at: DateTime<Utc>,
    pub items: Vec<RawItem>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 chars, for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a fingerprint was derived from.
///
/// `TitleSourceDate` is the weaker fallback: two different posts with the same
/// title on the same day from one source collide, and mirrors of the same post
/// under different source ids do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintBasis {
    CanonicalUrl,
    TitleSourceDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// Stored, not yet through scoring and matching.
    Pending,
    /// Went through the pipeline once; immutable unless its source reprocesses on change.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub fingerprint: Fingerprint,
    pub basis: FingerprintBasis,
    pub source_id: SourceId,
    pub discipline: Discipline,
    pub title: String,
    pub summary: String,
    pub body: String,
    pub canonical_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub content_hash: String,
    pub state: ProcessingState,
}

impl Article {
    /// Text handed to the reasoning service.
    pub fn reasoning_text(&self) -> String {
        if self.body.is_empty() || self.body == self.summary {
            format!("{}\n\n{}", self.title, self.summary)
        } else {
            format!("{}\n\n{}\n\n{}", self.title, self.summary, self.body)
        }
    }

    /// Character count of the richest text field.
    pub fn content_chars(&self) -> usize {
        self.body.chars().count().max(self.summary.chars().count())
    }
}

/// The slice of a stored article the deduplicator needs.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownArticle {
    pub fingerprint: Fingerprint,
    pub content_hash: String,
    pub state: ProcessingState,
}

/// Deduplicator verdict for one sighting of an article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sighting {
    New,
    SeenUnchanged,
    SeenUpdated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceAssessment {
    pub fingerprint: Fingerprint,
    pub score: f64,
    pub rationale: String,
    pub assessed_at: DateTime<Utc>,
    pub assessor_model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeMatch {
    pub fingerprint: Fingerprint,
    pub theme: Theme,
    pub confidence: f64,
    pub matched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("storage failure during {operation}: {message}")]
pub struct StorageFailure {
    pub operation: &'static str,
    pub message: String,
}

impl StorageFailure {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Fingerprint lookup the deduplicator runs against.
#[async_trait]
pub trait ArticleIndex: Send + Sync {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<KnownArticle>, StorageFailure>;
}

/// Storage collaborator. Every write is idempotent on retry.
#[async_trait]
pub trait ArticleStore: ArticleIndex {
    /// Insert or update keyed by fingerprint. `first_seen_at` of an existing row is kept.
    async fn upsert_article(&self, article: &Article) -> Result<(), StorageFailure>;

    /// Bump `last_seen_at` of an existing article; nothing else changes.
    async fn touch_article(&self, fingerprint: &Fingerprint, seen_at: DateTime<Utc>) -> Result<(), StorageFailure>;

    /// Keyed by (fingerprint, assessor model): a new model adds a row, the same model replaces nothing.
    async fn append_assessment(&self, assessment: &RelevanceAssessment) -> Result<(), StorageFailure>;

    /// Keyed by (fingerprint, theme).
    async fn append_theme_matches(&self, fingerprint: &Fingerprint, matches: &[ThemeMatch]) -> Result<(), StorageFailure>;

    async fn append_run(&self, run: &PipelineRun) -> Result<(), StorageFailure>;
}
