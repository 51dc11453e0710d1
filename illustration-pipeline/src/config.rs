use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::SourceRegistry;
use crate::retry::RetryPolicy;
use crate::types::{ConfigError, Discipline, Source, SourceId, Theme};

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Everything `illustrate` needs to run, loaded from one TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSettings,
    pub fetch: FetchConfig,
    pub retry: RetryPolicy,
    pub reasoning: ReasoningConfig,
    pub storage: StorageConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Minimum relevance score, on the reasoning score scale, that unlocks theme matching.
    pub relevance_threshold: f64,
    pub theme_min_confidence: f64,
    pub min_content_chars: usize,
    /// Entries published longer ago than this are dropped. 0 keeps everything.
    pub max_article_age_days: u32,
    pub run_budget_secs: u64,
    pub scoring_concurrency: usize,
    /// Active theme vocabulary. Empty selects every known theme.
    pub themes: Vec<Theme>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            relevance_threshold: 0.5,
            theme_min_confidence: 0.3,
            min_content_chars: 100,
            max_article_age_days: 30,
            run_budget_secs: 600,
            scoring_concurrency: 4,
            themes: Vec::new(),
        }
    }
}

impl PipelineSettings {
    pub fn vocabulary(&self) -> Vec<Theme> {
        if self.themes.is_empty() {
            Theme::ALL.to_vec()
        } else {
            self.themes.clone()
        }
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.run_budget_secs)
    }

    pub fn max_article_age(&self) -> Option<chrono::Duration> {
        (self.max_article_age_days > 0).then(|| chrono::Duration::days(i64::from(self.max_article_age_days)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_payload_bytes: usize,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "SermonIllustrate/1.0".to_string(),
            timeout_secs: 30,
            max_payload_bytes: 10 * 1024 * 1024,
            max_redirects: 5,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningProvider {
    Claude,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub provider: ReasoningProvider,
    pub model: String,
    pub api_key_env: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub requests_per_minute: u32,
    pub max_queue_depth: usize,
    pub max_response_bytes: usize,
    pub score_min: f64,
    pub score_max: f64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: ReasoningProvider::Mock,
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            timeout_secs: 60,
            requests_per_minute: 50,
            max_queue_depth: 64,
            max_response_bytes: 64 * 1024,
            score_min: 0.0,
            score_max: 1.0,
        }
    }
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reads the credential from the configured environment variable.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnv(self.api_key_env.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory` keeps everything in process; anything else is a sqlx SQLite URL.
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://illustrations.db?mode=rwc".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn is_memory(&self) -> bool {
        self.database_url.eq_ignore_ascii_case("memory")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub discipline: Discipline,
    #[serde(default = "default_fetch_interval_secs")]
    pub fetch_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub reprocess_on_change: bool,
}

fn default_fetch_interval_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl From<&SourceConfig> for Source {
    fn from(config: &SourceConfig) -> Self {
        Source {
            id: SourceId::new(config.id.trim()),
            name: config.name.clone(),
            discipline: config.discipline,
            endpoint: config.endpoint.trim().to_string(),
            fetch_interval: Duration::from_secs(config.fetch_interval_secs),
            enabled: config.enabled,
            reprocess_on_change: config.reprocess_on_change,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies `DATABASE_URL` on top of the file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.trim().is_empty() {
                self.storage.database_url = url;
            }
        }
    }

    pub fn source_list(&self) -> Vec<Source> {
        self.sources.iter().map(Source::from).collect()
    }

    pub fn registry(&self) -> Result<SourceRegistry, ConfigError> {
        SourceRegistry::new(self.source_list())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let reasoning = &self.reasoning;
        if !(reasoning.score_min.is_finite() && reasoning.score_max.is_finite())
            || reasoning.score_min >= reasoning.score_max
        {
            return Err(ConfigError::setting(
                "reasoning.score_min/score_max",
                format!("[{}, {}] is not a valid range", reasoning.score_min, reasoning.score_max),
            ));
        }

        let threshold = self.pipeline.relevance_threshold;
        if !(reasoning.score_min..=reasoning.score_max).contains(&threshold) {
            return Err(ConfigError::setting(
                "pipeline.relevance_threshold",
                format!(
                    "{threshold} is outside the score scale [{}, {}]",
                    reasoning.score_min, reasoning.score_max
                ),
            ));
        }

        if !(0.0..=1.0).contains(&self.pipeline.theme_min_confidence) {
            return Err(ConfigError::setting(
                "pipeline.theme_min_confidence",
                "must be within [0, 1]",
            ));
        }

        if self.pipeline.scoring_concurrency == 0 {
            return Err(ConfigError::setting("pipeline.scoring_concurrency", "must be at least 1"));
        }

        if self.pipeline.run_budget_secs == 0 {
            return Err(ConfigError::setting("pipeline.run_budget_secs", "must be at least 1"));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::setting("retry.max_attempts", "must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) || self.retry.multiplier < 1.0 {
            return Err(ConfigError::setting(
                "retry",
                "jitter must be within [0, 1] and multiplier at least 1",
            ));
        }

        if reasoning.requests_per_minute == 0 {
            return Err(ConfigError::setting("reasoning.requests_per_minute", "must be at least 1"));
        }

        if reasoning.max_queue_depth == 0 {
            return Err(ConfigError::setting("reasoning.max_queue_depth", "must be at least 1"));
        }

        if self.fetch.max_payload_bytes == 0 {
            return Err(ConfigError::setting("fetch.max_payload_bytes", "must be positive"));
        }

        if self.pipeline.vocabulary().is_empty() {
            return Err(ConfigError::setting("pipeline.themes", "vocabulary is empty"));
        }

        self.registry().map(|_| ())
    }
}
