use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::types::{ConfigError, Source, SourceId};

/// Validated, read-only set of configured sources.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<Source>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for source in &sources {
            if source.id.as_str().is_empty() {
                return Err(ConfigError::InvalidSource {
                    source_id: source.id.clone(),
                    reason: "id is empty".to_string(),
                });
            }
            if !seen.insert(source.id.clone()) {
                return Err(ConfigError::DuplicateSource(source.id.clone()));
            }
            validate_endpoint(source)?;
            if source.fetch_interval.is_zero() {
                return Err(ConfigError::InvalidSource {
                    source_id: source.id.clone(),
                    reason: "fetch interval must be positive".to_string(),
                });
            }
        }
        Ok(Self { sources })
    }

    pub fn all(&self) -> &[Source] {
        &self.sources
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, id: &SourceId) -> Option<&Source> {
        self.sources.iter().find(|s| &s.id == id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Enabled sources whose interval has elapsed since their last fetch.
    pub fn due(&self, now: DateTime<Utc>, last_fetched: &HashMap<SourceId, DateTime<Utc>>) -> Vec<Source> {
        self.enabled()
            .filter(|source| match last_fetched.get(&source.id) {
                None => true,
                Some(last) => {
                    let interval = chrono::Duration::from_std(source.fetch_interval)
                        .unwrap_or_else(|_| chrono::Duration::days(36_500));
                    now.signed_duration_since(*last) >= interval
                }
            })
            .cloned()
            .collect()
    }

    pub fn shortest_interval(&self) -> Option<Duration> {
        self.enabled().map(|s| s.fetch_interval).min()
    }
}

fn validate_endpoint(source: &Source) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSource {
        source_id: source.id.clone(),
        reason,
    };
    let url = Url::parse(&source.endpoint).map_err(|e| invalid(format!("endpoint {:?}: {e}", source.endpoint)))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(()),
        scheme => Err(invalid(format!("endpoint scheme {scheme:?} is not fetchable"))),
    }
}
