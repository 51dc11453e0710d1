use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::defs::{
    Article, ArticleIndex, ArticleStore, Fingerprint, KnownArticle, RelevanceAssessment,
    StorageFailure, Theme, ThemeMatch,
};
use crate::report::PipelineRun;

#[derive(Default)]
struct Tables {
    articles: BTreeMap<Fingerprint, Article>,
    assessments: BTreeMap<(Fingerprint, String), RelevanceAssessment>,
    theme_matches: BTreeMap<(Fingerprint, Theme), ThemeMatch>,
    runs: Vec<PipelineRun>,
}

/// In-process store. Used by tests and `storage.database_url = "memory"`.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every write fails with a `StorageFailure`. Reads keep working.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_writable(&self, operation: &'static str) -> Result<(), StorageFailure> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageFailure::new(operation, "store marked unavailable"));
        }
        Ok(())
    }

    pub async fn article(&self, fingerprint: &Fingerprint) -> Option<Article> {
        self.tables.read().await.articles.get(fingerprint).cloned()
    }

    pub async fn articles(&self) -> Vec<Article> {
        self.tables.read().await.articles.values().cloned().collect()
    }

    pub async fn assessments_for(&self, fingerprint: &Fingerprint) -> Vec<RelevanceAssessment> {
        self.tables
            .read()
            .await
            .assessments
            .iter()
            .filter(|((fp, _), _)| fp == fingerprint)
            .map(|(_, a)| a.clone())
            .collect()
    }

    pub async fn theme_matches_for(&self, fingerprint: &Fingerprint) -> Vec<ThemeMatch> {
        self.tables
            .read()
            .await
            .theme_matches
            .iter()
            .filter(|((fp, _), _)| fp == fingerprint)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub async fn all_theme_matches(&self) -> Vec<ThemeMatch> {
        self.tables.read().await.theme_matches.values().cloned().collect()
    }

    pub async fn runs(&self) -> Vec<PipelineRun> {
        self.tables.read().await.runs.clone()
    }
}

#[async_trait]
impl ArticleIndex for MemoryStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<KnownArticle>, StorageFailure> {
        let tables = self.tables.read().await;
        Ok(tables.articles.get(fingerprint).map(|a| KnownArticle {
            fingerprint: a.fingerprint.clone(),
            content_hash: a.content_hash.clone(),
            state: a.state,
        }))
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn upsert_article(&self, article: &Article) -> Result<(), StorageFailure> {
        self.check_writable("upsert_article")?;
        let mut tables = self.tables.write().await;
        match tables.articles.get_mut(&article.fingerprint) {
            Some(existing) => {
                let first_seen_at = existing.first_seen_at;
                let last_seen_at = existing.last_seen_at.max(article.last_seen_at);
                *existing = article.clone();
                existing.first_seen_at = first_seen_at;
                existing.last_seen_at = last_seen_at;
            }
            None => {
                tables.articles.insert(article.fingerprint.clone(), article.clone());
            }
        }
        Ok(())
    }

    async fn touch_article(&self, fingerprint: &Fingerprint, seen_at: DateTime<Utc>) -> Result<(), StorageFailure> {
        self.check_writable("touch_article")?;
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.articles.get_mut(fingerprint) {
            if seen_at > existing.last_seen_at {
                existing.last_seen_at = seen_at;
            }
        }
        Ok(())
    }

    async fn append_assessment(&self, assessment: &RelevanceAssessment) -> Result<(), StorageFailure> {
        self.check_writable("append_assessment")?;
        let key = (assessment.fingerprint.clone(), assessment.assessor_model.clone());
        self.tables
            .write()
            .await
            .assessments
            .entry(key)
            .or_insert_with(|| assessment.clone());
        Ok(())
    }

    async fn append_theme_matches(&self, fingerprint: &Fingerprint, matches: &[ThemeMatch]) -> Result<(), StorageFailure> {
        self.check_writable("append_theme_matches")?;
        let mut tables = self.tables.write().await;
        for m in matches {
            tables
                .theme_matches
                .entry((fingerprint.clone(), m.theme))
                .or_insert_with(|| m.clone());
        }
        Ok(())
    }

    async fn append_run(&self, run: &PipelineRun) -> Result<(), StorageFailure> {
        self.check_writable("append_run")?;
        let mut tables = self.tables.write().await;
        if !tables.runs.iter().any(|r| r.run_id == run.run_id) {
            tables.runs.push(run.clone());
        }
        Ok(())
    }
}
