use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use interfaces::MemoryStore;
use tracing::info;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::types::{
    Article, ArticleIndex, ArticleStore, Fingerprint, KnownArticle, PipelineRun, RelevanceAssessment, Result, RunStatus,
    StorageFailure, ThemeMatch,
};

/// The two views of one backing store the pipeline needs: the fingerprint
/// index the deduplicator reads and the store the coordinator writes.
#[derive(Clone)]
pub struct Storage {
    pub index: Arc<dyn ArticleIndex>,
    pub store: Arc<dyn ArticleStore>,
}

impl Storage {
    pub fn new<S: ArticleStore + 'static>(store: Arc<S>) -> Self {
        Self {
            index: store.clone(),
            store,
        }
    }

    pub async fn open(config: &StorageConfig) -> Result<Self> {
        if config.is_memory() {
            info!("Using in-memory article store");
            return Ok(Self::new(Arc::new(MemoryStore::new())));
        }
        let store = SqliteStore::connect(&config.database_url).await?;
        Ok(Self::new(Arc::new(store)))
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

fn failed(operation: &'static str) -> impl Fn(sqlx::Error) -> StorageFailure {
    move |e| StorageFailure::new(operation, e.to_string())
}

/// Text form of a unit enum, as serde names it.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        _ => String::new(),
    }
}

fn from_label<T: DeserializeOwned>(operation: &'static str, raw: String) -> std::result::Result<T, StorageFailure> {
    serde_json::from_value(Value::String(raw.clone()))
        .map_err(|_| StorageFailure::new(operation, format!("unrecognised stored value {raw:?}")))
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Connected to SQLite store at {}", database_url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn article_count(&self) -> std::result::Result<i64, StorageFailure> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM articles")
            .fetch_one(&self.pool)
            .await
            .map_err(failed("count articles"))?;
        Ok(row.get("count"))
    }

    pub async fn last_seen(&self, fingerprint: &Fingerprint) -> std::result::Result<Option<DateTime<Utc>>, StorageFailure> {
        let row = sqlx::query("SELECT last_seen_at FROM articles WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(failed("read last_seen_at"))?;
        Ok(row.map(|r| r.get("last_seen_at")))
    }

    pub async fn scores_for(&self, fingerprint: &Fingerprint) -> std::result::Result<Vec<(String, f64)>, StorageFailure> {
        let rows = sqlx::query(
            "SELECT assessor_model, score FROM relevance_assessments WHERE fingerprint = ? ORDER BY assessor_model",
        )
        .bind(fingerprint.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(failed("read assessments"))?;
        Ok(rows.iter().map(|r| (r.get("assessor_model"), r.get("score"))).collect())
    }

    pub async fn themes_for(&self, fingerprint: &Fingerprint) -> std::result::Result<Vec<(String, f64)>, StorageFailure> {
        let rows = sqlx::query("SELECT theme, confidence FROM theme_matches WHERE fingerprint = ? ORDER BY theme")
            .bind(fingerprint.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(failed("read theme matches"))?;
        Ok(rows.iter().map(|r| (r.get("theme"), r.get("confidence"))).collect())
    }

    /// The report recorded for `run_id`, as the coordinator produced it.
    pub async fn run_report(&self, run_id: Uuid) -> std::result::Result<Option<PipelineRun>, StorageFailure> {
        let row = sqlx::query("SELECT report FROM pipeline_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(failed("read run report"))?;
        row.map(|r| {
            let raw: String = r.get("report");
            serde_json::from_str(&raw).map_err(|e| StorageFailure::new("read run report", e.to_string()))
        })
        .transpose()
    }

    pub async fn run_count(&self) -> std::result::Result<i64, StorageFailure> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM pipeline_runs")
            .fetch_one(&self.pool)
            .await
            .map_err(failed("count runs"))?;
        Ok(row.get("count"))
    }
}

#[async_trait]
impl ArticleIndex for SqliteStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> std::result::Result<Option<KnownArticle>, StorageFailure> {
        let row = sqlx::query("SELECT content_hash, state FROM articles WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(failed("lookup"))?;

        row.map(|r| {
            Ok(KnownArticle {
                fingerprint: fingerprint.clone(),
                content_hash: r.get("content_hash"),
                state: from_label("lookup", r.get("state"))?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl ArticleStore for SqliteStore {
    async fn upsert_article(&self, article: &Article) -> std::result::Result<(), StorageFailure> {
        sqlx::query(
            r#"
            INSERT INTO articles (
                fingerprint, basis, source_id, discipline, title, summary, body, canonical_url,
                published_at, first_seen_at, last_seen_at, content_hash, state
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (fingerprint) DO UPDATE SET
                basis = excluded.basis,
                source_id = excluded.source_id,
                discipline = excluded.discipline,
                title = excluded.title,
                summary = excluded.summary,
                body = excluded.body,
                canonical_url = excluded.canonical_url,
                published_at = excluded.published_at,
                last_seen_at = MAX(articles.last_seen_at, excluded.last_seen_at),
                content_hash = excluded.content_hash,
                state = excluded.state
            "#,
        )
        .bind(article.fingerprint.as_str())
        .bind(label(&article.basis))
        .bind(article.source_id.as_str())
        .bind(article.discipline.as_str())
        .bind(&article.title)
        .bind(&article.summary)
        .bind(&article.body)
        .bind(article.canonical_url.as_deref())
        .bind(article.published_at)
        .bind(article.first_seen_at)
        .bind(article.last_seen_at)
        .bind(&article.content_hash)
        .bind(label(&article.state))
        .execute(&self.pool)
        .await
        .map_err(failed("upsert article"))?;
        Ok(())
    }

    async fn touch_article(&self, fingerprint: &Fingerprint, seen_at: DateTime<Utc>) -> std::result::Result<(), StorageFailure> {
        sqlx::query("UPDATE articles SET last_seen_at = MAX(last_seen_at, ?) WHERE fingerprint = ?")
            .bind(seen_at)
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await
            .map_err(failed("touch article"))?;
        Ok(())
    }

    async fn append_assessment(&self, assessment: &RelevanceAssessment) -> std::result::Result<(), StorageFailure> {
        sqlx::query(
            r#"
            INSERT INTO relevance_assessments (fingerprint, assessor_model, score, rationale, assessed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (fingerprint, assessor_model) DO NOTHING
            "#,
        )
        .bind(assessment.fingerprint.as_str())
        .bind(&assessment.assessor_model)
        .bind(assessment.score)
        .bind(&assessment.rationale)
        .bind(assessment.assessed_at)
        .execute(&self.pool)
        .await
        .map_err(failed("append assessment"))?;
        Ok(())
    }

    async fn append_theme_matches(
        &self,
        fingerprint: &Fingerprint,
        matches: &[ThemeMatch],
    ) -> std::result::Result<(), StorageFailure> {
        let mut tx = self.pool.begin().await.map_err(failed("append theme matches"))?;
        for m in matches {
            sqlx::query(
                r#"
                INSERT INTO theme_matches (fingerprint, theme, confidence, matched_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (fingerprint, theme) DO NOTHING
                "#,
            )
            .bind(fingerprint.as_str())
            .bind(m.theme.as_str())
            .bind(m.confidence)
            .bind(m.matched_at)
            .execute(&mut *tx)
            .await
            .map_err(failed("append theme matches"))?;
        }
        tx.commit().await.map_err(failed("append theme matches"))?;
        Ok(())
    }

    async fn append_run(&self, run: &PipelineRun) -> std::result::Result<(), StorageFailure> {
        let report = serde_json::to_string(run).map_err(|e| StorageFailure::new("append run", e.to_string()))?;
        let status = match run.status {
            RunStatus::Completed => "completed",
            RunStatus::Failed { .. } => "failed",
        };
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (run_id, started_at, finished_at, status, report)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(status)
        .bind(report)
        .execute(&self.pool)
        .await
        .map_err(failed("append run"))?;
        Ok(())
    }
}
