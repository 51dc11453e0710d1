use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::dedup::{Deduplicator, Disposition};
use crate::fetcher::Fetcher;
use crate::limiter::RateLimiter;
use crate::matcher::{ThemeMatchReport, ThemeMatcher, ThemeVocabulary};
use crate::normalizer::Normalizer;
use crate::reasoning::build_reasoner;
use crate::registry::SourceRegistry;
use crate::scorer::{CallSettings, RelevanceScorer, ScoreScale};
use crate::store::Storage;
use crate::types::{
    Article, ArticleOutcome, AssessmentStatus, DropReason, FetchFailure, MatchStatus, NotAttemptedReason,
    PipelineRun, ProcessingState, RawItemBatch, RelevanceAssessment, Result, RunPhase, RunStatus, Sighting,
    Source, SourceId, SourceOutcome, SourceStatus, StorageFailure,
};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Wall-clock budget for one run.
    pub run_budget: Duration,
    /// Articles scored or matched at once.
    pub concurrency: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            run_budget: Duration::from_secs(600),
            concurrency: 4,
        }
    }
}

/// Everything one source produced before deduplication.
struct Harvest {
    source: Source,
    result: std::result::Result<NormalizedBatch, FetchFailure>,
}

struct NormalizedBatch {
    attempts: u32,
    items_fetched: usize,
    articles: Vec<Article>,
    drops: Vec<DropReason>,
}

impl NormalizedBatch {
    fn from_raw(normalizer: &Normalizer, source: &Source, batch: RawItemBatch) -> Self {
        let mut articles = Vec::new();
        let mut drops = Vec::new();
        for item in &batch.items {
            match normalizer.normalize(item, source) {
                Ok(article) => articles.push(article),
                Err(reason) => {
                    debug!(source = %source.id, title = ?item.payload.title, %reason, "item dropped");
                    drops.push(reason);
                }
            }
        }
        Self {
            attempts: batch.attempts,
            items_fetched: batch.items.len(),
            articles,
            drops,
        }
    }
}

struct WorkItem {
    article: Article,
    sighting: Sighting,
}

struct Scored {
    item: WorkItem,
    status: AssessmentStatus,
    assessment: Option<RelevanceAssessment>,
}

/// Drives one pass of fetch, normalize, deduplicate, score and match over a
/// set of sources, and records the run.
pub struct PipelineCoordinator {
    registry: Arc<SourceRegistry>,
    fetcher: Arc<Fetcher>,
    normalizer: Arc<Normalizer>,
    scorer: RelevanceScorer,
    matcher: ThemeMatcher,
    storage: Storage,
    settings: CoordinatorSettings,
}

fn advance(run: &mut PipelineRun, next: RunPhase) {
    if !run.phase.can_advance_to(next) {
        warn!(run_id = %run.run_id, from = ?run.phase, to = ?next, "ignoring illegal phase transition");
        return;
    }
    info!(run_id = %run.run_id, from = ?run.phase, to = ?next, "run phase");
    run.phase = next;
}

fn outcome_mut<'a>(sources: &'a mut [SourceOutcome], id: &SourceId) -> Option<&'a mut SourceOutcome> {
    sources.iter_mut().find(|o| &o.source_id == id)
}

impl PipelineCoordinator {
    pub fn new(
        registry: SourceRegistry,
        fetcher: Fetcher,
        normalizer: Normalizer,
        scorer: RelevanceScorer,
        matcher: ThemeMatcher,
        storage: Storage,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            fetcher: Arc::new(fetcher),
            normalizer: Arc::new(normalizer),
            scorer,
            matcher,
            storage,
            settings,
        }
    }

    /// Wires the production components described by `config`.
    pub fn from_config(config: &PipelineConfig, storage: Storage) -> Result<Self> {
        config.validate()?;
        let registry = config.registry()?;
        let fetcher = Fetcher::from_config(&config.fetch, config.retry.clone())?;

        let reasoning = &config.reasoning;
        let reasoner = build_reasoner(reasoning)?;
        let limiter = Arc::new(RateLimiter::per_minute(
            reasoning.requests_per_minute,
            reasoning.max_queue_depth,
        ));
        let call = CallSettings {
            timeout: reasoning.timeout(),
            max_response_bytes: reasoning.max_response_bytes,
            retry: config.retry.clone(),
        };

        let scorer = RelevanceScorer::new(
            reasoner.clone(),
            limiter.clone(),
            ScoreScale {
                min: reasoning.score_min,
                max: reasoning.score_max,
            },
            config.pipeline.min_content_chars,
            call.clone(),
        );
        let matcher = ThemeMatcher::new(
            reasoner,
            limiter,
            ThemeVocabulary::new(config.pipeline.vocabulary()),
            config.pipeline.relevance_threshold,
            config.pipeline.theme_min_confidence,
            call,
        );

        info!(
            sources = registry.len(),
            provider = ?reasoning.provider,
            themes = matcher.vocabulary().len(),
            "Pipeline configured"
        );

        Ok(Self::new(
            registry,
            fetcher,
            Normalizer::new(config.pipeline.max_article_age()),
            scorer,
            matcher,
            storage,
            CoordinatorSettings {
                run_budget: config.pipeline.run_budget(),
                concurrency: config.pipeline.scoring_concurrency,
            },
        ))
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Runs every enabled source once.
    pub async fn run(&self) -> PipelineRun {
        let sources = self.registry.enabled().cloned().collect();
        self.run_sources(sources).await
    }

    pub async fn run_sources(&self, sources: Vec<Source>) -> PipelineRun {
        let mut run = PipelineRun::begin(Utc::now());
        let deadline = Instant::now() + self.settings.run_budget;
        info!(run_id = %run.run_id, sources = sources.len(), budget = ?self.settings.run_budget, "Starting pipeline run");

        match self.execute(&mut run, sources, deadline).await {
            Ok(()) => advance(&mut run, RunPhase::Completed),
            Err(failure) => {
                error!(run_id = %run.run_id, error = %failure, "run aborted by storage failure");
                run.status = RunStatus::Failed {
                    reason: failure.to_string(),
                };
                advance(&mut run, RunPhase::Failed);
            }
        }
        run.finished_at = Some(Utc::now());

        if let Err(failure) = self.storage.store.append_run(&run).await {
            error!(run_id = %run.run_id, error = %failure, "could not record pipeline run");
            // an unrecorded run is not a completed one
            if run.is_completed() {
                run.status = RunStatus::Failed {
                    reason: failure.to_string(),
                };
                run.phase = RunPhase::Failed;
            }
        }

        let stages = &run.stages;
        info!(
            run_id = %run.run_id,
            status = ?run.status,
            budget_exhausted = run.budget_exhausted,
            fetched = stages.items_fetched,
            new = stages.new_articles,
            assessed = stages.assessed,
            matched = stages.matched_articles,
            "Pipeline run finished"
        );
        run
    }

    async fn execute(
        &self,
        run: &mut PipelineRun,
        sources: Vec<Source>,
        deadline: Instant,
    ) -> std::result::Result<(), StorageFailure> {
        run.sources = sources.iter().map(|s| SourceOutcome::pending(s.id.clone())).collect();

        advance(run, RunPhase::Fetching);
        let harvests = self.harvest(&sources, deadline, run).await;

        advance(run, RunPhase::Normalizing);
        let candidates = self.tally_harvests(run, harvests);

        advance(run, RunPhase::Deduplicating);
        let work = self.deduplicate(run, candidates).await?;

        advance(run, RunPhase::Scoring);
        let scored = self.score(run, work, deadline).await?;

        advance(run, RunPhase::Matching);
        self.match_and_finish(run, scored, deadline).await
    }

    /// Fetches and normalizes each source on its own task. Sources still
    /// running at the deadline are aborted and stay `Skipped`.
    async fn harvest(&self, sources: &[Source], deadline: Instant, run: &mut PipelineRun) -> Vec<Harvest> {
        let mut tasks = JoinSet::new();
        for source in sources.iter().cloned() {
            let fetcher = self.fetcher.clone();
            let normalizer = self.normalizer.clone();
            tasks.spawn(async move {
                let result = fetcher
                    .fetch(&source)
                    .await
                    .map(|batch| NormalizedBatch::from_raw(&normalizer, &source, batch));
                Harvest { source, result }
            });
        }

        let mut harvests = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(harvest))) => harvests.push(harvest),
                Ok(Some(Err(e))) => error!(run_id = %run.run_id, error = %e, "fetch task did not finish"),
                Ok(None) => break,
                Err(_) => {
                    warn!(run_id = %run.run_id, unfinished = tasks.len(), "run budget exhausted while fetching");
                    run.budget_exhausted = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        harvests.sort_by_key(|h| sources.iter().position(|s| s.id == h.source.id));
        harvests
    }

    fn tally_harvests(&self, run: &mut PipelineRun, harvests: Vec<Harvest>) -> Vec<(Source, Article)> {
        let mut candidates = Vec::new();
        for harvest in harvests {
            let Some(outcome) = outcome_mut(&mut run.sources, &harvest.source.id) else {
                continue;
            };
            match harvest.result {
                Ok(batch) => {
                    outcome.status = SourceStatus::Succeeded;
                    outcome.attempts = batch.attempts;
                    outcome.items_fetched = batch.items_fetched;
                    outcome.success_count = batch.articles.len();
                    outcome.failure_count = batch.drops.len();
                    if !batch.drops.is_empty() {
                        outcome.error_summary = Some(format!("{} item(s) dropped during normalization", batch.drops.len()));
                    }

                    run.stages.items_fetched += batch.items_fetched;
                    run.stages.normalized += batch.articles.len();
                    for reason in batch.drops {
                        run.stages.record_drop(reason);
                    }
                    candidates.extend(batch.articles.into_iter().map(|a| (harvest.source.clone(), a)));
                }
                Err(failure) => {
                    outcome.status = SourceStatus::Failed {
                        kind: failure.kind,
                        attempts: failure.attempts,
                        message: failure.message.clone(),
                    };
                    outcome.attempts = failure.attempts;
                    outcome.failure_count += 1;
                    outcome.error_summary = Some(failure.to_string());
                }
            }
        }
        candidates
    }

    async fn deduplicate(
        &self,
        run: &mut PipelineRun,
        candidates: Vec<(Source, Article)>,
    ) -> std::result::Result<Vec<WorkItem>, StorageFailure> {
        let dedup = Deduplicator::new(self.storage.index.clone());
        let store = &self.storage.store;
        let mut work = Vec::new();

        for (source, article) in candidates {
            let verdict = dedup.check(&article).await?;
            let sighting = verdict.sighting;
            if let Some(outcome) = outcome_mut(&mut run.sources, &source.id) {
                match sighting {
                    Sighting::New => outcome.new_articles += 1,
                    Sighting::SeenUnchanged => outcome.seen_unchanged += 1,
                    Sighting::SeenUpdated => outcome.seen_updated += 1,
                }
            }
            match sighting {
                Sighting::New => run.stages.new_articles += 1,
                Sighting::SeenUnchanged => run.stages.seen_unchanged += 1,
                Sighting::SeenUpdated => run.stages.seen_updated += 1,
            }

            match Deduplicator::decide(verdict, &source) {
                Disposition::Process => {
                    if sighting == Sighting::SeenUpdated {
                        run.stages.reprocessed += 1;
                    } else if verdict.stored == Some(ProcessingState::Pending) {
                        debug!(fingerprint = article.fingerprint.short(), "resuming unfinished article");
                    }
                    store.upsert_article(&article).await?;
                    work.push(WorkItem { article, sighting });
                }
                Disposition::TouchOnly => {
                    store.touch_article(&article.fingerprint, article.last_seen_at).await?;
                }
            }
        }
        Ok(work)
    }

    async fn score(
        &self,
        run: &mut PipelineRun,
        work: Vec<WorkItem>,
        deadline: Instant,
    ) -> std::result::Result<Vec<Scored>, StorageFailure> {
        let scorer = &self.scorer;
        let mut scored: Vec<(usize, Scored)> = stream::iter(work.into_iter().enumerate())
            .map(|(idx, item)| async move {
                let (status, assessment) = if Instant::now() >= deadline {
                    (not_attempted_assessment(NotAttemptedReason::BudgetExhausted), None)
                } else if !scorer.is_assessable(&item.article) {
                    (not_attempted_assessment(NotAttemptedReason::TooShort), None)
                } else {
                    match scorer.assess(&item.article).await {
                        Ok(a) => (AssessmentStatus::Assessed { score: a.score }, Some(a)),
                        Err(f) => (
                            AssessmentStatus::Failed {
                                kind: f.kind,
                                message: f.message,
                            },
                            None,
                        ),
                    }
                };
                (idx, Scored { item, status, assessment })
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        scored.sort_by_key(|(idx, _)| *idx);

        for (_, s) in &scored {
            match &s.status {
                AssessmentStatus::Assessed { .. } => run.stages.assessed += 1,
                AssessmentStatus::NotAttempted { reason } => {
                    run.stages.assessment_not_attempted += 1;
                    if *reason == NotAttemptedReason::BudgetExhausted {
                        run.budget_exhausted = true;
                    }
                }
                AssessmentStatus::Failed { .. } => run.stages.assessment_failed += 1,
            }
            if let Some(assessment) = &s.assessment {
                self.storage.store.append_assessment(assessment).await?;
            }
        }
        Ok(scored.into_iter().map(|(_, s)| s).collect())
    }

    async fn match_and_finish(
        &self,
        run: &mut PipelineRun,
        scored: Vec<Scored>,
        deadline: Instant,
    ) -> std::result::Result<(), StorageFailure> {
        let matcher = &self.matcher;
        let mut matched: Vec<(usize, Scored, MatchStatus, ThemeMatchReport)> = stream::iter(scored.into_iter().enumerate())
            .map(|(idx, s)| async move {
                let (status, report) = match (&s.status, &s.assessment) {
                    (AssessmentStatus::NotAttempted { reason: NotAttemptedReason::BudgetExhausted }, _) => {
                        (not_attempted_match(NotAttemptedReason::BudgetExhausted), ThemeMatchReport::default())
                    }
                    (_, None) => (not_attempted_match(NotAttemptedReason::NoAssessment), ThemeMatchReport::default()),
                    (_, Some(a)) if !matcher.should_match(a) => {
                        (not_attempted_match(NotAttemptedReason::BelowThreshold), ThemeMatchReport::default())
                    }
                    (_, Some(_)) if Instant::now() >= deadline => {
                        (not_attempted_match(NotAttemptedReason::BudgetExhausted), ThemeMatchReport::default())
                    }
                    (_, Some(a)) => match matcher.match_themes(&s.item.article, a).await {
                        Ok(report) if report.matches.is_empty() => (MatchStatus::NoMatches, report),
                        Ok(report) => (MatchStatus::Matched { count: report.matches.len() }, report),
                        Err(f) => (
                            MatchStatus::Failed {
                                kind: f.kind,
                                message: f.message,
                            },
                            ThemeMatchReport::default(),
                        ),
                    },
                };
                (idx, s, status, report)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        matched.sort_by_key(|(idx, ..)| *idx);

        let store = &self.storage.store;
        for (_, scored, status, report) in matched {
            let Scored { item, status: assessment_status, .. } = scored;
            let WorkItem { mut article, sighting } = item;

            let stages = &mut run.stages;
            match &status {
                MatchStatus::Matched { .. } => stages.matched_articles += 1,
                MatchStatus::NoMatches => stages.no_matches += 1,
                MatchStatus::NotAttempted { reason } => {
                    stages.match_not_attempted += 1;
                    if *reason == NotAttemptedReason::BudgetExhausted {
                        run.budget_exhausted = true;
                    }
                }
                MatchStatus::Failed { .. } => stages.match_failed += 1,
            }
            run.stages.vocabulary_violations += report.violations.len();

            if !report.matches.is_empty() {
                store.append_theme_matches(&article.fingerprint, &report.matches).await?;
                run.stages.theme_matches_stored += report.matches.len();
            }

            let budget_cut = matches!(
                status,
                MatchStatus::NotAttempted { reason: NotAttemptedReason::BudgetExhausted }
            );
            if !budget_cut {
                article.state = ProcessingState::Completed;
                store.upsert_article(&article).await?;
            }

            run.articles.push(ArticleOutcome {
                fingerprint: article.fingerprint,
                source_id: article.source_id,
                title: article.title,
                sighting,
                assessment: assessment_status,
                themes: status,
                vocabulary_violations: report.violations.len(),
            });
        }
        Ok(())
    }
}

fn not_attempted_assessment(reason: NotAttemptedReason) -> AssessmentStatus {
    AssessmentStatus::NotAttempted { reason }
}

fn not_attempted_match(reason: NotAttemptedReason) -> MatchStatus {
    MatchStatus::NotAttempted { reason }
}
