#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use illustration_pipeline::{
    CallSettings, CoordinatorSettings, Discipline, FeedTransport, FetchError, FetchFailureKind, Fetcher, Normalizer,
    PipelineCoordinator, RateLimiter, ReasoningError, ReasoningRequest, ReasoningService, ReasoningTask,
    RelevanceScorer, RetryPolicy, ScoreScale, Source, SourceId, SourceRegistry, Storage, Theme, ThemeMatcher,
    ThemeVocabulary,
};
use interfaces::MemoryStore;

pub const FILLER: &str = "The story spread quickly through the town, and neighbours who had never spoken \
before found themselves sharing meals, stories and plans for the winter ahead.";

/// One scripted reply from a feed endpoint.
#[derive(Clone)]
pub enum Reply {
    Feed(String),
    Fail(FetchFailureKind),
    Hang,
}

/// Feed transport that replays a script per endpoint. The last reply repeats.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, endpoint: &str, replies: Vec<Reply>) {
        self.scripts.lock().unwrap().insert(endpoint.to_string(), replies);
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls.lock().unwrap().get(endpoint).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn get(&self, endpoint: &str) -> Result<Vec<u8>, FetchError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(endpoint.to_string()).or_insert(0);
            *n += 1;
            *n - 1
        };
        let reply = {
            let scripts = self.scripts.lock().unwrap();
            let replies = scripts.get(endpoint).cloned().unwrap_or_default();
            replies.get(call).or_else(|| replies.last()).cloned()
        };
        match reply {
            Some(Reply::Feed(body)) => Ok(body.into_bytes()),
            Some(Reply::Fail(kind)) => Err(FetchError::new(kind, "scripted failure")),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(FetchError::unreachable("hung"))
            }
            None => Err(FetchError::unreachable(format!("no script for {endpoint}"))),
        }
    }
}

type Responder = Box<dyn Fn(&ReasoningRequest) -> Result<Value, ReasoningError> + Send + Sync>;

/// Reasoning service driven by closures, counting calls per task.
pub struct ScriptedReasoner {
    model: String,
    assess: Responder,
    match_themes: Responder,
    delay: Duration,
    assess_calls: AtomicUsize,
    match_calls: AtomicUsize,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self {
            model: "scripted-v1".to_string(),
            assess: Box::new(|_| Ok(json!({ "score": 0.9, "rationale": "strong human interest" }))),
            match_themes: Box::new(|_| Ok(json!({ "themes": [ { "theme": "hope", "confidence": 0.8 } ] }))),
            delay: Duration::ZERO,
            assess_calls: AtomicUsize::new(0),
            match_calls: AtomicUsize::new(0),
        }
    }

    pub fn on_assess(mut self, f: impl Fn(&ReasoningRequest) -> Result<Value, ReasoningError> + Send + Sync + 'static) -> Self {
        self.assess = Box::new(f);
        self
    }

    pub fn on_match(mut self, f: impl Fn(&ReasoningRequest) -> Result<Value, ReasoningError> + Send + Sync + 'static) -> Self {
        self.match_themes = Box::new(f);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn assess_calls(&self) -> usize {
        self.assess_calls.load(Ordering::SeqCst)
    }

    pub fn match_calls(&self) -> usize {
        self.match_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoner {
    fn model_id(&self) -> String {
        self.model.clone()
    }

    async fn complete(&self, request: &ReasoningRequest) -> Result<Value, ReasoningError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match request.task {
            ReasoningTask::RelevanceAssessment => {
                self.assess_calls.fetch_add(1, Ordering::SeqCst);
                (self.assess)(request)
            }
            ReasoningTask::ThemeMatching => {
                self.match_calls.fetch_add(1, Ordering::SeqCst);
                (self.match_themes)(request)
            }
        }
    }
}

pub struct Entry {
    pub title: String,
    pub link: Option<String>,
    pub body: String,
    pub published: DateTime<Utc>,
}

impl Entry {
    pub fn new(title: &str, link: &str) -> Self {
        Self {
            title: title.to_string(),
            link: Some(link.to_string()),
            body: format!("{title}. {FILLER}"),
            published: Utc::now() - chrono::Duration::hours(2),
        }
    }

    pub fn body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn without_link(mut self) -> Self {
        self.link = None;
        self
    }

    pub fn published(mut self, at: DateTime<Utc>) -> Self {
        self.published = at;
        self
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn rss(entries: &[Entry]) -> String {
    let items: String = entries
        .iter()
        .map(|e| {
            let link = e
                .link
                .as_deref()
                .map(|l| format!("<link>{}</link><guid isPermaLink=\"false\">{}</guid>", escape(l), escape(l)))
                .unwrap_or_default();
            format!(
                "<item><title>{}</title>{}<description>{}</description><pubDate>{}</pubDate></item>",
                escape(&e.title),
                link,
                escape(&e.body),
                e.published.to_rfc2822()
            )
        })
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><rss version=\"2.0\"><channel><title>Test</title>\
         <link>https://test.example</link><description>fixture</description>{items}</channel></rss>"
    )
}

pub fn endpoint(id: &str) -> String {
    format!("https://{id}.example/feed.xml")
}

pub fn source(id: &str) -> Source {
    Source {
        id: SourceId::new(id),
        name: id.to_uppercase(),
        discipline: Discipline::Culture,
        endpoint: endpoint(id),
        fetch_interval: Duration::from_secs(600),
        enabled: true,
        reprocess_on_change: false,
    }
}

/// Knobs for assembling a coordinator around fakes.
#[derive(Clone)]
pub struct Options {
    pub threshold: f64,
    pub min_confidence: f64,
    pub vocabulary: Vec<Theme>,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub call_timeout: Duration,
    pub run_budget: Duration,
    pub scale: ScoreScale,
    pub min_content_chars: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_confidence: 0.3,
            vocabulary: Theme::ALL.to_vec(),
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            run_budget: Duration::from_secs(30),
            scale: ScoreScale::default(),
            min_content_chars: 100,
        }
    }
}

/// Limiter loose enough that tests never wait on it.
pub fn limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::with_spacing(Duration::from_millis(1), 1000))
}

pub fn scorer(reasoner: Arc<dyn ReasoningService>, options: &Options) -> RelevanceScorer {
    scorer_with(reasoner, limiter(), options)
}

pub fn scorer_with(reasoner: Arc<dyn ReasoningService>, limiter: Arc<RateLimiter>, options: &Options) -> RelevanceScorer {
    RelevanceScorer::new(
        reasoner,
        limiter,
        options.scale,
        options.min_content_chars,
        call_settings(options),
    )
}

pub fn matcher(reasoner: Arc<dyn ReasoningService>, options: &Options) -> ThemeMatcher {
    matcher_with(reasoner, limiter(), options)
}

pub fn matcher_with(reasoner: Arc<dyn ReasoningService>, limiter: Arc<RateLimiter>, options: &Options) -> ThemeMatcher {
    ThemeMatcher::new(
        reasoner,
        limiter,
        ThemeVocabulary::new(options.vocabulary.clone()),
        options.threshold,
        options.min_confidence,
        call_settings(options),
    )
}

pub fn call_settings(options: &Options) -> CallSettings {
    CallSettings {
        timeout: options.call_timeout,
        max_response_bytes: 64 * 1024,
        retry: RetryPolicy::immediate(options.max_attempts),
    }
}

pub fn coordinator(
    sources: Vec<Source>,
    transport: Arc<ScriptedTransport>,
    reasoner: Arc<ScriptedReasoner>,
    store: Arc<MemoryStore>,
    options: Options,
) -> PipelineCoordinator {
    let registry = SourceRegistry::new(sources).expect("valid sources");
    let fetcher = Fetcher::new(transport, RetryPolicy::immediate(options.max_attempts), options.attempt_timeout);
    let shared = limiter();
    PipelineCoordinator::new(
        registry,
        fetcher,
        Normalizer::new(Some(chrono::Duration::days(30))),
        scorer_with(reasoner.clone(), shared.clone(), &options),
        matcher_with(reasoner, shared, &options),
        Storage::new(store),
        CoordinatorSettings {
            run_budget: options.run_budget,
            concurrency: 4,
        },
    )
}

/// Title text the reasoner sees, recovered from the request.
pub fn mentions(request: &ReasoningRequest, needle: &str) -> bool {
    request.article_text.contains(needle)
}
