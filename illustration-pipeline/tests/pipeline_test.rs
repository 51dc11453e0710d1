mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use illustration_pipeline::{
    AssessmentFailureKind, AssessmentStatus, FetchFailureKind, MatchStatus, NotAttemptedReason, ProcessingState,
    ReasoningError, RunPhase, RunStatus, Sighting, SourceId, SourceStatus, Theme,
};
use interfaces::MemoryStore;

#[tokio::test]
async fn unreachable_source_does_not_block_the_others() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(&endpoint("a"), vec![Reply::Feed(rss(&[Entry::new("Firefighter adopts rescued dog", "https://a.example/dog")]))]);
    transport.script(&endpoint("b"), vec![Reply::Fail(FetchFailureKind::Unreachable)]);
    transport.script(&endpoint("c"), vec![Reply::Feed(rss(&[Entry::new("Choir sings for strangers", "https://c.example/choir")]))]);
    let reasoner = Arc::new(ScriptedReasoner::new());
    let store = Arc::new(MemoryStore::new());

    let pipeline = coordinator(
        vec![source("a"), source("b"), source("c")],
        transport.clone(),
        reasoner.clone(),
        store.clone(),
        Options::default(),
    );
    let run = pipeline.run().await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.phase, RunPhase::Completed);
    assert_eq!(transport.calls(&endpoint("b")), 3);

    let b = run.source(&SourceId::new("b")).unwrap();
    assert_eq!(
        b.status,
        SourceStatus::Failed {
            kind: FetchFailureKind::Unreachable,
            attempts: 3,
            message: "scripted failure".to_string(),
        }
    );
    assert_eq!(run.source(&SourceId::new("a")).unwrap().status, SourceStatus::Succeeded);
    assert_eq!(run.source(&SourceId::new("c")).unwrap().status, SourceStatus::Succeeded);

    assert_eq!(store.articles().await.len(), 2);
    assert!(store.articles().await.iter().all(|a| a.state == ProcessingState::Completed));
    assert_eq!(reasoner.assess_calls(), 2);
    assert_eq!(store.runs().await.len(), 1);
}

#[tokio::test]
async fn malformed_responses_are_not_retried() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(&endpoint("a"), vec![Reply::Fail(FetchFailureKind::MalformedResponse)]);
    transport.script(&endpoint("b"), vec![Reply::Feed("<html><body>moved</body></html>".to_string())]);

    let pipeline = coordinator(
        vec![source("a"), source("b")],
        transport.clone(),
        Arc::new(ScriptedReasoner::new()),
        Arc::new(MemoryStore::new()),
        Options::default(),
    );
    let run = pipeline.run().await;

    assert!(run.is_completed());
    assert_eq!(transport.calls(&endpoint("a")), 1);
    assert_eq!(transport.calls(&endpoint("b")), 1);
    for id in ["a", "b"] {
        assert!(matches!(
            run.source(&SourceId::new(id)).unwrap().status,
            SourceStatus::Failed { kind: FetchFailureKind::MalformedResponse, attempts: 1, .. }
        ));
    }
}

#[tokio::test]
async fn article_seen_on_two_sources_is_processed_once() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(
        &endpoint("a"),
        vec![Reply::Feed(rss(&[Entry::new("Nurse forgives attacker", "https://news.example/nurse?utm_source=a")]))],
    );
    transport.script(
        &endpoint("c"),
        vec![Reply::Feed(rss(&[Entry::new("Nurse forgives attacker", "http://www.news.example/nurse/#top")]))],
    );
    let reasoner = Arc::new(ScriptedReasoner::new());
    let store = Arc::new(MemoryStore::new());

    let pipeline = coordinator(
        vec![source("a"), source("c")],
        transport,
        reasoner.clone(),
        store.clone(),
        Options::default(),
    );
    let run = pipeline.run().await;

    assert_eq!(store.articles().await.len(), 1);
    assert_eq!(reasoner.assess_calls(), 1);
    assert_eq!(run.stages.new_articles, 1);
    assert_eq!(run.stages.seen_unchanged, 1);
    assert_eq!(run.source(&SourceId::new("a")).unwrap().new_articles, 1);
    assert_eq!(run.source(&SourceId::new("c")).unwrap().seen_unchanged, 1);
    assert_eq!(run.articles.len(), 1);
    assert_eq!(run.articles[0].sighting, Sighting::New);
}

#[tokio::test]
async fn mirrors_with_different_bodies_are_scored_once_per_run() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(
        &endpoint("a"),
        vec![Reply::Feed(rss(&[Entry::new("Stranger pays for groceries", "https://news.example/groceries")]))],
    );
    transport.script(
        &endpoint("c"),
        vec![Reply::Feed(rss(&[Entry::new("Stranger pays for groceries", "https://news.example/groceries")
            .body("Stranger pays for groceries. Syndicated copy with a different closing paragraph about the cashier.")]))],
    );
    let reasoner = Arc::new(ScriptedReasoner::new());
    let store = Arc::new(MemoryStore::new());
    let mut mirror = source("c");
    mirror.reprocess_on_change = true;

    let pipeline = coordinator(vec![source("a"), mirror], transport, reasoner.clone(), store.clone(), Options::default());
    let run = pipeline.run().await;

    assert_eq!(run.stages.new_articles, 1);
    assert_eq!(run.stages.seen_unchanged, 1);
    assert_eq!(run.stages.seen_updated, 0);
    assert_eq!(run.articles.len(), 1);
    assert_eq!(reasoner.assess_calls(), 1);
    assert_eq!(reasoner.match_calls(), 1);
    assert_eq!(store.articles().await.len(), 1);
}

#[tokio::test]
async fn only_relevant_articles_reach_the_matcher() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(
        &endpoint("a"),
        vec![Reply::Feed(rss(&[
            Entry::new("Quarterly earnings beat estimates", "https://a.example/earnings"),
            Entry::new("Stranger pays off neighbour's debt", "https://a.example/debt"),
        ]))],
    );
    let reasoner = Arc::new(ScriptedReasoner::new().on_assess(|req| {
        let score = if mentions(req, "earnings") { 0.4 } else { 0.8 };
        Ok(json!({ "score": score, "rationale": "scripted" }))
    }));
    let store = Arc::new(MemoryStore::new());

    let pipeline = coordinator(vec![source("a")], transport, reasoner.clone(), store.clone(), Options::default());
    let run = pipeline.run().await;

    assert_eq!(reasoner.assess_calls(), 2);
    assert_eq!(reasoner.match_calls(), 1);

    let earnings = run.articles.iter().find(|a| a.title.contains("earnings")).unwrap();
    assert_eq!(earnings.assessment, AssessmentStatus::Assessed { score: 0.4 });
    assert_eq!(
        earnings.themes,
        MatchStatus::NotAttempted { reason: NotAttemptedReason::BelowThreshold }
    );
    assert!(store.theme_matches_for(&earnings.fingerprint).await.is_empty());

    let debt = run.articles.iter().find(|a| a.title.contains("debt")).unwrap();
    assert_eq!(debt.themes, MatchStatus::Matched { count: 1 });
    let stored = store.theme_matches_for(&debt.fingerprint).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].theme, Theme::Hope);
}

#[tokio::test]
async fn out_of_range_score_is_rejected() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(&endpoint("a"), vec![Reply::Feed(rss(&[Entry::new("Odd reply", "https://a.example/odd")]))]);
    let reasoner = Arc::new(ScriptedReasoner::new().on_assess(|_| Ok(json!({ "score": 1.7, "rationale": "too good" }))));
    let store = Arc::new(MemoryStore::new());

    let pipeline = coordinator(vec![source("a")], transport, reasoner.clone(), store.clone(), Options::default());
    let run = pipeline.run().await;

    assert!(run.is_completed());
    let outcome = &run.articles[0];
    assert!(matches!(
        outcome.assessment,
        AssessmentStatus::Failed { kind: AssessmentFailureKind::InvalidResponse, .. }
    ));
    assert_eq!(outcome.themes, MatchStatus::NotAttempted { reason: NotAttemptedReason::NoAssessment });
    // invalid replies are not retried
    assert_eq!(reasoner.assess_calls(), 1);
    assert_eq!(reasoner.match_calls(), 0);
    assert!(store.assessments_for(&outcome.fingerprint).await.is_empty());
    assert_eq!(store.articles().await.len(), 1);
}

#[tokio::test]
async fn completed_articles_are_not_rescored() {
    let transport = Arc::new(ScriptedTransport::new());
    let feed = rss(&[Entry::new("Nurse donates kidney", "https://a.example/kidney")]);
    transport.script(&endpoint("a"), vec![Reply::Feed(feed)]);
    let reasoner = Arc::new(ScriptedReasoner::new());
    let store = Arc::new(MemoryStore::new());

    let pipeline = coordinator(vec![source("a")], transport, reasoner.clone(), store.clone(), Options::default());
    let first = pipeline.run().await;
    let fingerprint = first.articles[0].fingerprint.clone();
    let first_seen = store.article(&fingerprint).await.unwrap().last_seen_at;

    let second = pipeline.run().await;

    assert_eq!(reasoner.assess_calls(), 1);
    assert_eq!(reasoner.match_calls(), 1);
    assert_eq!(second.stages.seen_unchanged, 1);
    assert!(second.articles.is_empty());
    assert_eq!(store.assessments_for(&fingerprint).await.len(), 1);
    assert!(store.article(&fingerprint).await.unwrap().last_seen_at >= first_seen);
    assert_eq!(store.runs().await.len(), 2);
}

#[tokio::test]
async fn failed_assessments_are_not_retried_on_later_runs() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(&endpoint("a"), vec![Reply::Feed(rss(&[Entry::new("Flood volunteers", "https://a.example/flood")]))]);
    let reasoner = Arc::new(
        ScriptedReasoner::new().on_assess(|_| Err(ReasoningError::Unavailable("503".to_string()))),
    );
    let store = Arc::new(MemoryStore::new());

    let pipeline = coordinator(vec![source("a")], transport, reasoner.clone(), store.clone(), Options::default());
    let run = pipeline.run().await;

    assert!(run.is_completed());
    assert!(matches!(
        run.articles[0].assessment,
        AssessmentStatus::Failed { kind: AssessmentFailureKind::ServiceUnavailable, .. }
    ));
    assert_eq!(reasoner.assess_calls(), 3);

    pipeline.run().await;
    assert_eq!(reasoner.assess_calls(), 3);
}

#[tokio::test]
async fn changed_articles_are_reprocessed_only_when_the_source_asks() {
    for reprocess in [false, true] {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            &endpoint("a"),
            vec![
                Reply::Feed(rss(&[Entry::new("Bridge rebuilt", "https://a.example/bridge")])),
                Reply::Feed(rss(&[Entry::new("Bridge rebuilt", "https://a.example/bridge")
                    .body("Bridge rebuilt. Updated: the whole village turned out to help carry stones across the river.")])),
            ],
        );
        let reasoner = Arc::new(ScriptedReasoner::new());
        let mut a = source("a");
        a.reprocess_on_change = reprocess;

        let pipeline = coordinator(vec![a], transport, reasoner.clone(), Arc::new(MemoryStore::new()), Options {
            min_content_chars: 10,
            ..Options::default()
        });
        pipeline.run().await;
        let second = pipeline.run().await;

        assert_eq!(second.stages.seen_updated, 1);
        if reprocess {
            assert_eq!(second.stages.reprocessed, 1);
            assert_eq!(reasoner.assess_calls(), 2);
            assert_eq!(second.articles[0].sighting, Sighting::SeenUpdated);
        } else {
            assert_eq!(second.stages.reprocessed, 0);
            assert_eq!(reasoner.assess_calls(), 1);
            assert!(second.articles.is_empty());
        }
    }
}

#[tokio::test]
async fn labels_outside_the_vocabulary_are_never_stored() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(&endpoint("a"), vec![Reply::Feed(rss(&[Entry::new("Prison choir", "https://a.example/choir")]))]);
    let reasoner = Arc::new(ScriptedReasoner::new().on_match(|_| {
        Ok(json!({ "themes": [
            { "theme": "serendipity", "confidence": 0.9 },
            { "theme": "grace", "confidence": 0.8 },
            { "theme": "mercy", "confidence": 0.9 },
            { "theme": "Grace", "confidence": 0.6 },
            { "theme": "hope", "confidence": 0.1 },
            { "theme": "hope", "confidence": 1.4 },
        ] }))
    }));
    let store = Arc::new(MemoryStore::new());

    let pipeline = coordinator(vec![source("a")], transport, reasoner, store.clone(), Options {
        vocabulary: vec![Theme::Grace, Theme::Hope],
        ..Options::default()
    });
    let run = pipeline.run().await;

    let outcome = &run.articles[0];
    assert_eq!(outcome.themes, MatchStatus::Matched { count: 1 });
    assert_eq!(outcome.vocabulary_violations, 2);
    assert_eq!(run.stages.vocabulary_violations, 2);

    let stored = store.all_theme_matches().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].theme, Theme::Grace);
    assert_eq!(stored[0].confidence, 0.8);
}

#[tokio::test]
async fn storage_failure_fails_the_run() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(&endpoint("a"), vec![Reply::Feed(rss(&[Entry::new("Lost wallet returned", "https://a.example/wallet")]))]);
    let reasoner = Arc::new(ScriptedReasoner::new());
    let store = Arc::new(MemoryStore::new());
    store.set_unavailable(true);

    let pipeline = coordinator(vec![source("a")], transport, reasoner.clone(), store.clone(), Options::default());
    let run = pipeline.run().await;

    assert!(matches!(run.status, RunStatus::Failed { .. }));
    assert_eq!(run.phase, RunPhase::Failed);
    assert_eq!(reasoner.assess_calls(), 0);
}

#[tokio::test]
async fn budget_exhaustion_skips_slow_sources() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(&endpoint("a"), vec![Reply::Feed(rss(&[Entry::new("Quick story", "https://a.example/quick")]))]);
    transport.script(&endpoint("slow"), vec![Reply::Hang]);
    let reasoner = Arc::new(ScriptedReasoner::new());
    let store = Arc::new(MemoryStore::new());

    let pipeline = coordinator(vec![source("a"), source("slow")], transport, reasoner.clone(), store.clone(), Options {
        run_budget: Duration::from_millis(300),
        attempt_timeout: Duration::from_secs(60),
        ..Options::default()
    });
    let run = pipeline.run().await;

    assert!(run.is_completed());
    assert!(run.budget_exhausted);
    assert_eq!(run.source(&SourceId::new("slow")).unwrap().status, SourceStatus::Skipped);
    assert_eq!(run.source(&SourceId::new("a")).unwrap().status, SourceStatus::Succeeded);

    let outcome = &run.articles[0];
    assert_eq!(
        outcome.assessment,
        AssessmentStatus::NotAttempted { reason: NotAttemptedReason::BudgetExhausted }
    );
    assert_eq!(
        outcome.themes,
        MatchStatus::NotAttempted { reason: NotAttemptedReason::BudgetExhausted }
    );
    assert_eq!(reasoner.assess_calls(), 0);
    // persisted, but left pending for a later pass
    assert_eq!(store.article(&outcome.fingerprint).await.unwrap().state, ProcessingState::Pending);
}

#[tokio::test]
async fn budget_cut_articles_are_scored_on_the_next_run() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(&endpoint("a"), vec![Reply::Feed(rss(&[Entry::new("Quick story", "https://a.example/quick")]))]);
    transport.script(&endpoint("slow"), vec![Reply::Hang]);
    let reasoner = Arc::new(ScriptedReasoner::new());
    let store = Arc::new(MemoryStore::new());

    let rushed = coordinator(vec![source("a"), source("slow")], transport.clone(), reasoner.clone(), store.clone(), Options {
        run_budget: Duration::from_millis(300),
        attempt_timeout: Duration::from_secs(60),
        ..Options::default()
    });
    let first = rushed.run().await;
    let fingerprint = first.articles[0].fingerprint.clone();
    assert_eq!(store.article(&fingerprint).await.unwrap().state, ProcessingState::Pending);
    assert_eq!(reasoner.assess_calls(), 0);

    let next = coordinator(vec![source("a")], transport, reasoner.clone(), store.clone(), Options::default());
    let second = next.run().await;

    assert!(!second.budget_exhausted);
    assert_eq!(second.stages.seen_unchanged, 1);
    assert_eq!(reasoner.assess_calls(), 1);
    assert_eq!(reasoner.match_calls(), 1);
    let outcome = second.article(&fingerprint).unwrap();
    assert!(matches!(outcome.assessment, AssessmentStatus::Assessed { .. }));
    assert_eq!(store.article(&fingerprint).await.unwrap().state, ProcessingState::Completed);

    // finished now, so a third pass leaves it alone
    let third = next.run().await;
    assert!(third.articles.is_empty());
    assert_eq!(reasoner.assess_calls(), 1);
}

#[tokio::test]
async fn drops_and_short_articles_are_accounted_for() {
    let transport = Arc::new(ScriptedTransport::new());
    let feed = rss(&[
        Entry::new("Long enough story", "https://a.example/long"),
        Entry::new("Tiny", "https://a.example/tiny").body("Tiny."),
        Entry::new("", "https://a.example/empty").body(""),
        Entry::new("Old news", "https://a.example/old").published(chrono::Utc::now() - chrono::Duration::days(90)),
    ]);
    transport.script(&endpoint("a"), vec![Reply::Feed(feed)]);
    let reasoner = Arc::new(ScriptedReasoner::new());

    let pipeline = coordinator(vec![source("a")], transport, reasoner.clone(), Arc::new(MemoryStore::new()), Options::default());
    let run = pipeline.run().await;

    assert_eq!(run.stages.items_fetched, 4);
    assert_eq!(run.stages.normalized, 2);
    assert_eq!(run.stages.dropped_empty_content, 1);
    assert_eq!(run.stages.dropped_stale, 1);
    let a = run.source(&SourceId::new("a")).unwrap();
    assert_eq!((a.success_count, a.failure_count), (2, 2));

    let tiny = run.articles.iter().find(|o| o.title == "Tiny").unwrap();
    assert_eq!(tiny.assessment, AssessmentStatus::NotAttempted { reason: NotAttemptedReason::TooShort });
    assert_eq!(reasoner.assess_calls(), 1);
}
