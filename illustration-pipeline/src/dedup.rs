use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{Article, ArticleIndex, Fingerprint, ProcessingState, Sighting, Source, StorageFailure};

/// What the coordinator does with a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Store and send through scoring and matching.
    Process,
    /// Only bump `last_seen_at`.
    TouchOnly,
}

/// Outcome of one check: how the article compares to what is stored, and
/// the stored processing state when the store already had it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub sighting: Sighting,
    /// `None` for new articles and for repeats within the run.
    pub stored: Option<ProcessingState>,
}

/// Classifies articles as new, unchanged or updated against the store and
/// against earlier sightings in the same run.
///
/// Checks are serialized, so two sources reporting the same article in one
/// run never both see it as `New`. Any later sighting of a fingerprint in the
/// same run is `SeenUnchanged`, whatever its content.
pub struct Deduplicator {
    index: Arc<dyn ArticleIndex>,
    claims: Mutex<HashSet<Fingerprint>>,
}

impl Deduplicator {
    pub fn new(index: Arc<dyn ArticleIndex>) -> Self {
        Self {
            index,
            claims: Mutex::new(HashSet::new()),
        }
    }

    pub async fn check(&self, article: &Article) -> Result<Verdict, StorageFailure> {
        let mut claims = self.claims.lock().await;

        if claims.contains(&article.fingerprint) {
            debug!(fingerprint = article.fingerprint.short(), source = %article.source_id, "repeat sighting within run");
            return Ok(Verdict {
                sighting: Sighting::SeenUnchanged,
                stored: None,
            });
        }

        let known = self.index.lookup(&article.fingerprint).await?;
        claims.insert(article.fingerprint.clone());
        Ok(match known {
            None => Verdict {
                sighting: Sighting::New,
                stored: None,
            },
            Some(known) => Verdict {
                sighting: if known.content_hash == article.content_hash {
                    Sighting::SeenUnchanged
                } else {
                    Sighting::SeenUpdated
                },
                stored: Some(known.state),
            },
        })
    }

    /// Applies the source's reprocess policy. A stored article that never
    /// finished the pipeline is always picked up again.
    pub fn decide(verdict: Verdict, source: &Source) -> Disposition {
        match verdict {
            Verdict { sighting: Sighting::New, .. } => Disposition::Process,
            Verdict { stored: Some(ProcessingState::Pending), .. } => Disposition::Process,
            Verdict { sighting: Sighting::SeenUpdated, .. } if source.reprocess_on_change => Disposition::Process,
            _ => Disposition::TouchOnly,
        }
    }
}
