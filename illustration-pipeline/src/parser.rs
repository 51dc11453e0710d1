use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use tracing::debug;

use crate::types::{FetchError, RawItem, RawPayload, SourceId};

/// Turns a fetched document (RSS 0.9x/2.0, Atom or JSON Feed) into raw items.
///
/// No filtering happens here; empty or identity-less entries are passed
/// through so the normalizer can account for them.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedParser;

impl FeedParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, content: &[u8], source_id: &SourceId, fetched_at: DateTime<Utc>) -> Result<Vec<RawItem>, FetchError> {
        debug!("Parsing feed content for {} ({} bytes)", source_id, content.len());

        let feed = parser::parse(content).map_err(|e| FetchError::malformed(format!("unparsable feed document: {e}")))?;

        let items: Vec<RawItem> = feed
            .entries
            .into_iter()
            .map(|entry| RawItem {
                source_id: source_id.clone(),
                fetched_at,
                payload: payload_from_entry(entry),
            })
            .collect();

        debug!("Parsed {} entries for {}", items.len(), source_id);
        Ok(items)
    }
}

fn payload_from_entry(entry: Entry) -> RawPayload {
    let link = primary_link(&entry.links).map(|l| l.href.clone());
    let guid = Some(entry.id).filter(|id| !id.trim().is_empty());

    RawPayload {
        guid,
        title: entry.title.map(|t| t.content),
        link,
        summary: entry.summary.map(|s| s.content),
        body: entry.content.and_then(|c| c.body),
        author: entry.authors.into_iter().next().map(|a| a.name),
        published: entry.published,
        updated: entry.updated,
    }
}

/// Prefers the `alternate` link (Atom) and falls back to the first one.
fn primary_link(links: &[Link]) -> Option<&Link> {
    links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| links.first())
}
