use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

use crate::types::{Article, DropReason, Fingerprint, FingerprintBasis, ProcessingState, RawItem, Source};

static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>|</?[^>]+>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref"];
const SUMMARY_CHARS: usize = 280;
const DERIVED_TITLE_CHARS: usize = 80;

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    max_age: Option<chrono::Duration>,
}

impl Normalizer {
    pub fn new(max_age: Option<chrono::Duration>) -> Self {
        Self { max_age }
    }

    /// Builds the canonical article for one raw item.
    ///
    /// Pure: timestamps come from the item's fetch time, so the same item always
    /// yields the same fingerprint and content hash.
    pub fn normalize(&self, item: &RawItem, source: &Source) -> Result<Article, DropReason> {
        let payload = &item.payload;
        let title = payload.title.as_deref().map(clean_text).unwrap_or_default();
        let summary = payload.summary.as_deref().map(clean_text).unwrap_or_default();
        let body = payload.body.as_deref().map(clean_text).unwrap_or_default();

        if title.is_empty() && summary.is_empty() && body.is_empty() {
            return Err(DropReason::EmptyContent);
        }

        let published_at = payload.published.or(payload.updated).unwrap_or(item.fetched_at);
        if let Some(max_age) = self.max_age {
            if item.fetched_at.signed_duration_since(published_at) > max_age {
                return Err(DropReason::Stale);
            }
        }

        let canonical_url = payload
            .link
            .as_deref()
            .and_then(canonicalize_url)
            .or_else(|| payload.guid.as_deref().and_then(canonicalize_url));

        let (fingerprint, basis) = match &canonical_url {
            Some(url) => (url_fingerprint(url), FingerprintBasis::CanonicalUrl),
            None if !title.is_empty() => (
                fallback_fingerprint(&title, source, published_at),
                FingerprintBasis::TitleSourceDate,
            ),
            None => return Err(DropReason::MissingIdentity),
        };

        let body = if body.is_empty() { summary.clone() } else { body };
        let summary = if summary.is_empty() {
            truncate_at_word(&body, SUMMARY_CHARS)
        } else {
            summary
        };
        let title = if title.is_empty() {
            truncate_at_word(&body, DERIVED_TITLE_CHARS)
        } else {
            title
        };

        let content_hash = sha256_hex(&format!("{title}\n{body}"));

        Ok(Article {
            fingerprint,
            basis,
            source_id: source.id.clone(),
            discipline: source.discipline,
            title,
            summary,
            body,
            canonical_url,
            published_at,
            first_seen_at: item.fetched_at,
            last_seen_at: item.fetched_at,
            content_hash,
            state: ProcessingState::Pending,
        })
    }
}

/// Strips markup, decodes entities and collapses whitespace.
pub fn clean_text(raw: &str) -> String {
    let stripped = TAGS.replace_all(raw, " ");
    let decoded = html_escape::decode_html_entities(&stripped);
    WHITESPACE.replace_all(&decoded, " ").trim().to_string()
}

/// Canonical form of an article link, or `None` if it is not an http(s) URL.
pub fn canonicalize_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    let mut out = format!("https://{host}");
    if let Some(port) = url.port().filter(|p| *p != 80 && *p != 443) {
        let _ = write!(out, ":{port}");
    }
    out.push_str(url.path().trim_end_matches('/'));
    if !params.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&params)
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    Some(out)
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

pub fn url_fingerprint(canonical_url: &str) -> Fingerprint {
    Fingerprint::new(sha256_hex(&format!("url:{canonical_url}")))
}

/// Weaker identity for entries without a usable link.
pub fn fallback_fingerprint(title: &str, source: &Source, published_at: DateTime<Utc>) -> Fingerprint {
    let title = WHITESPACE.replace_all(&title.to_lowercase(), " ").trim().to_string();
    Fingerprint::new(sha256_hex(&format!(
        "fallback:{title}|{}|{}",
        source.id,
        published_at.format("%Y-%m-%d")
    )))
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

fn truncate_at_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    let trimmed = match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > cut.len() / 2 => &cut[..idx],
        _ => cut.as_str(),
    };
    format!("{}…", trimmed.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_strips_markup() {
        assert_eq!(
            clean_text("<p>Tom &amp; Jerry</p>\n<script>x()</script><b>made   peace</b>"),
            "Tom & Jerry made peace"
        );
    }

    #[test]
    fn canonical_url_drops_noise() {
        assert_eq!(
            canonicalize_url("http://WWW.Example.com/story/?utm_source=rss&b=2&a=1&fbclid=x#comments").as_deref(),
            Some("https://example.com/story?a=1&b=2")
        );
        assert_eq!(canonicalize_url("https://example.com/").as_deref(), Some("https://example.com"));
        assert_eq!(canonicalize_url("mailto:someone@example.com"), None);
        assert_eq!(canonicalize_url("urn:uuid:1234"), None);
    }

    #[test]
    fn truncation_prefers_word_boundaries() {
        let text = "one two three four five six seven";
        assert_eq!(truncate_at_word(text, 12), "one two…");
        assert_eq!(truncate_at_word("short", 12), "short");
    }
}
