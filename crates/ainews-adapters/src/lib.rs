//! Source adapter contracts, the concrete feed/archive adapters, and the
//! page image resolver they share with the repair sweep.

use std::sync::Arc;

use ainews_core::{RawItem, Source};
use ainews_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use futures::stream::BoxStream;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod images;
pub mod rss;
pub mod rundown;

pub use images::{ImageCandidate, ImageError, ImageResolver, ImageStrategy, ResolvedImage};
pub use rss::RssFeedAdapter;
pub use rundown::RundownArchiveAdapter;

pub const CRATE_NAME: &str = "ainews-adapters";

/// Order in which an adapter yields items. Only `NewestFirst` sources may be
/// cut short at the first stale item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOrdering {
    NewestFirst,
    Unordered,
}

/// Adapter family, as named in `sources.yaml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rss,
    HtmlArchive,
}

/// Settings an adapter is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSpec {
    pub source: Source,
    pub kind: SourceKind,
    pub url: String,
    pub default_author: Option<String>,
    pub default_tags: Vec<String>,
    pub max_items: Option<usize>,
}

/// Fallbacks applied to every item of one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDefaults {
    pub author: Option<String>,
    pub tags: Vec<String>,
}

impl ItemDefaults {
    pub fn from_spec(spec: &AdapterSpec) -> Self {
        Self {
            author: spec.default_author.clone(),
            tags: spec.default_tags.clone(),
        }
    }
}

/// Whole-source failure: the source contributes nothing this run.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("unreadable feed at {url}: {reason}")]
    Feed { url: String, reason: String },
    #[error("invalid source url {0:?}")]
    InvalidUrl(String),
}

/// One bad item; the stream carries on after it.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("malformed item {subject}: {reason}")]
    Malformed { subject: String, reason: String },
}

impl ItemError {
    /// Url or title identifying the skipped item.
    pub fn subject(&self) -> &str {
        match self {
            ItemError::Fetch { url, .. } => url,
            ItemError::Malformed { subject, .. } => subject,
        }
    }
}

/// Lazy, finite, single-use sequence of raw items.
pub type ItemStream = BoxStream<'static, Result<RawItem, ItemError>>;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;
    fn ordering(&self) -> ItemOrdering;

    /// Performs the source-level fetch; per-item work happens as the stream
    /// is polled.
    async fn open(&self, http: Arc<HttpFetcher>) -> Result<ItemStream, AdapterError>;
}

pub fn build_adapter(spec: &AdapterSpec) -> Box<dyn SourceAdapter> {
    match spec.kind {
        SourceKind::Rss => Box::new(RssFeedAdapter::from_spec(spec)),
        SourceKind::HtmlArchive => Box::new(RundownArchiveAdapter::from_spec(spec)),
    }
}

/// Resolves `raw` (absolute, protocol-relative, root-relative, or relative)
/// against `base`; only http(s) results are returned.
pub fn resolve_url(base: &Url, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    let joined = base.join(raw).ok()?;
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}

/// Collapses runs of whitespace; `None` when nothing is left.
pub(crate) fn clean_text(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

pub(crate) fn element_text(el: ElementRef<'_>) -> Option<String> {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    document.select(&sel).find_map(element_text)
}

pub(crate) fn select_first_attr(document: &Html, css: &str, attr: &str) -> Option<String> {
    let sel = selector(css)?;
    document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .find_map(clean_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_url_handles_relative_forms() {
        let base = Url::parse("https://www.therundown.ai/p/issue-1").unwrap();
        assert_eq!(
            resolve_url(&base, "//cdn.example.com/a.png").as_deref(),
            Some("https://cdn.example.com/a.png")
        );
        assert_eq!(
            resolve_url(&base, "/images/b.png").as_deref(),
            Some("https://www.therundown.ai/images/b.png")
        );
        assert_eq!(
            resolve_url(&base, "https://other.org/c.jpg").as_deref(),
            Some("https://other.org/c.jpg")
        );
        assert_eq!(resolve_url(&base, "data:image/png;base64,AAAA"), None);
        assert_eq!(resolve_url(&base, "   "), None);
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  a \n\t b  ").as_deref(), Some("a b"));
        assert_eq!(clean_text(" \n "), None);
    }

    #[test]
    fn build_adapter_picks_family_by_kind() {
        let spec = AdapterSpec {
            source: Source::Rundown,
            kind: SourceKind::HtmlArchive,
            url: "https://www.therundown.ai/archive".to_string(),
            default_author: None,
            default_tags: Vec::new(),
            max_items: None,
        };
        let adapter = build_adapter(&spec);
        assert_eq!(adapter.source(), Source::Rundown);
        assert_eq!(adapter.ordering(), ItemOrdering::NewestFirst);

        let feed = build_adapter(&AdapterSpec {
            source: Source::BensBites,
            kind: SourceKind::Rss,
            ..spec
        });
        assert_eq!(feed.ordering(), ItemOrdering::Unordered);
    }
}
