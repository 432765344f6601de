//! Core domain model for AI news ingestion: raw scrape handoff types, the
//! canonical article/enrichment records, and the run-issue taxonomy.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ainews-core";

/// Placeholder used when a source gives no usable title.
pub const UNTITLED: &str = "Untitled";

/// Origin tag, one per source adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "bensbites")]
    BensBites,
    #[serde(rename = "rundown")]
    Rundown,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::BensBites, Source::Rundown];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::BensBites => "bensbites",
            Source::Rundown => "rundown",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .into_iter()
            .find(|source| source.as_str() == s.trim())
            .ok_or_else(|| ModelError::UnknownSource(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("unknown source tag {0:?}")]
    UnknownSource(String),
    #[error("article url is empty")]
    EmptyUrl,
    #[error("article url {url:?} is not an absolute http(s) url")]
    InvalidUrl { url: String },
}

/// Publish time as the adapter found it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawTimestamp {
    Parsed(DateTime<Utc>),
    Text(String),
}

/// Sub-item scraped from inside one source page, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEnrichment {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub image_url: Option<String>,
}

/// Handoff contract from adapters into the normalizer.
///
/// `enrichments` is `None` when the source never bundles sub-items (or found
/// none); `Some` asks the upsert engine to replace the stored set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub published: Option<RawTimestamp>,
    pub summary: Option<String>,
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub image_url: Option<String>,
    pub enrichments: Option<Vec<RawEnrichment>>,
}

/// Canonical article record. `url` is the natural identity and conflict key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub source: Source,
    pub url: String,
    pub title: String,
    pub summary: String,
    pub author: String,
    pub published_date: DateTime<Utc>,
    pub image_url: Option<String>,
    pub tags: BTreeSet<String>,
}

impl Article {
    /// Builds an article with empty text fields, validating the identity url.
    pub fn new(
        source: Source,
        url: &str,
        published_date: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            source,
            url: validate_article_url(url)?,
            title: UNTITLED.to_string(),
            summary: String::new(),
            author: String::new(),
            published_date,
            image_url: None,
            tags: BTreeSet::new(),
        })
    }
}

/// Checks that `raw` is an absolute http(s) url and returns it trimmed.
pub fn validate_article_url(raw: &str) -> Result<String, ModelError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ModelError::EmptyUrl);
    }
    match Url::parse(trimmed) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => {
            Ok(trimmed.to_string())
        }
        _ => Err(ModelError::InvalidUrl {
            url: trimmed.to_string(),
        }),
    }
}

/// One news blurb inside an article; `position` is its zero-based order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrichment {
    pub title: String,
    pub summary: String,
    pub content: String,
    pub image_url: Option<String>,
    pub position: u32,
}

/// An article plus the enrichment set that should replace the stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleBundle {
    pub article: Article,
    pub enrichments: Option<Vec<Enrichment>>,
}

impl ArticleBundle {
    pub fn new(article: Article) -> Self {
        Self {
            article,
            enrichments: None,
        }
    }

    pub fn with_enrichments(mut self, enrichments: Vec<Enrichment>) -> Self {
        self.enrichments = Some(enrichments);
        self
    }
}

/// Failure taxonomy shared by every stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    ParseSkip,
    ImageUnresolved,
    DatastoreConflictHandled,
    DatastoreWriteFailed,
    RunTimeout,
}

impl ErrorKind {
    /// Only a timeout turns a run into a non-success outcome.
    pub fn fails_run(&self) -> bool {
        matches!(self, ErrorKind::RunTimeout)
    }
}

/// A recorded, non-fatal (or timeout) condition surfaced in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIssue {
    pub kind: ErrorKind,
    pub source: Option<Source>,
    pub subject: Option<String>,
    pub detail: String,
}

impl RunIssue {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            source: None,
            subject: None,
            detail: detail.into(),
        }
    }

    pub fn for_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn about(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// Identifier of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 28, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn source_tags_round_trip_through_their_wire_names() {
        for source in Source::ALL {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert_eq!(
            serde_json::to_string(&Source::BensBites).unwrap(),
            "\"bensbites\""
        );
        assert!("techcrunch".parse::<Source>().is_err());
    }

    #[test]
    fn article_requires_absolute_http_url() {
        assert_eq!(
            Article::new(Source::Rundown, "  ", ts()).unwrap_err(),
            ModelError::EmptyUrl
        );
        assert!(matches!(
            Article::new(Source::Rundown, "/p/issue-1", ts()),
            Err(ModelError::InvalidUrl { .. })
        ));
        assert!(matches!(
            Article::new(Source::Rundown, "ftp://example.com/x", ts()),
            Err(ModelError::InvalidUrl { .. })
        ));

        let article = Article::new(Source::Rundown, " https://www.therundown.ai/p/x ", ts()).unwrap();
        assert_eq!(article.url, "https://www.therundown.ai/p/x");
        assert_eq!(article.title, UNTITLED);
        assert!(article.summary.is_empty());
        assert!(article.image_url.is_none());
    }

    #[test]
    fn article_serializes_tags_in_stable_order() {
        let mut article = Article::new(Source::BensBites, "https://bensbites.com/p/a", ts()).unwrap();
        article.tags.insert("News".into());
        article.tags.insert("AI".into());
        let row = serde_json::to_value(&article).unwrap();
        assert_eq!(row["tags"], serde_json::json!(["AI", "News"]));
        assert_eq!(row["source"], "bensbites");
        assert_eq!(row["published_date"], "2026-01-28T09:00:00Z");
    }

    #[test]
    fn only_timeouts_fail_a_run() {
        assert!(ErrorKind::RunTimeout.fails_run());
        assert!(!ErrorKind::SourceUnavailable.fails_run());
        assert!(!ErrorKind::DatastoreWriteFailed.fails_run());
    }
}
