//! Raw adapter items to canonical bundles.
//!
//! `normalize` is pure and fills every default; `complete_image` is the one
//! networked step and only runs for items that are worth keeping.

use ainews_adapters::{resolve_url, ImageResolver, ImageStrategy};
use ainews_core::{
    Article, ArticleBundle, Enrichment, ModelError, RawEnrichment, RawItem, RawTimestamp, Source,
    UNTITLED,
};
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("item {title:?} has no link")]
    MissingLink { title: Option<String> },
    #[error(transparent)]
    InvalidUrl(#[from] ModelError),
}

impl RejectReason {
    pub fn subject(&self) -> String {
        match self {
            RejectReason::MissingLink { title } => {
                title.clone().unwrap_or_else(|| UNTITLED.to_string())
            }
            RejectReason::InvalidUrl(ModelError::InvalidUrl { url }) => url.clone(),
            RejectReason::InvalidUrl(other) => other.to_string(),
        }
    }
}

/// Builds the canonical bundle for one raw item. Only the link is mandatory;
/// a missing or unreadable timestamp becomes `now`.
pub fn normalize(
    source: Source,
    item: RawItem,
    now: DateTime<Utc>,
) -> Result<ArticleBundle, RejectReason> {
    let link = item
        .link
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RejectReason::MissingLink {
            title: item.title.clone(),
        })?;

    let published = item
        .published
        .as_ref()
        .and_then(parse_timestamp)
        .unwrap_or(now);
    let mut article = Article::new(source, link, published)?;
    let base = Url::parse(&article.url).ok();

    if let Some(title) = non_blank(item.title) {
        article.title = title;
    }
    article.summary = non_blank(item.summary).unwrap_or_default();
    article.author = non_blank(item.author).unwrap_or_default();
    article.tags = item
        .tags
        .iter()
        .filter_map(|t| non_blank(Some(t.clone())))
        .collect();
    article.image_url = item
        .image_url
        .as_deref()
        .and_then(|raw| base.as_ref().and_then(|b| resolve_url(b, raw)));

    let bundle = ArticleBundle::new(article);
    Ok(match item.enrichments {
        Some(raw) => {
            let enrichments = normalize_enrichments(raw, base.as_ref());
            bundle.with_enrichments(enrichments)
        }
        None => bundle,
    })
}

/// Renumbers positions `0..n` in discovery order.
pub fn normalize_enrichments(raw: Vec<RawEnrichment>, base: Option<&Url>) -> Vec<Enrichment> {
    raw.into_iter()
        .zip(0u32..)
        .map(|(e, position)| Enrichment {
            title: non_blank(e.title).unwrap_or_else(|| UNTITLED.to_string()),
            summary: non_blank(e.summary).unwrap_or_default(),
            content: non_blank(e.content).unwrap_or_default(),
            image_url: e
                .image_url
                .as_deref()
                .and_then(|raw| base.and_then(|b| resolve_url(b, raw))),
            position,
        })
        .collect()
}

/// Accepts RFC 3339, RFC 2822, and newsletter dates such as `Jan 28, 2026`
/// (taken as midnight UTC).
pub fn parse_timestamp(raw: &RawTimestamp) -> Option<DateTime<Utc>> {
    let text = match raw {
        RawTimestamp::Parsed(ts) => return Some(*ts),
        RawTimestamp::Text(text) => text.trim(),
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
        return Some(ts.with_timezone(&Utc));
    }
    let plain = text.replace('.', "");
    ["%b %d, %Y", "%B %d, %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&plain, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    FromFeed,
    Resolved(ImageStrategy),
    Unresolved(String),
}

/// Fills a missing article image from the article page. Never fails; an
/// unresolved image is reported and the article keeps `None`.
pub async fn complete_image(bundle: &mut ArticleBundle, resolver: &ImageResolver) -> ImageOutcome {
    if bundle.article.image_url.is_some() {
        return ImageOutcome::FromFeed;
    }
    match resolver.resolve(&bundle.article.url).await {
        Ok(found) => {
            bundle.article.image_url = Some(found.url);
            ImageOutcome::Resolved(found.strategy)
        }
        Err(err) => ImageOutcome::Unresolved(err.to_string()),
    }
}
