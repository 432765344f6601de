use std::sync::Arc;

use ainews_core::{RawEnrichment, RawItem, RawTimestamp, Source};
use ainews_storage::HttpFetcher;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::{debug, info};
use url::Url;

use crate::{
    element_text, resolve_url, select_first_attr, select_first_text, selector, AdapterError,
    AdapterSpec, ItemDefaults, ItemError, ItemOrdering, ItemStream, SourceAdapter,
};

pub const DEFAULT_MAX_ISSUES: usize = 5;

const ISSUE_LINK: &str = "a.embla__slide__number";
const STORY_HEADER: &str = "h4.hynlcx1.hynlcx5";
const MAX_STORY_BLOCKS: usize = 20;
const MIN_BLOCK_CHARS: usize = 10;
const MAX_SUMMARY_CHARS: usize = 500;
const DATE_PATTERN: &str =
    r"(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\.?\s+\d{1,2},\s+\d{4}";
const STORY_SUMMARY_PATTERN: &str = r"(?is)The Rundown:\s*(.+?)(?:The details:|Why it matters:|$)";

/// Newsletter archive: one listing page linking to issue pages, newest first.
/// Issue pages are fetched lazily as the stream is polled, so a consumer that
/// stops early never requests older issues.
#[derive(Debug, Clone)]
pub struct RundownArchiveAdapter {
    source: Source,
    archive_url: String,
    defaults: ItemDefaults,
    max_issues: usize,
}

impl RundownArchiveAdapter {
    pub fn new(source: Source, archive_url: impl Into<String>) -> Self {
        Self {
            source,
            archive_url: archive_url.into(),
            defaults: ItemDefaults::default(),
            max_issues: DEFAULT_MAX_ISSUES,
        }
    }

    pub fn from_spec(spec: &AdapterSpec) -> Self {
        Self {
            source: spec.source,
            archive_url: spec.url.clone(),
            defaults: ItemDefaults::from_spec(spec),
            max_issues: spec.max_items.unwrap_or(DEFAULT_MAX_ISSUES),
        }
    }

    pub fn with_defaults(mut self, defaults: ItemDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_max_issues(mut self, max_issues: usize) -> Self {
        self.max_issues = max_issues;
        self
    }
}

#[async_trait]
impl SourceAdapter for RundownArchiveAdapter {
    fn source(&self) -> Source {
        self.source
    }

    fn ordering(&self) -> ItemOrdering {
        ItemOrdering::NewestFirst
    }

    async fn open(&self, http: Arc<HttpFetcher>) -> Result<ItemStream, AdapterError> {
        let archive_url = Url::parse(&self.archive_url)
            .map_err(|_| AdapterError::InvalidUrl(self.archive_url.clone()))?;
        let response = http
            .fetch(archive_url.as_str())
            .await
            .map_err(|source| AdapterError::Fetch {
                url: self.archive_url.clone(),
                source,
            })?;

        let mut links = parse_archive_links(&response.text(), &archive_url);
        links.truncate(self.max_issues);
        info!(source = %self.source, issues = links.len(), "archive parsed");

        let defaults = Arc::new(self.defaults.clone());
        let issues = stream::iter(links).then(move |link| {
            let http = Arc::clone(&http);
            let defaults = Arc::clone(&defaults);
            async move { fetch_issue(&http, link, &defaults).await }
        });
        Ok(issues.boxed())
    }
}

async fn fetch_issue(
    http: &HttpFetcher,
    url: String,
    defaults: &ItemDefaults,
) -> Result<RawItem, ItemError> {
    let response = http.fetch(&url).await.map_err(|source| ItemError::Fetch {
        url: url.clone(),
        source,
    })?;
    parse_issue_page(&response.text(), &url, defaults)
}

/// Issue links in archive order, resolved against the archive url, without
/// repeats.
pub fn parse_archive_links(html: &str, archive_url: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let Some(sel) = selector(ISSUE_LINK) else {
        return Vec::new();
    };
    let mut links: Vec<String> = Vec::new();
    for href in document
        .select(&sel)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| resolve_url(archive_url, href))
    {
        if !links.contains(&href) {
            links.push(href);
        }
    }
    links
}

pub fn parse_issue_page(
    html: &str,
    page_url: &str,
    defaults: &ItemDefaults,
) -> Result<RawItem, ItemError> {
    let base = Url::parse(page_url).map_err(|e| ItemError::Malformed {
        subject: page_url.to_string(),
        reason: format!("bad issue url: {e}"),
    })?;
    let document = Html::parse_document(html);

    let published = find_date_text(&document).map(RawTimestamp::Text);
    if published.is_none() {
        debug!(url = page_url, "issue page has no recognisable date");
    }

    let summary = select_first_text(&document, "h3").or_else(|| select_first_text(&document, "p"));
    let image_url = select_first_attr(&document, "img[src]", "src")
        .and_then(|src| resolve_url(&base, &src));
    let enrichments = extract_enrichments(&document, &base);

    Ok(RawItem {
        title: select_first_text(&document, "h1"),
        link: Some(page_url.to_string()),
        published,
        summary,
        author: defaults.author.clone(),
        tags: defaults.tags.clone(),
        image_url,
        enrichments: (!enrichments.is_empty()).then_some(enrichments),
    })
}

fn find_date_text(document: &Html) -> Option<String> {
    let pattern = Regex::new(DATE_PATTERN).ok()?;
    let spans = selector("span")?;
    document
        .select(&spans)
        .filter_map(element_text)
        .find_map(|text| pattern.find(&text).map(|m| m.as_str().to_string()))
}

/// One enrichment per story header. A story's body is the run of siblings
/// after the header's container, up to the next story header.
pub fn extract_enrichments(document: &Html, base: &Url) -> Vec<RawEnrichment> {
    let (Some(header_sel), Some(img_sel)) = (selector(STORY_HEADER), selector("img[src]")) else {
        return Vec::new();
    };
    let summary_pattern = Regex::new(STORY_SUMMARY_PATTERN).ok();

    document
        .select(&header_sel)
        .map(|header| {
            let mut blocks: Vec<String> = Vec::new();
            let mut image_url = None;

            let siblings = header
                .parent()
                .into_iter()
                .flat_map(|parent| parent.next_siblings())
                .filter_map(ElementRef::wrap);
            for sibling in siblings {
                if blocks.len() >= MAX_STORY_BLOCKS {
                    break;
                }
                if sibling.value().name() == "h4" || sibling.select(&header_sel).next().is_some()
                {
                    break;
                }
                if image_url.is_none() {
                    image_url = std::iter::once(sibling)
                        .filter(|el| el.value().name() == "img")
                        .chain(sibling.select(&img_sel))
                        .filter_map(|img| img.value().attr("src"))
                        .find_map(|src| resolve_url(base, src));
                }
                if let Some(text) = element_text(sibling) {
                    if text.chars().count() > MIN_BLOCK_CHARS {
                        blocks.push(text);
                    }
                }
            }

            let content = blocks.join("\n\n");
            let summary = summary_pattern
                .as_ref()
                .and_then(|re| re.captures(&content))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty())
                .or_else(|| blocks.first().cloned())
                .map(|s| truncate_chars(&s, MAX_SUMMARY_CHARS));

            RawEnrichment {
                title: element_text(header),
                summary,
                content: (!content.is_empty()).then_some(content),
                image_url,
            }
        })
        .collect()
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
