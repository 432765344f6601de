use std::sync::Arc;

use ainews_core::{RawItem, RawTimestamp, Source};
use ainews_storage::HttpFetcher;
use async_trait::async_trait;
use feed_rs::model::Entry;
use futures::stream::{self, StreamExt};
use scraper::Html;
use tracing::{debug, info};

use crate::{
    clean_text, select_first_attr, AdapterError, AdapterSpec, ItemDefaults, ItemError,
    ItemOrdering, ItemStream, SourceAdapter,
};

/// RSS/Atom feed adapter. Feeds make no ordering promise, so every entry is
/// checked against the freshness window.
#[derive(Debug, Clone)]
pub struct RssFeedAdapter {
    source: Source,
    feed_url: String,
    defaults: ItemDefaults,
    max_items: Option<usize>,
}

impl RssFeedAdapter {
    pub fn new(source: Source, feed_url: impl Into<String>) -> Self {
        Self {
            source,
            feed_url: feed_url.into(),
            defaults: ItemDefaults::default(),
            max_items: None,
        }
    }

    pub fn from_spec(spec: &AdapterSpec) -> Self {
        Self {
            source: spec.source,
            feed_url: spec.url.clone(),
            defaults: ItemDefaults::from_spec(spec),
            max_items: spec.max_items,
        }
    }

    pub fn with_defaults(mut self, defaults: ItemDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }
}

#[async_trait]
impl SourceAdapter for RssFeedAdapter {
    fn source(&self) -> Source {
        self.source
    }

    fn ordering(&self) -> ItemOrdering {
        ItemOrdering::Unordered
    }

    async fn open(&self, http: Arc<HttpFetcher>) -> Result<ItemStream, AdapterError> {
        let response = http
            .fetch(&self.feed_url)
            .await
            .map_err(|source| AdapterError::Fetch {
                url: self.feed_url.clone(),
                source,
            })?;
        let mut items =
            parse_feed(&response.body, &self.defaults).map_err(|reason| AdapterError::Feed {
                url: self.feed_url.clone(),
                reason,
            })?;
        if let Some(max) = self.max_items {
            items.truncate(max);
        }
        info!(source = %self.source, entries = items.len(), "feed parsed");
        Ok(stream::iter(items).boxed())
    }
}

/// Parses a whole feed document. The outer error means the document itself is
/// unreadable; entries that cannot become items are returned as `Err` in place.
pub fn parse_feed(
    bytes: &[u8],
    defaults: &ItemDefaults,
) -> Result<Vec<Result<RawItem, ItemError>>, String> {
    let feed = feed_rs::parser::parse(bytes).map_err(|e| e.to_string())?;
    Ok(feed
        .entries
        .into_iter()
        .map(|entry| entry_to_item(entry, defaults))
        .collect())
}

fn entry_to_item(entry: Entry, defaults: &ItemDefaults) -> Result<RawItem, ItemError> {
    let title = entry.title.as_ref().and_then(|t| clean_text(&t.content));
    let Some(link) = entry
        .links
        .iter()
        .find_map(|l| clean_text(&l.href))
    else {
        let subject = title
            .clone()
            .or_else(|| clean_text(&entry.id))
            .unwrap_or_else(|| "<untitled entry>".to_string());
        debug!(%subject, "feed entry without link");
        return Err(ItemError::Malformed {
            subject,
            reason: "entry has no link".to_string(),
        });
    };

    let content_html = entry.content.as_ref().and_then(|c| c.body.clone());
    let summary = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .or_else(|| content_html.clone())
        .and_then(|html| html_to_text(&html));

    let author = entry
        .authors
        .iter()
        .find_map(|p| clean_text(&p.name))
        .or_else(|| defaults.author.clone());

    let mut tags: Vec<String> = entry
        .categories
        .iter()
        .filter_map(|c| clean_text(c.label.as_deref().unwrap_or(&c.term)))
        .collect();
    if tags.is_empty() {
        tags = defaults.tags.clone();
    }

    let image_url = media_image(&entry).or_else(|| {
        content_html
            .as_deref()
            .or(entry.summary.as_ref().map(|s| s.content.as_str()))
            .and_then(first_img_src)
    });

    Ok(RawItem {
        title,
        link: Some(link),
        published: entry.published.or(entry.updated).map(RawTimestamp::Parsed),
        summary,
        author,
        tags,
        image_url,
        enrichments: None,
    })
}

/// `media:content` first, then `media:thumbnail`.
fn media_image(entry: &Entry) -> Option<String> {
    let content = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter())
        .find_map(|c| c.url.as_ref().map(|u| u.to_string()));
    content.or_else(|| {
        entry
            .media
            .iter()
            .flat_map(|m| m.thumbnails.iter())
            .find_map(|t| clean_text(&t.image.uri))
    })
}

fn first_img_src(html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(html);
    select_first_attr(&fragment, "img[src]", "src")
}

fn html_to_text(html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(html);
    clean_text(&fragment.root_element().text().collect::<Vec<_>>().join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainews_storage::HttpClientConfig;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/" xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>Digest</title>
    <link>https://news.example.com</link>
    <description>daily</description>
    <item>
      <title>Model launch</title>
      <link>https://news.example.com/p/model-launch</link>
      <pubDate>Wed, 28 Jan 2026 08:00:00 GMT</pubDate>
      <description><![CDATA[<p>A <b>new</b> model.</p>]]></description>
      <category>AI</category>
      <category>Models</category>
      <media:content url="https://cdn.example.com/launch.png" medium="image"/>
    </item>
    <item>
      <title>Chip news</title>
      <link>https://news.example.com/p/chips</link>
      <content:encoded><![CDATA[<p>Fabs.</p><img src="/img/chip.jpg"/>]]></content:encoded>
    </item>
    <item>
      <title>No link here</title>
    </item>
  </channel>
</rss>"#;

    fn defaults() -> ItemDefaults {
        ItemDefaults {
            author: Some("Ben Tossell".to_string()),
            tags: vec!["Newsletter".to_string()],
        }
    }

    #[test]
    fn entries_map_to_raw_items_with_fallbacks() {
        let items = parse_feed(FEED.as_bytes(), &defaults()).unwrap();
        assert_eq!(items.len(), 3);

        let first = items[0].as_ref().unwrap();
        assert_eq!(first.title.as_deref(), Some("Model launch"));
        assert_eq!(first.link.as_deref(), Some("https://news.example.com/p/model-launch"));
        assert_eq!(first.summary.as_deref(), Some("A new model."));
        assert_eq!(first.author.as_deref(), Some("Ben Tossell"));
        assert_eq!(first.tags, vec!["AI".to_string(), "Models".to_string()]);
        assert_eq!(first.image_url.as_deref(), Some("https://cdn.example.com/launch.png"));
        match &first.published {
            Some(RawTimestamp::Parsed(ts)) => {
                assert_eq!(ts.to_rfc3339(), "2026-01-28T08:00:00+00:00")
            }
            other => panic!("unexpected timestamp {other:?}"),
        }

        let second = items[1].as_ref().unwrap();
        assert_eq!(second.tags, vec!["Newsletter".to_string()]);
        assert_eq!(second.image_url.as_deref(), Some("/img/chip.jpg"));
        assert!(second.published.is_none());
        assert!(second.enrichments.is_none());

        let err = items[2].as_ref().unwrap_err();
        assert_eq!(err.subject(), "No link here");
    }

    #[test]
    fn garbage_is_a_feed_error() {
        assert!(parse_feed(b"<html>not a feed</html>", &defaults()).is_err());
    }

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                host_delay: Duration::ZERO,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn open_streams_items_and_honours_max_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = RssFeedAdapter::new(Source::BensBites, format!("{}/feed", server.uri()))
            .with_defaults(defaults())
            .with_max_items(2);
        let items: Vec<_> = adapter.open(fetcher()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.is_ok()));
    }

    #[tokio::test]
    async fn server_error_is_a_source_level_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = RssFeedAdapter::new(Source::BensBites, format!("{}/feed", server.uri()));
        let err = match adapter.open(fetcher()).await {
            Err(err) => err,
            Ok(_) => panic!("expected failure"),
        };
        assert!(matches!(err, AdapterError::Fetch { .. }));
    }
}
