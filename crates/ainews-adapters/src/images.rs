//! Representative-image lookup for a page.
//!
//! Candidates are gathered per strategy in a fixed priority order and probed
//! with a single `HEAD` each; the first reachable candidate wins and nothing
//! below it is probed.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use ainews_storage::{FetchError, HttpFetcher};
use scraper::Html;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use url::Url;

use crate::{resolve_url, select_first_attr};

const FEATURED_CLASSES: [&str; 3] = ["featured-image", "post-image", "hero-image"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageStrategy {
    OpenGraph,
    TwitterCard,
    MainContent,
    FeaturedClass,
}

impl ImageStrategy {
    pub const ORDER: [ImageStrategy; 4] = [
        ImageStrategy::OpenGraph,
        ImageStrategy::TwitterCard,
        ImageStrategy::MainContent,
        ImageStrategy::FeaturedClass,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStrategy::OpenGraph => "open_graph",
            ImageStrategy::TwitterCard => "twitter_card",
            ImageStrategy::MainContent => "main_content",
            ImageStrategy::FeaturedClass => "featured_class",
        }
    }

    /// Raw attribute value this strategy finds in the document, if any.
    fn locate(&self, document: &Html) -> Option<String> {
        match self {
            ImageStrategy::OpenGraph => {
                select_first_attr(document, r#"meta[property="og:image"]"#, "content")
            }
            ImageStrategy::TwitterCard => {
                select_first_attr(document, r#"meta[name="twitter:image"]"#, "content")
                    .or_else(|| {
                        select_first_attr(document, r#"meta[property="twitter:image"]"#, "content")
                    })
            }
            ImageStrategy::MainContent => select_first_attr(document, "article img[src]", "src")
                .or_else(|| select_first_attr(document, "main img[src]", "src")),
            ImageStrategy::FeaturedClass => FEATURED_CLASSES.iter().find_map(|class| {
                select_first_attr(document, &format!("img.{class}[src]"), "src")
                    .or_else(|| select_first_attr(document, &format!(".{class} img[src]"), "src"))
            }),
        }
    }
}

impl fmt::Display for ImageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub strategy: ImageStrategy,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub strategy: ImageStrategy,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid page url {0:?}")]
    InvalidPageUrl(String),
    #[error("fetching page {url}: {source}")]
    Page {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("no image candidates on {url}")]
    NoCandidate { url: String },
    #[error("all {tried} image candidates on {url} were unreachable")]
    Unreachable { url: String, tried: usize },
}

/// At most one absolute candidate per strategy, in priority order. A url
/// found by several strategies is kept only under the highest one.
pub fn candidates(html: &str, page_url: &Url) -> Vec<ImageCandidate> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    ImageStrategy::ORDER
        .iter()
        .filter_map(|strategy| {
            let raw = strategy.locate(&document)?;
            let url = resolve_url(page_url, &raw)?;
            Some(ImageCandidate {
                strategy: *strategy,
                url,
            })
        })
        .filter(|candidate| seen.insert(candidate.url.clone()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ImageResolver {
    http: Arc<HttpFetcher>,
}

impl ImageResolver {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }

    /// Fetches `page_url` and returns the first candidate that answers a
    /// `HEAD` with a success status.
    pub async fn resolve(&self, page_url: &str) -> Result<ResolvedImage, ImageError> {
        let base =
            Url::parse(page_url).map_err(|_| ImageError::InvalidPageUrl(page_url.to_string()))?;
        async {
            let page = self
                .http
                .fetch(base.as_str())
                .await
                .map_err(|source| ImageError::Page {
                    url: page_url.to_string(),
                    source,
                })?;
            let found = candidates(&page.text(), &base);
            if found.is_empty() {
                return Err(ImageError::NoCandidate {
                    url: page_url.to_string(),
                });
            }

            let tried = found.len();
            for candidate in found {
                if self.is_reachable(&candidate.url).await {
                    debug!(strategy = %candidate.strategy, image = %candidate.url, "image resolved");
                    return Ok(ResolvedImage {
                        strategy: candidate.strategy,
                        url: candidate.url,
                    });
                }
            }
            Err(ImageError::Unreachable {
                url: page_url.to_string(),
                tried,
            })
        }
        .instrument(info_span!("resolve_image", page = page_url))
        .await
    }

    /// Single header-only probe; any error or non-success status is `false`.
    pub async fn is_reachable(&self, image_url: &str) -> bool {
        match self.http.probe(image_url).await {
            Ok(_) => true,
            Err(err) => {
                debug!(image = image_url, error = %err, "image candidate rejected");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainews_storage::HttpClientConfig;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver() -> ImageResolver {
        ImageResolver::new(Arc::new(
            HttpFetcher::new(HttpClientConfig {
                host_delay: Duration::ZERO,
                ..Default::default()
            })
            .unwrap(),
        ))
    }

    #[test]
    fn candidates_follow_priority_order_and_resolve_relative_urls() {
        let html = r#"<html><head>
            <meta name="twitter:image" content="//cdn.example.com/tw.png">
            <meta property="og:image" content="/og.png">
          </head><body>
            <img class="hero-image" src="hero.png">
            <article><p>x</p><img src="/body.png"></article>
          </body></html>"#;
        let page = Url::parse("https://news.example.com/p/story").unwrap();
        let found = candidates(html, &page);
        assert_eq!(
            found,
            vec![
                ImageCandidate {
                    strategy: ImageStrategy::OpenGraph,
                    url: "https://news.example.com/og.png".into()
                },
                ImageCandidate {
                    strategy: ImageStrategy::TwitterCard,
                    url: "https://cdn.example.com/tw.png".into()
                },
                ImageCandidate {
                    strategy: ImageStrategy::MainContent,
                    url: "https://news.example.com/body.png".into()
                },
                ImageCandidate {
                    strategy: ImageStrategy::FeaturedClass,
                    url: "https://news.example.com/p/hero.png".into()
                },
            ]
        );
    }

    #[test]
    fn main_content_falls_back_to_main_element() {
        let html = r#"<main><img src="https://cdn.example.com/main.jpg"></main>"#;
        let page = Url::parse("https://news.example.com/").unwrap();
        let found = candidates(html, &page);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].strategy, ImageStrategy::MainContent);
    }

    #[tokio::test]
    async fn twitter_card_wins_when_open_graph_is_missing() {
        let server = MockServer::start().await;
        let page = r#"<html><head><meta name="twitter:image" content="/tw.png"></head>
               <body><article><img src="/body.png"></article>
               <img class="featured-image" src="/featured.png"></body></html>"#;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/tw.png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/body.png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/featured.png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let resolved = resolver()
            .resolve(&format!("{}/story", server.uri()))
            .await
            .unwrap();
        assert_eq!(resolved.strategy, ImageStrategy::TwitterCard);
        assert_eq!(resolved.url, format!("{}/tw.png", server.uri()));
    }

    #[tokio::test]
    async fn unreachable_candidates_fall_through_once_each() {
        let server = MockServer::start().await;
        let page = r#"<meta property="og:image" content="/gone.png">
                      <article><img src="/ok.png"></article>"#;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/gone.png"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/ok.png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let resolved = resolver()
            .resolve(&format!("{}/story", server.uri()))
            .await
            .unwrap();
        assert_eq!(resolved.strategy, ImageStrategy::MainContent);
    }

    #[test]
    fn shared_urls_are_kept_under_the_first_strategy() {
        let html = r#"<meta property="og:image" content="/same.png">
                      <meta name="twitter:image" content="https://news.example.com/same.png">
                      <article><img src="/body.png"></article>"#;
        let page = Url::parse("https://news.example.com/p/story").unwrap();
        let found = candidates(html, &page);
        assert_eq!(
            found
                .iter()
                .map(|c| (c.strategy, c.url.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (ImageStrategy::OpenGraph, "https://news.example.com/same.png"),
                (ImageStrategy::MainContent, "https://news.example.com/body.png"),
            ]
        );
    }

    #[tokio::test]
    async fn a_dead_url_shared_by_strategies_is_checked_once() {
        let server = MockServer::start().await;
        let page = r#"<meta property="og:image" content="/dead.png">
                      <meta name="twitter:image" content="/dead.png">
                      <img class="post-image" src="/dead.png">"#;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/dead.png"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = resolver()
            .resolve(&format!("{}/story", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Unreachable { tried: 1, .. }));
    }

    #[tokio::test]
    async fn page_errors_and_bare_pages_are_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bare"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>text only</p>"))
            .mount(&server)
            .await;

        let resolver = resolver();
        assert!(matches!(
            resolver.resolve(&format!("{}/missing", server.uri())).await,
            Err(ImageError::Page { .. })
        ));
        assert!(matches!(
            resolver.resolve(&format!("{}/bare", server.uri())).await,
            Err(ImageError::NoCandidate { .. })
        ));
        assert!(matches!(
            resolver.resolve("not a url").await,
            Err(ImageError::InvalidPageUrl(_))
        ));
    }
}
