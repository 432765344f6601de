//! Out-of-band image repair for stored rows.
//!
//! Articles are re-resolved from their own page; enrichments from their
//! parent article's page. Each page is resolved at most once per sweep.

use std::collections::HashMap;
use std::sync::Arc;

use ainews_adapters::ImageResolver;
use ainews_storage::{query_all, Datastore, DatastoreError, Filter, Row, RowId, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::upsert::{ARTICLES_TABLE, ENRICHMENTS_TABLE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairOptions {
    /// Also probe images that are already set and replace dead ones.
    pub verify_existing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRepair {
    pub checked: usize,
    pub broken: usize,
    pub fixed: usize,
    pub unresolved: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub articles: TableRepair,
    pub enrichments: TableRepair,
}

pub struct ImageRepair {
    store: Arc<dyn Datastore>,
    resolver: ImageResolver,
    page_size: usize,
}

impl ImageRepair {
    pub fn new(store: Arc<dyn Datastore>, resolver: ImageResolver) -> Self {
        Self {
            store,
            resolver,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Rows fetched per listing request; keep it at or below the server's
    /// row cap.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Listing failures abort the sweep; per-row failures are counted.
    pub async fn run(&self, options: RepairOptions) -> Result<RepairReport, DatastoreError> {
        let articles = query_all(
            self.store.as_ref(),
            ARTICLES_TABLE,
            &Filter::all().select(&["id", "url", "image_url"]),
            self.page_size,
        )
        .await?;
        let article_urls: HashMap<RowId, String> = articles
            .iter()
            .filter_map(|row| Some((RowId::from_row(row)?, str_field(row, "url")?)))
            .collect();

        let mut resolved_pages: HashMap<String, Option<String>> = HashMap::new();

        let mut article_report = TableRepair::default();
        for row in &articles {
            let (Some(id), Some(url)) = (RowId::from_row(row), str_field(row, "url")) else {
                continue;
            };
            self.repair_row(
                ARTICLES_TABLE,
                &id,
                row,
                &url,
                options,
                &mut resolved_pages,
                &mut article_report,
            )
            .await;
        }

        let enrichment_filter = if options.verify_existing {
            Filter::all()
        } else {
            Filter::all().is_null("image_url")
        };
        let enrichments = query_all(
            self.store.as_ref(),
            ENRICHMENTS_TABLE,
            &enrichment_filter.select(&["id", "article_id", "image_url"]),
            self.page_size,
        )
        .await?;

        let mut enrichment_report = TableRepair::default();
        for row in &enrichments {
            let Some(id) = RowId::from_row(row) else {
                continue;
            };
            let parent_url = row
                .get("article_id")
                .cloned()
                .and_then(|v| serde_json::from_value::<RowId>(v).ok())
                .and_then(|parent| article_urls.get(&parent).cloned());
            let Some(parent_url) = parent_url else {
                debug!(%id, "enrichment without a known parent article");
                continue;
            };
            self.repair_row(
                ENRICHMENTS_TABLE,
                &id,
                row,
                &parent_url,
                options,
                &mut resolved_pages,
                &mut enrichment_report,
            )
            .await;
        }

        let report = RepairReport {
            articles: article_report,
            enrichments: enrichment_report,
        };
        info!(
            articles_fixed = report.articles.fixed,
            articles_unresolved = report.articles.unresolved,
            enrichments_fixed = report.enrichments.fixed,
            enrichments_unresolved = report.enrichments.unresolved,
            "image repair finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn repair_row(
        &self,
        table: &str,
        id: &RowId,
        row: &Row,
        page_url: &str,
        options: RepairOptions,
        resolved_pages: &mut HashMap<String, Option<String>>,
        tally: &mut TableRepair,
    ) {
        let current = str_field(row, "image_url");
        match &current {
            Some(_) if !options.verify_existing => return,
            Some(image) => {
                tally.checked += 1;
                if self.resolver.is_reachable(image).await {
                    return;
                }
            }
            None => tally.checked += 1,
        }
        tally.broken += 1;

        let replacement = match resolved_pages.get(page_url) {
            Some(cached) => cached.clone(),
            None => {
                let found = match self.resolver.resolve(page_url).await {
                    Ok(found) => Some(found.url),
                    Err(err) => {
                        debug!(page = page_url, error = %err, "no replacement image");
                        None
                    }
                };
                resolved_pages.insert(page_url.to_string(), found.clone());
                found
            }
        };
        let Some(replacement) = replacement.filter(|r| Some(r) != current.as_ref()) else {
            tally.unresolved += 1;
            return;
        };

        let mut patch = Row::new();
        patch.insert("image_url".to_string(), JsonValue::from(replacement));
        match self.store.update(table, id, patch).await {
            Ok(()) => tally.fixed += 1,
            Err(err) => {
                warn!(table, %id, error = %err, "image update failed");
                tally.failed += 1;
            }
        }
    }
}

fn str_field(row: &Row, key: &str) -> Option<String> {
    row.get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainews_storage::{HttpClientConfig, HttpFetcher, MemoryDatastore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn resolver() -> ImageResolver {
        ImageResolver::new(Arc::new(
            HttpFetcher::new(HttpClientConfig {
                host_delay: Duration::ZERO,
                ..Default::default()
            })
            .unwrap(),
        ))
    }

    async fn page_with_og_image(server: &MockServer, page: &str, image: &str) {
        Mock::given(method("GET"))
            .and(path(page.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<meta property="og:image" content="{image}">"#
            )))
            .mount(server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(image.to_string()))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn missing_images_are_filled_from_the_right_page() {
        let server = MockServer::start().await;
        page_with_og_image(&server, "/p/one", "/img/one.png").await;
        Mock::given(method("GET"))
            .and(path("/p/two"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>no images</p>"))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryDatastore::new());
        let one = format!("{}/p/one", server.uri());
        let two = format!("{}/p/two", server.uri());
        store
            .insert(ARTICLES_TABLE, row(json!({"id": "a1", "url": one})))
            .await
            .unwrap();
        store
            .insert(
                ARTICLES_TABLE,
                row(json!({"id": "a2", "url": two, "image_url": "https://kept.example/x.png"})),
            )
            .await
            .unwrap();
        store
            .insert(
                ARTICLES_TABLE,
                row(json!({"id": "a3", "url": two})),
            )
            .await
            .unwrap();
        for (id, parent) in [(1, "a1"), (2, "a1"), (3, "a3")] {
            store
                .insert(
                    ENRICHMENTS_TABLE,
                    row(json!({"id": id, "article_id": parent, "image_url": null})),
                )
                .await
                .unwrap();
        }

        let report = ImageRepair::new(store.clone(), resolver())
            .run(RepairOptions::default())
            .await
            .unwrap();

        assert_eq!(
            report.articles,
            TableRepair {
                checked: 2,
                broken: 2,
                fixed: 1,
                unresolved: 1,
                failed: 0
            }
        );
        assert_eq!(report.enrichments.fixed, 2);
        assert_eq!(report.enrichments.unresolved, 1);

        let expected = format!("{}/img/one.png", server.uri());
        let articles = store.rows(ARTICLES_TABLE);
        assert_eq!(articles[0]["image_url"], expected.as_str());
        assert_eq!(articles[1]["image_url"], "https://kept.example/x.png");
        let enrichments = store.rows(ENRICHMENTS_TABLE);
        assert_eq!(enrichments[0]["image_url"], expected.as_str());
        assert_eq!(enrichments[2]["image_url"], JsonValue::Null);
    }

    /// Returns at most `cap` rows per listing, like a server-side max-rows.
    struct CappedDatastore {
        inner: MemoryDatastore,
        cap: usize,
    }

    #[async_trait]
    impl Datastore for CappedDatastore {
        async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, DatastoreError> {
            let mut rows = self.inner.query(table, filter).await?;
            rows.truncate(self.cap);
            Ok(rows)
        }

        async fn insert(&self, table: &str, row: Row) -> Result<Row, DatastoreError> {
            self.inner.insert(table, row).await
        }

        async fn upsert(
            &self,
            table: &str,
            row: Row,
            conflict_key: &str,
        ) -> Result<Row, DatastoreError> {
            self.inner.upsert(table, row, conflict_key).await
        }

        async fn update(&self, table: &str, id: &RowId, patch: Row) -> Result<(), DatastoreError> {
            self.inner.update(table, id, patch).await
        }

        async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, DatastoreError> {
            self.inner.delete(table, filter).await
        }
    }

    #[tokio::test]
    async fn sweep_pages_past_the_server_row_cap() {
        let server = MockServer::start().await;
        page_with_og_image(&server, "/p/any", "/img/any.png").await;
        let page = format!("{}/p/any", server.uri());

        let inner = MemoryDatastore::new();
        for n in 0..7 {
            inner
                .insert(
                    ARTICLES_TABLE,
                    row(json!({"id": format!("a{n}"), "url": format!("{page}?n={n}")})),
                )
                .await
                .unwrap();
            inner
                .insert(
                    ENRICHMENTS_TABLE,
                    row(json!({"id": n, "article_id": format!("a{n}"), "image_url": null})),
                )
                .await
                .unwrap();
        }
        let store = Arc::new(CappedDatastore { inner, cap: 3 });

        let report = ImageRepair::new(store.clone(), resolver())
            .with_page_size(3)
            .run(RepairOptions::default())
            .await
            .unwrap();

        assert_eq!(report.articles.checked, 7);
        assert_eq!(report.articles.fixed, 7);
        assert_eq!(report.enrichments.fixed, 7);
        assert!(store
            .inner
            .rows(ENRICHMENTS_TABLE)
            .iter()
            .all(|r| r["image_url"].is_string()));
    }

    #[tokio::test]
    async fn verify_existing_replaces_dead_images_only() {
        let server = MockServer::start().await;
        page_with_og_image(&server, "/p/one", "/img/fresh.png").await;
        Mock::given(method("HEAD"))
            .and(path("/img/dead.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/img/alive.png"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryDatastore::new());
        let one = format!("{}/p/one", server.uri());
        store
            .insert(
                ARTICLES_TABLE,
                row(json!({"id": "a1", "url": one, "image_url": format!("{}/img/dead.png", server.uri())})),
            )
            .await
            .unwrap();
        store
            .insert(
                ARTICLES_TABLE,
                row(json!({"id": "a2", "url": one, "image_url": format!("{}/img/alive.png", server.uri())})),
            )
            .await
            .unwrap();

        let report = ImageRepair::new(store.clone(), resolver())
            .run(RepairOptions {
                verify_existing: true,
            })
            .await
            .unwrap();

        assert_eq!(report.articles.checked, 2);
        assert_eq!(report.articles.broken, 1);
        assert_eq!(report.articles.fixed, 1);
        let rows = store.rows(ARTICLES_TABLE);
        assert_eq!(rows[0]["image_url"], format!("{}/img/fresh.png", server.uri()).as_str());
        assert_eq!(rows[1]["image_url"], format!("{}/img/alive.png", server.uri()).as_str());
    }
}
