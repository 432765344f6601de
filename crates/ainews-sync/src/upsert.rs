//! Batch reconciliation against the datastore, keyed by article url.
//!
//! Every article is upserted (never skipped) so re-scrapes refresh drifted
//! titles, summaries, and images. Enrichment sets are replaced wholesale:
//! delete everything for the article, then insert the new set in position
//! order.

use std::collections::HashSet;
use std::sync::Arc;

use ainews_core::{Article, ArticleBundle, Enrichment, ErrorKind, RunIssue, Source};
use ainews_storage::{Datastore, DatastoreError, Filter, MemoryDatastore, Row, RowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

pub const ARTICLES_TABLE: &str = "articles";
pub const ENRICHMENTS_TABLE: &str = "article_enrichments";
pub const ARTICLE_CONFLICT_KEY: &str = "url";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleOutcome {
    Inserted,
    Updated,
    Failed,
}

impl ArticleOutcome {
    /// Taxonomy kind recorded against the outcome, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ArticleOutcome::Inserted => None,
            ArticleOutcome::Updated => Some(ErrorKind::DatastoreConflictHandled),
            ArticleOutcome::Failed => Some(ErrorKind::DatastoreWriteFailed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleCounts {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    /// Articles whose enrichment replacement did not fully land.
    pub partial: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentCounts {
    pub inserted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleResult {
    pub source: Source,
    pub url: String,
    pub outcome: ArticleOutcome,
    pub enrichments_written: Option<usize>,
    pub partial: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub articles: ArticleCounts,
    pub enrichments: EnrichmentCounts,
    pub duplicates_in_batch: usize,
    pub results: Vec<ArticleResult>,
    pub issues: Vec<RunIssue>,
}

/// Memory store carrying the constraints of `migrations/001_articles.sql`:
/// required columns, both unique keys, `source` fixed at first insert, and
/// the enrichment cascade.
pub fn memory_store() -> MemoryDatastore {
    MemoryDatastore::new()
        .with_required(ARTICLES_TABLE, &["source", "url", "published_date"])
        .with_unique(ARTICLES_TABLE, &[ARTICLE_CONFLICT_KEY])
        .with_immutable(ARTICLES_TABLE, &["source"])
        .with_required(ENRICHMENTS_TABLE, &["article_id", "title", "position"])
        .with_unique(ENRICHMENTS_TABLE, &["article_id", "position"])
        .with_cascade(ARTICLES_TABLE, ENRICHMENTS_TABLE, "article_id")
}

/// Collapses repeated urls, keeping the first occurrence.
pub fn dedupe_batch(batch: Vec<ArticleBundle>) -> (Vec<ArticleBundle>, usize) {
    let mut seen = HashSet::new();
    let before = batch.len();
    let unique: Vec<_> = batch
        .into_iter()
        .filter(|b| seen.insert(b.article.url.clone()))
        .collect();
    let duplicates = before - unique.len();
    (unique, duplicates)
}

/// Row shape of an article. A missing image is left out so an upsert never
/// clears an image filled in by an earlier run or repair sweep.
pub fn article_row(article: &Article) -> Result<Row, DatastoreError> {
    let value = serde_json::to_value(article).map_err(|e| DatastoreError::InvalidRow {
        table: ARTICLES_TABLE.to_string(),
        reason: e.to_string(),
    })?;
    let JsonValue::Object(mut row) = value else {
        return Err(DatastoreError::InvalidRow {
            table: ARTICLES_TABLE.to_string(),
            reason: "article did not serialize to an object".to_string(),
        });
    };
    if row.get("image_url").is_some_and(JsonValue::is_null) {
        row.remove("image_url");
    }
    Ok(row)
}

pub fn enrichment_row(article_id: &RowId, enrichment: &Enrichment) -> Row {
    let mut row = Row::new();
    row.insert("article_id".to_string(), article_id.to_json());
    row.insert("title".to_string(), JsonValue::from(enrichment.title.clone()));
    row.insert("summary".to_string(), JsonValue::from(enrichment.summary.clone()));
    row.insert("content".to_string(), JsonValue::from(enrichment.content.clone()));
    row.insert(
        "image_url".to_string(),
        enrichment
            .image_url
            .clone()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::Null),
    );
    row.insert("position".to_string(), JsonValue::from(enrichment.position));
    row
}

pub struct UpsertEngine {
    store: Arc<dyn Datastore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    pub async fn reconcile(&self, batch: Vec<ArticleBundle>) -> BatchReport {
        let mut report = BatchReport::default();
        self.reconcile_into(batch, &mut report).await;
        report
    }

    /// Writes one article at a time, recording each outcome into `report` as
    /// it lands so that an interrupted batch still reports committed work.
    pub async fn reconcile_into(&self, batch: Vec<ArticleBundle>, report: &mut BatchReport) {
        let (batch, duplicates) = dedupe_batch(batch);
        report.duplicates_in_batch += duplicates;
        if duplicates > 0 {
            debug!(duplicates, "collapsed repeated urls in batch");
        }

        for bundle in batch {
            let source = bundle.article.source;
            let url = bundle.article.url.clone();

            let (article_id, existed) = match self.upsert_article(&bundle.article).await {
                Ok(done) => done,
                Err(err) => {
                    warn!(%url, error = %err, "article write failed");
                    report.articles.failed += 1;
                    report.issues.push(
                        RunIssue::new(ErrorKind::DatastoreWriteFailed, err.to_string())
                            .for_source(source)
                            .about(url.clone()),
                    );
                    report.results.push(ArticleResult {
                        source,
                        url,
                        outcome: ArticleOutcome::Failed,
                        enrichments_written: None,
                        partial: false,
                    });
                    continue;
                }
            };
            let outcome = if existed {
                report.articles.updated += 1;
                ArticleOutcome::Updated
            } else {
                report.articles.inserted += 1;
                ArticleOutcome::Inserted
            };

            let mut result = ArticleResult {
                source,
                url,
                outcome,
                enrichments_written: None,
                partial: false,
            };
            if let Some(enrichments) = &bundle.enrichments {
                let written = self
                    .replace_enrichments(&article_id, enrichments, &mut result, report)
                    .await;
                result.enrichments_written = Some(written);
                if result.partial {
                    report.articles.partial += 1;
                }
            }
            report.results.push(result);
        }

        info!(
            inserted = report.articles.inserted,
            updated = report.articles.updated,
            failed = report.articles.failed,
            partial = report.articles.partial,
            enrichments_inserted = report.enrichments.inserted,
            enrichments_failed = report.enrichments.failed,
            "batch reconciled"
        );
    }

    /// Looks the url up, then upserts on the url conflict key. Returns the
    /// stored id and whether the row already existed. The full row is always
    /// sent; the schema keeps the first `source`.
    async fn upsert_article(&self, article: &Article) -> Result<(RowId, bool), DatastoreError> {
        let lookup = Filter::all()
            .eq(ARTICLE_CONFLICT_KEY, article.url.as_str())
            .select(&["id"]);
        let existed = !self.store.query(ARTICLES_TABLE, &lookup).await?.is_empty();

        let stored = self
            .store
            .upsert(ARTICLES_TABLE, article_row(article)?, ARTICLE_CONFLICT_KEY)
            .await?;
        let id = RowId::from_row(&stored).ok_or_else(|| DatastoreError::MissingId {
            table: ARTICLES_TABLE.to_string(),
        })?;
        debug!(url = %article.url, %id, existed, "article upserted");
        Ok((id, existed))
    }

    /// Returns the number of enrichment rows written.
    async fn replace_enrichments(
        &self,
        article_id: &RowId,
        enrichments: &[Enrichment],
        result: &mut ArticleResult,
        report: &mut BatchReport,
    ) -> usize {
        let existing = Filter::all().eq("article_id", article_id.to_json());
        if let Err(err) = self.store.delete(ENRICHMENTS_TABLE, &existing).await {
            warn!(url = %result.url, error = %err, "clearing enrichments failed; keeping old set");
            report.enrichments.failed += enrichments.len();
            result.partial = true;
            report.issues.push(
                RunIssue::new(
                    ErrorKind::DatastoreWriteFailed,
                    format!("clearing enrichments: {err}"),
                )
                .for_source(result.source)
                .about(result.url.clone()),
            );
            return 0;
        }

        let mut ordered: Vec<&Enrichment> = enrichments.iter().collect();
        ordered.sort_by_key(|e| e.position);

        let mut written = 0;
        for enrichment in ordered {
            match self
                .store
                .insert(ENRICHMENTS_TABLE, enrichment_row(article_id, enrichment))
                .await
            {
                Ok(_) => {
                    written += 1;
                    report.enrichments.inserted += 1;
                }
                Err(err) => {
                    warn!(
                        url = %result.url,
                        position = enrichment.position,
                        error = %err,
                        "enrichment insert failed"
                    );
                    report.enrichments.failed += 1;
                    result.partial = true;
                    report.issues.push(
                        RunIssue::new(ErrorKind::DatastoreWriteFailed, err.to_string())
                            .for_source(result.source)
                            .about(format!("{}#{}", result.url, enrichment.position)),
                    );
                }
            }
        }
        written
    }
}
