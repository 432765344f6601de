//! Sync pipeline orchestration: sources → normalize → recency → images →
//! one batch reconciliation, bounded by a run deadline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ainews_adapters::{build_adapter, AdapterSpec, ImageResolver, ItemOrdering, SourceKind};
use ainews_core::{ArticleBundle, ErrorKind, ModelError, RunId, RunIssue, Source};
use ainews_storage::{
    ArtifactStore, Datastore, DatastoreError, Filter, HttpClientConfig, HttpFetcher,
    RestDatastore,
};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub mod normalize;
pub mod recency;
pub mod repair;
pub mod report;
pub mod upsert;

pub use normalize::{complete_image, normalize, ImageOutcome, RejectReason};
pub use recency::RecencyFilter;
pub use repair::{ImageRepair, RepairOptions, RepairReport, TableRepair};
pub use upsert::{
    memory_store, ArticleCounts, ArticleOutcome, ArticleResult, BatchReport, EnrichmentCounts,
    UpsertEngine, ARTICLES_TABLE, ENRICHMENTS_TABLE,
};

pub const CRATE_NAME: &str = "ainews-sync";

pub const DEFAULT_SCHEDULE_CRON: &str = "0 0 0 * * *";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default)]
    pub default_author: Option<String>,
    #[serde(default)]
    pub default_tags: Vec<String>,
    #[serde(default)]
    pub max_items: Option<usize>,
}

impl SourceConfig {
    pub fn adapter_spec(&self) -> Result<AdapterSpec, ModelError> {
        Ok(AdapterSpec {
            source: self.source_id.parse()?,
            kind: self.kind,
            url: self.url.clone(),
            default_author: self.default_author.clone(),
            default_tags: self.default_tags.clone(),
            max_items: self.max_items,
        })
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Specs for enabled sources in file order. Unknown ids are an error
    /// rather than a silently skipped source.
    pub fn enabled_specs(&self) -> Result<Vec<AdapterSpec>> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| {
                s.adapter_spec()
                    .with_context(|| format!("source {:?} ({})", s.source_id, s.display_name))
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub sources_path: PathBuf,
    pub datastore_url: Option<String>,
    pub datastore_key: Option<SecretString>,
    pub reports_dir: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub host_delay: Duration,
    pub freshness_hours: i64,
    pub run_timeout: Duration,
    pub source_concurrency: usize,
    pub schedule_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let workspace_root = lookup("AINEWS_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            sources_path: workspace_root.join("sources.yaml"),
            datastore_url: lookup("AINEWS_DATASTORE_URL").filter(|v| !v.trim().is_empty()),
            datastore_key: lookup("AINEWS_DATASTORE_KEY")
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            reports_dir: lookup("AINEWS_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            artifacts_dir: lookup("AINEWS_ARTIFACTS_DIR").map(PathBuf::from),
            user_agent: lookup("AINEWS_USER_AGENT")
                .unwrap_or_else(|| format!("ainews-ingest/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout: Duration::from_secs(parsed("AINEWS_HTTP_TIMEOUT_SECS").unwrap_or(10)),
            host_delay: Duration::from_millis(parsed("AINEWS_HOST_DELAY_MS").unwrap_or(500)),
            freshness_hours: parsed("AINEWS_FRESHNESS_HOURS")
                .and_then(|h| i64::try_from(h).ok())
                .filter(|h| (1..=recency::MAX_WINDOW_HOURS).contains(h))
                .unwrap_or(recency::DEFAULT_WINDOW_HOURS),
            run_timeout: Duration::from_secs(parsed("AINEWS_RUN_TIMEOUT_SECS").unwrap_or(600)),
            source_concurrency: parsed("AINEWS_SOURCE_CONCURRENCY")
                .map(|n| n as usize)
                .unwrap_or(1)
                .max(1),
            schedule_cron: lookup("AINEWS_SCHEDULE_CRON")
                .unwrap_or_else(|| DEFAULT_SCHEDULE_CRON.to_string()),
            workspace_root,
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            host_delay: self.host_delay,
            ..Default::default()
        }
    }

    pub fn recency(&self) -> RecencyFilter {
        RecencyFilter::hours(self.freshness_hours)
    }

    pub fn connect_datastore(&self) -> Result<RestDatastore> {
        let url = self
            .datastore_url
            .as_deref()
            .context("AINEWS_DATASTORE_URL is not set")?;
        let key = self
            .datastore_key
            .as_ref()
            .context("AINEWS_DATASTORE_KEY is not set")?;
        RestDatastore::new(
            url,
            SecretString::from(key.expose_secret().to_string()),
            self.http_timeout,
        )
        .context("configuring datastore client")
    }
}

/// Per-source tallies. `finished` stays false if the run deadline hit
/// before the source completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub source: Source,
    pub finished: bool,
    pub seen: usize,
    pub accepted: usize,
    pub stale: usize,
    pub skipped: usize,
    pub image_unresolved: usize,
    pub error: Option<String>,
}

impl SourceStats {
    fn pending(source: Source) -> Self {
        Self {
            source,
            finished: false,
            seen: 0,
            accepted: 0,
            stale: 0,
            skipped: 0,
            image_unresolved: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub sources: Vec<SourceStats>,
    pub articles: ArticleCounts,
    pub enrichments: EnrichmentCounts,
    pub duplicates_in_batch: usize,
    pub results: Vec<ArticleResult>,
    pub issues: Vec<RunIssue>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        !self.issues.iter().any(|i| i.kind.fails_run())
    }

    pub fn source(&self, source: Source) -> Option<&SourceStats> {
        self.sources.iter().find(|s| s.source == source)
    }

    pub fn issue_count(&self, kind: ErrorKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }
}

struct SourceHarvest {
    stats: SourceStats,
    bundles: Vec<ArticleBundle>,
    issues: Vec<RunIssue>,
}

/// State that survives a run being cut off by its deadline.
struct RunProgress {
    sources: Vec<SourceStats>,
    issues: Vec<RunIssue>,
    batch: BatchReport,
}

impl RunProgress {
    fn new(specs: &[AdapterSpec]) -> Self {
        Self {
            sources: specs.iter().map(|s| SourceStats::pending(s.source)).collect(),
            issues: Vec::new(),
            batch: BatchReport::default(),
        }
    }

    fn absorb(&mut self, harvest: SourceHarvest) -> Vec<ArticleBundle> {
        match self
            .sources
            .iter_mut()
            .find(|s| s.source == harvest.stats.source && !s.finished)
        {
            Some(slot) => *slot = harvest.stats,
            None => self.sources.push(harvest.stats),
        }
        self.issues.extend(harvest.issues);
        harvest.bundles
    }

    fn into_summary(
        self,
        run_id: RunId,
        started_at: DateTime<Utc>,
        status: RunStatus,
    ) -> RunSummary {
        let mut issues = self.issues;
        issues.extend(self.batch.issues);
        RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            sources: self.sources,
            articles: self.batch.articles,
            enrichments: self.batch.enrichments,
            duplicates_in_batch: self.batch.duplicates_in_batch,
            results: self.batch.results,
            issues,
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    images: ImageResolver,
    engine: UpsertEngine,
    recency: RecencyFilter,
    artifacts: Option<ArtifactStore>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn Datastore>) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_config())?);
        Ok(Self {
            images: ImageResolver::new(Arc::clone(&http)),
            engine: UpsertEngine::new(store),
            recency: config.recency(),
            artifacts: config.artifacts_dir.clone().map(ArtifactStore::new),
            http,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn http(&self) -> Arc<HttpFetcher> {
        Arc::clone(&self.http)
    }

    /// Loads the source registry, runs every enabled source, and writes the
    /// run reports. Only configuration problems are returned as errors.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let registry = SourceRegistry::load(&self.config.sources_path).await?;
        let specs = registry.enabled_specs()?;
        let summary = self.run_specs(&specs).await;

        match report::write_reports(&self.config.reports_dir, &summary).await {
            Ok(dir) => debug!(dir = %dir.display(), "run reports written"),
            Err(err) => warn!(error = %err, "writing run reports failed"),
        }
        Ok(summary)
    }

    pub async fn run_specs(&self, specs: &[AdapterSpec]) -> RunSummary {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let mut progress = RunProgress::new(specs);

        let run = tokio::time::timeout(
            self.config.run_timeout,
            self.run_inner(specs, started_at, &mut progress),
        )
        .instrument(info_span!("sync_run", %run_id));
        let status = match run.await {
            Ok(()) => RunStatus::Completed,
            Err(_) => {
                warn!(%run_id, timeout_secs = self.config.run_timeout.as_secs(), "run deadline reached");
                progress.issues.push(RunIssue::new(
                    ErrorKind::RunTimeout,
                    format!(
                        "run exceeded its {}s deadline",
                        self.config.run_timeout.as_secs_f64()
                    ),
                ));
                RunStatus::TimedOut
            }
        };

        let summary = progress.into_summary(run_id, started_at, status);
        info!(
            %run_id,
            status = ?summary.status,
            inserted = summary.articles.inserted,
            updated = summary.articles.updated,
            failed = summary.articles.failed,
            issues = summary.issues.len(),
            "sync run finished"
        );
        summary
    }

    async fn run_inner(
        &self,
        specs: &[AdapterSpec],
        now: DateTime<Utc>,
        progress: &mut RunProgress,
    ) {
        let pending: Vec<_> = specs
            .iter()
            .map(|spec| self.harvest_source(spec, now))
            .collect();
        let mut harvests = std::pin::pin!(
            stream::iter(pending).buffered(self.config.source_concurrency.max(1))
        );

        let mut batch = Vec::new();
        while let Some(harvest) = harvests.next().await {
            batch.extend(progress.absorb(harvest));
        }
        self.engine.reconcile_into(batch, &mut progress.batch).await;
    }

    async fn harvest_source(&self, spec: &AdapterSpec, now: DateTime<Utc>) -> SourceHarvest {
        let source = spec.source;
        async {
            let mut harvest = SourceHarvest {
                stats: SourceStats::pending(source),
                bundles: Vec::new(),
                issues: Vec::new(),
            };
            let adapter = build_adapter(spec);

            let mut items = match adapter.open(self.http()).await {
                Ok(items) => items,
                Err(err) => {
                    warn!(error = %err, "source unavailable");
                    harvest.stats.error = Some(err.to_string());
                    harvest.stats.finished = true;
                    harvest.issues.push(
                        RunIssue::new(ErrorKind::SourceUnavailable, err.to_string())
                            .for_source(source)
                            .about(spec.url.clone()),
                    );
                    return harvest;
                }
            };

            let newest_first = adapter.ordering() == ItemOrdering::NewestFirst;
            let mut normalized = Vec::new();
            while let Some(next) = items.next().await {
                harvest.stats.seen += 1;
                let bundle = match next {
                    Ok(raw) => normalize(source, raw, now).map_err(|reason| {
                        (reason.subject(), reason.to_string())
                    }),
                    Err(err) => Err((err.subject().to_string(), err.to_string())),
                };
                let bundle = match bundle {
                    Ok(bundle) => bundle,
                    Err((subject, detail)) => {
                        debug!(%subject, %detail, "item skipped");
                        harvest.stats.skipped += 1;
                        harvest.issues.push(
                            RunIssue::new(ErrorKind::ParseSkip, detail)
                                .for_source(source)
                                .about(subject),
                        );
                        continue;
                    }
                };
                if newest_first && !self.recency.is_fresh(bundle.article.published_date, now) {
                    debug!(url = %bundle.article.url, "first stale item; not reading further");
                    harvest.stats.stale += 1;
                    break;
                }
                normalized.push(bundle);
            }
            drop(items);

            let (mut fresh, stale) = self.recency.retain(normalized, now);
            harvest.stats.stale += stale;

            for bundle in &mut fresh {
                if let ImageOutcome::Unresolved(detail) = complete_image(bundle, &self.images).await
                {
                    harvest.stats.image_unresolved += 1;
                    harvest.issues.push(
                        RunIssue::new(ErrorKind::ImageUnresolved, detail)
                            .for_source(source)
                            .about(bundle.article.url.clone()),
                    );
                }
            }

            if let Some(artifacts) = &self.artifacts {
                if let Err(err) = artifacts.store_json(now, source.as_str(), &fresh).await {
                    warn!(error = %err, "storing source snapshot failed");
                }
            }

            harvest.stats.accepted = fresh.len();
            harvest.stats.finished = true;
            info!(
                seen = harvest.stats.seen,
                accepted = harvest.stats.accepted,
                stale = harvest.stats.stale,
                skipped = harvest.stats.skipped,
                "source harvested"
            );
            harvest.bundles = fresh;
            harvest
        }
        .instrument(info_span!("source", %source))
        .await
    }
}

/// Cron-driven runs in-process; each tick performs one full `run_once`.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config.schedule_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    status = ?summary.status,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync could not start"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub total_articles: usize,
    pub recent_articles: usize,
    pub cutoff: DateTime<Utc>,
}

/// Counts stored articles and those published within the freshness window.
pub async fn datastore_status(
    store: &dyn Datastore,
    recency: RecencyFilter,
    now: DateTime<Utc>,
) -> Result<StoreStatus, DatastoreError> {
    let cutoff = recency.cutoff(now);
    let total = store.count(ARTICLES_TABLE, &Filter::all()).await?;
    let recent = store
        .count(
            ARTICLES_TABLE,
            &Filter::all().gte(
                "published_date",
                cutoff.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        )
        .await?;
    Ok(StoreStatus {
        total_articles: total,
        recent_articles: recent,
        cutoff,
    })
}
