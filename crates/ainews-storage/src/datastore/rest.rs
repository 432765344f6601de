use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use url::Url;

use super::{Datastore, DatastoreError, Filter, Row, RowId};

const RETURN_ROWS: &str = "return=representation";
const MERGE_AND_RETURN: &str = "resolution=merge-duplicates,return=representation";
const EXACT_COUNT: &str = "count=exact";

/// PostgREST-style client (`{base}/rest/v1/{table}`), authenticated with a
/// service key sent as both `apikey` and bearer token.
#[derive(Debug, Clone)]
pub struct RestDatastore {
    client: reqwest::Client,
    rest_root: Url,
    service_key: SecretString,
}

impl RestDatastore {
    pub fn new(
        base_url: &str,
        service_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, DatastoreError> {
        let mut base = Url::parse(base_url.trim())?;
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            rest_root: base.join("rest/v1/")?,
            service_key,
        })
    }

    fn request(&self, method: Method, table: &str) -> Result<RequestBuilder, DatastoreError> {
        let url = self.rest_root.join(table)?;
        let key = self.service_key.expose_secret();
        Ok(self
            .client
            .request(method, url)
            .header("apikey", key)
            .bearer_auth(key))
    }

    async fn checked(table: &str, resp: Response) -> Result<Response, DatastoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DatastoreError::Status {
            table: table.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn rows(table: &str, resp: Response) -> Result<Vec<Row>, DatastoreError> {
        let resp = Self::checked(table, resp).await?;
        Ok(resp.json::<Vec<Row>>().await?)
    }

    /// Total from a `Content-Range` value such as `0-24/3573` or `*/0`.
    fn range_total(value: &str) -> Option<usize> {
        value.rsplit_once('/')?.1.trim().parse().ok()
    }

    fn first_row(
        table: &str,
        operation: &'static str,
        rows: Vec<Row>,
    ) -> Result<Row, DatastoreError> {
        rows.into_iter()
            .next()
            .ok_or_else(|| DatastoreError::MissingRow {
                table: table.to_string(),
                operation,
            })
    }
}

#[async_trait]
impl Datastore for RestDatastore {
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, DatastoreError> {
        let resp = self
            .request(Method::GET, table)?
            .query(&[("select", filter.select_param())])
            .query(&filter.to_query_pairs())
            .send()
            .await?;
        let rows = Self::rows(table, resp).await?;
        debug!(table, count = rows.len(), "datastore query");
        Ok(rows)
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<usize, DatastoreError> {
        let resp = self
            .request(Method::HEAD, table)?
            .query(&[("select", "id")])
            .query(&filter.to_query_pairs())
            .header("Prefer", EXACT_COUNT)
            .send()
            .await?;
        let resp = Self::checked(table, resp).await?;
        let total = resp
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::range_total)
            .ok_or_else(|| DatastoreError::MissingCount {
                table: table.to_string(),
            })?;
        debug!(table, total, "datastore count");
        Ok(total)
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, DatastoreError> {
        let resp = self
            .request(Method::POST, table)?
            .header("Prefer", RETURN_ROWS)
            .json(&[row])
            .send()
            .await?;
        let rows = Self::rows(table, resp).await?;
        Self::first_row(table, "insert", rows)
    }

    async fn upsert(
        &self,
        table: &str,
        row: Row,
        conflict_key: &str,
    ) -> Result<Row, DatastoreError> {
        let resp = self
            .request(Method::POST, table)?
            .query(&[("on_conflict", conflict_key)])
            .header("Prefer", MERGE_AND_RETURN)
            .json(&[row])
            .send()
            .await?;
        let rows = Self::rows(table, resp).await?;
        Self::first_row(table, "upsert", rows)
    }

    async fn update(&self, table: &str, id: &RowId, patch: Row) -> Result<(), DatastoreError> {
        let resp = self
            .request(Method::PATCH, table)?
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(&patch)
            .send()
            .await?;
        Self::checked(table, resp).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, DatastoreError> {
        let resp = self
            .request(Method::DELETE, table)?
            .query(&filter.to_query_pairs())
            .header("Prefer", RETURN_ROWS)
            .send()
            .await?;
        let removed = Self::rows(table, resp).await?.len();
        debug!(table, removed, "datastore delete");
        Ok(removed)
    }
}
