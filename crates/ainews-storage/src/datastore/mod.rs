//! Datastore client contract. Rows are JSON objects; the typed article and
//! enrichment mapping lives with the upsert engine.

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod memory;
mod rest;

pub use memory::MemoryDatastore;
pub use rest::RestDatastore;

pub type Row = serde_json::Map<String, JsonValue>;

/// Primary key of a stored row; uuid-keyed and serial-keyed tables both occur.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowId {
    Int(i64),
    Text(String),
}

impl RowId {
    pub fn from_row(row: &Row) -> Option<Self> {
        row.get("id")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            RowId::Int(n) => JsonValue::from(*n),
            RowId::Text(s) => JsonValue::from(s.clone()),
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowId::Int(n) => write!(f, "{n}"),
            RowId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, JsonValue),
    IsNull(String),
    Gte(String, JsonValue),
}

impl Condition {
    fn column(&self) -> &str {
        match self {
            Condition::Eq(c, _) | Condition::IsNull(c) | Condition::Gte(c, _) => c,
        }
    }

    fn matches(&self, row: &Row) -> bool {
        let value = row.get(self.column()).unwrap_or(&JsonValue::Null);
        match self {
            Condition::Eq(_, expected) => value == expected,
            Condition::IsNull(_) => value.is_null(),
            Condition::Gte(_, bound) => {
                matches!(compare_values(value, bound), Some(Ordering::Greater | Ordering::Equal))
            }
        }
    }

    /// PostgREST operator syntax, e.g. `eq.foo`, `is.null`.
    fn operator_param(&self) -> String {
        match self {
            Condition::Eq(_, JsonValue::Null) | Condition::IsNull(_) => "is.null".to_string(),
            Condition::Eq(_, v) => format!("eq.{}", plain_value(v)),
            Condition::Gte(_, v) => format!("gte.{}", plain_value(v)),
        }
    }
}

fn plain_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Timestamps compare chronologically, numbers numerically, strings lexically.
fn compare_values(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::String(x), JsonValue::String(y)) => {
            match (
                DateTime::parse_from_rfc3339(x).map(|d| d.with_timezone(&Utc)),
                DateTime::parse_from_rfc3339(y).map(|d| d.with_timezone(&Utc)),
            ) {
                (Ok(dx), Ok(dy)) => Some(dx.cmp(&dy)),
                _ => Some(x.cmp(y)),
            }
        }
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        _ => None,
    }
}

/// Conjunction of column conditions plus an optional column projection and
/// result window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
    columns: Option<Vec<String>>,
    order: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<JsonValue>) -> Self {
        self.conditions
            .push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::IsNull(column.to_string()));
        self
    }

    pub fn gte(mut self, column: &str, value: impl Into<JsonValue>) -> Self {
        self.conditions
            .push(Condition::Gte(column.to_string(), value.into()));
        self
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Ascending order on `column`; needed for stable paging.
    pub fn order_by(mut self, column: &str) -> Self {
        self.order = Some(column.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }

    /// Query-string pairs for a PostgREST endpoint.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .conditions
            .iter()
            .map(|c| (c.column().to_string(), c.operator_param()))
            .collect();
        if let Some(column) = &self.order {
            pairs.push(("order".to_string(), format!("{column}.asc")));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs
    }

    /// Applies the order and window to rows that already matched.
    fn window(&self, mut rows: Vec<Row>) -> Vec<Row> {
        if let Some(column) = &self.order {
            rows.sort_by(|a, b| {
                let null = JsonValue::Null;
                compare_values(a.get(column).unwrap_or(&null), b.get(column).unwrap_or(&null))
                    .unwrap_or(Ordering::Equal)
            });
        }
        rows.into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn select_param(&self) -> String {
        self.columns
            .as_ref()
            .map(|cols| cols.join(","))
            .unwrap_or_else(|| "*".to_string())
    }
}

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("datastore request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("datastore returned http {status} for {table}: {body}")]
    Status {
        table: String,
        status: u16,
        body: String,
    },
    #[error("duplicate value for unique column {column} in {table}")]
    Conflict { table: String, column: String },
    #[error("{operation} on {table} returned no row")]
    MissingRow {
        table: String,
        operation: &'static str,
    },
    #[error("row from {table} has no usable id")]
    MissingId { table: String },
    #[error("invalid row for {table}: {reason}")]
    InvalidRow { table: String, reason: String },
    #[error("count of {table} came back without a usable Content-Range")]
    MissingCount { table: String },
    #[error("invalid datastore url: {0}")]
    Url(#[from] url::ParseError),
}

impl DatastoreError {
    /// Unique-key violations surface as 409 over REST.
    pub fn is_conflict(&self) -> bool {
        match self {
            DatastoreError::Conflict { .. } => true,
            DatastoreError::Status { status, .. } => *status == 409,
            _ => false,
        }
    }
}

/// The only path to persistent storage. Every call is one stateless
/// request/response; nothing spans multiple calls.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, DatastoreError>;

    /// Number of rows matching `filter`, ignoring any window. Stores whose
    /// listings are capped must override this.
    async fn count(&self, table: &str, filter: &Filter) -> Result<usize, DatastoreError> {
        let rows = self.query(table, &filter.clone().select(&["id"])).await?;
        Ok(rows.len())
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, DatastoreError>;

    /// Insert, or merge into the row whose `conflict_key` column matches,
    /// keeping that row's id.
    async fn upsert(&self, table: &str, row: Row, conflict_key: &str)
        -> Result<Row, DatastoreError>;

    async fn update(&self, table: &str, id: &RowId, patch: Row) -> Result<(), DatastoreError>;

    /// Returns the number of rows removed.
    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, DatastoreError>;
}

pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Lists every matching row page by page, ordered by `id` unless the filter
/// names an order. All pages are read before returning, so callers may
/// update rows afterwards without shifting later pages.
pub async fn query_all(
    store: &dyn Datastore,
    table: &str,
    filter: &Filter,
    page_size: usize,
) -> Result<Vec<Row>, DatastoreError> {
    let page_size = page_size.max(1);
    let mut base = filter.clone();
    if base.order.is_none() {
        base = base.order_by("id");
    }

    let mut rows = Vec::new();
    loop {
        let page = store
            .query(
                table,
                &base.clone().limit(page_size).offset(rows.len()),
            )
            .await?;
        let short = page.len() < page_size;
        rows.extend(page);
        if short {
            return Ok(rows);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn filter_renders_postgrest_operators() {
        let filter = Filter::all()
            .eq("url", "https://example.com/a?b=c")
            .is_null("image_url")
            .gte("published_date", "2026-01-27T00:00:00Z")
            .select(&["id", "url"]);
        assert_eq!(
            filter.to_query_pairs(),
            vec![
                ("url".to_string(), "eq.https://example.com/a?b=c".to_string()),
                ("image_url".to_string(), "is.null".to_string()),
                (
                    "published_date".to_string(),
                    "gte.2026-01-27T00:00:00Z".to_string()
                ),
            ]
        );
        assert_eq!(filter.select_param(), "id,url");
        assert_eq!(Filter::all().select_param(), "*");
    }

    #[test]
    fn gte_compares_timestamps_chronologically() {
        let filter = Filter::all().gte("published_date", "2026-01-28T09:00:00Z");
        assert!(filter.matches(&row(json!({"published_date": "2026-01-28T09:00:00Z"}))));
        assert!(filter.matches(&row(json!({"published_date": "2026-01-28T10:00:00+01:00"}))));
        assert!(filter.matches(&row(json!({"published_date": "2026-01-28T09:00:00.500Z"}))));
        assert!(!filter.matches(&row(json!({"published_date": "2026-01-28T08:59:59Z"}))));
        assert!(!filter.matches(&row(json!({}))));
    }

    #[test]
    fn window_orders_and_pages_rows() {
        let filter = Filter::all().order_by("id").limit(2).offset(1);
        assert_eq!(
            filter.to_query_pairs(),
            vec![
                ("order".to_string(), "id.asc".to_string()),
                ("limit".to_string(), "2".to_string()),
                ("offset".to_string(), "1".to_string()),
            ]
        );
        let rows = vec![
            row(json!({"id": 3})),
            row(json!({"id": 1})),
            row(json!({"id": 4})),
            row(json!({"id": 2})),
        ];
        let ids: Vec<_> = filter
            .window(rows)
            .iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn query_all_reads_past_the_page_size() {
        let store = MemoryDatastore::new();
        for n in 0..7 {
            store
                .insert("articles", row(json!({"id": n, "url": format!("u{n}")})))
                .await
                .unwrap();
        }
        let rows = query_all(&store, "articles", &Filter::all(), 3).await.unwrap();
        assert_eq!(rows.len(), 7);
        assert_eq!(rows[6]["id"], 6);

        let exact = query_all(&store, "articles", &Filter::all(), 7).await.unwrap();
        assert_eq!(exact.len(), 7);
        assert_eq!(store.count("articles", &Filter::all()).await.unwrap(), 7);
    }

    #[test]
    fn row_ids_accept_serial_and_uuid_keys() {
        assert_eq!(RowId::from_row(&row(json!({"id": 7}))), Some(RowId::Int(7)));
        assert_eq!(
            RowId::from_row(&row(json!({"id": "9b2f"}))),
            Some(RowId::Text("9b2f".into()))
        );
        assert_eq!(RowId::from_row(&row(json!({"url": "x"}))), None);
    }
}
